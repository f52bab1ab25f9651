//! Streaming STT client
//!
//! One provider WebSocket per call. The socket is fed mu-law chunks and
//! emits transcript events; reconnects are never attempted inside a call -
//! one STT failure fails the media pipeline for that call.

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use outdial_config::SttConfig;

use crate::PipelineError;

/// Transcript events from the provider
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// Interim hypothesis; ignored by the dialogue engine
    Partial { text: String },
    /// Finalized utterance
    Final { text: String, confidence: f64 },
    /// The provider socket closed (end of stream or failure)
    Closed,
}

#[derive(Debug, Deserialize)]
struct ProviderResult {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    channel: Option<ProviderChannel>,
}

#[derive(Debug, Deserialize)]
struct ProviderChannel {
    #[serde(default)]
    alternatives: Vec<ProviderAlternative>,
}

#[derive(Debug, Deserialize)]
struct ProviderAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f64,
}

/// Sender half handed to the inbound task
#[derive(Clone)]
pub struct SttHandle {
    audio_tx: mpsc::Sender<Vec<u8>>,
}

impl SttHandle {
    /// Build a handle around a raw channel. Used by alternate backends
    /// and test fakes that want to observe the audio stream directly.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (audio_tx, audio_rx) = mpsc::channel(capacity);
        (Self { audio_tx }, audio_rx)
    }

    /// Queue one audio chunk towards the provider.
    ///
    /// Uses a non-blocking send: if the writer has fallen behind, the chunk
    /// is dropped rather than stalling the carrier read loop.
    pub fn send_audio(&self, chunk: Vec<u8>) {
        if let Err(e) = self.audio_tx.try_send(chunk) {
            tracing::debug!("Dropping STT chunk: {}", e);
        }
    }
}

/// Seam over STT connection establishment, so call flows can run against
/// a scripted transcript source in tests.
#[async_trait::async_trait]
pub trait SttConnector: Send + Sync {
    async fn connect(
        &self,
        cancel: watch::Receiver<bool>,
    ) -> Result<(SttHandle, mpsc::Receiver<SttEvent>), PipelineError>;
}

/// Production connector for the configured STT provider
pub struct ProviderSttConnector {
    config: SttConfig,
}

impl ProviderSttConnector {
    pub fn new(config: SttConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl SttConnector for ProviderSttConnector {
    async fn connect(
        &self,
        cancel: watch::Receiver<bool>,
    ) -> Result<(SttHandle, mpsc::Receiver<SttEvent>), PipelineError> {
        SttClient::connect(&self.config, cancel).await
    }
}

/// Streaming STT client
pub struct SttClient;

impl SttClient {
    /// Connect the provider socket for one call.
    ///
    /// Returns the audio handle and the event stream. Both spawned pump
    /// tasks exit when `cancel` flips true, when the audio handle is
    /// dropped, or when the socket errors.
    pub async fn connect(
        config: &SttConfig,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(SttHandle, mpsc::Receiver<SttEvent>), PipelineError> {
        let url = format!(
            "{}?model={}&encoding={}&sample_rate={}&channels=1&interim_results=true&punctuate=true",
            config.endpoint,
            config.model,
            config.encoding,
            config.sample_rate()
        );

        let mut request = url
            .into_client_request()
            .map_err(|e| PipelineError::Stt(format!("bad STT URL: {}", e)))?;
        let auth = HeaderValue::from_str(&format!("Token {}", config.api_key))
            .map_err(|e| PipelineError::Stt(format!("bad STT api key: {}", e)))?;
        request.headers_mut().insert("Authorization", auth);

        let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut stream) = socket.split();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (event_tx, event_rx) = mpsc::channel::<SttEvent>(64);

        // Writer: audio out, keep-alives while idle, close on cancel
        let keepalive = std::time::Duration::from_secs(config.keepalive_secs.max(1));
        let mut writer_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut keepalive_timer = tokio::time::interval(keepalive);
            keepalive_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    chunk = audio_rx.recv() => {
                        match chunk {
                            Some(chunk) => {
                                keepalive_timer.reset();
                                if sink.send(Message::Binary(chunk)).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = sink
                                    .send(Message::Text(r#"{"type":"CloseStream"}"#.to_string()))
                                    .await;
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    _ = keepalive_timer.tick() => {
                        if sink
                            .send(Message::Text(r#"{"type":"KeepAlive"}"#.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    _ = writer_cancel.changed() => {
                        if *writer_cancel.borrow() {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        });

        // Reader: provider events in
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = stream.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(event) = parse_event(&text) {
                                    if event_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                let _ = event_tx.send(SttEvent::Closed).await;
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!("STT socket error: {}", e);
                                let _ = event_tx.send(SttEvent::Closed).await;
                                break;
                            }
                        }
                    }
                    _ = cancel.changed() => {
                        if *cancel.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Ok((SttHandle { audio_tx }, event_rx))
    }
}

fn parse_event(text: &str) -> Option<SttEvent> {
    let result: ProviderResult = serde_json::from_str(text).ok()?;
    if result.kind != "Results" {
        return None;
    }
    let alternative = result.channel?.alternatives.into_iter().next()?;
    if alternative.transcript.trim().is_empty() {
        return None;
    }
    if result.is_final {
        Some(SttEvent::Final {
            text: alternative.transcript,
            confidence: alternative.confidence,
        })
    } else {
        Some(SttEvent::Partial {
            text: alternative.transcript,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_final_result() {
        let text = r#"{"type":"Results","is_final":true,
            "channel":{"alternatives":[{"transcript":"yes that's right","confidence":0.97}]}}"#;
        assert_eq!(
            parse_event(text),
            Some(SttEvent::Final {
                text: "yes that's right".to_string(),
                confidence: 0.97
            })
        );
    }

    #[test]
    fn test_parse_partial_result() {
        let text = r#"{"type":"Results","is_final":false,
            "channel":{"alternatives":[{"transcript":"yes that","confidence":0.5}]}}"#;
        assert_eq!(
            parse_event(text),
            Some(SttEvent::Partial {
                text: "yes that".to_string()
            })
        );
    }

    #[test]
    fn test_empty_transcript_ignored() {
        let text = r#"{"type":"Results","is_final":true,
            "channel":{"alternatives":[{"transcript":"  ","confidence":0.0}]}}"#;
        assert_eq!(parse_event(text), None);
    }

    #[test]
    fn test_metadata_messages_ignored() {
        assert_eq!(parse_event(r#"{"type":"Metadata","duration":1.2}"#), None);
    }
}
