//! Streaming TTS client
//!
//! Requests mu-law 8 kHz straight from the provider so synthesized audio
//! can be framed onto the carrier socket without local transcoding. Audio
//! arrives as a chunk stream; the speaker task paces it into 20 ms frames.

use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use outdial_config::TtsConfig;

use crate::PipelineError;

/// Streaming TTS HTTP client
#[derive(Clone)]
pub struct TtsClient {
    http: reqwest::Client,
    config: TtsConfig,
}

impl TtsClient {
    pub fn new(config: TtsConfig) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { http, config })
    }

    /// Synthesize one utterance.
    ///
    /// Returns a receiver of mu-law chunks; the pump task stops when the
    /// receiver is dropped, so discarding the stream cancels the download.
    pub async fn synthesize(
        &self,
        text: &str,
    ) -> Result<mpsc::Receiver<Result<Bytes, PipelineError>>, PipelineError> {
        let url = format!(
            "{}/v1/text-to-speech/{}/stream?output_format=ulaw_8000&optimize_streaming_latency={}",
            self.config.endpoint, self.config.voice_id, self.config.optimize_streaming_latency
        );

        let response = self
            .http
            .post(&url)
            .header("xi-api-key", &self.config.api_key)
            .json(&json!({
                "text": text,
                "model_id": self.config.model,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Tts(format!("{}: {}", status, body)));
        }

        let (tx, rx) = mpsc::channel(32);
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                let item = chunk.map_err(PipelineError::from);
                if tx.send(item).await.is_err() {
                    // Receiver dropped: utterance discarded mid-stream
                    break;
                }
            }
        });

        Ok(rx)
    }

    /// Synthesized-audio duration in seconds for a mu-law byte count
    pub fn mulaw_seconds(byte_count: usize) -> f64 {
        byte_count as f64 / 8000.0
    }
}
