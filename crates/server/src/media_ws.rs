//! Carrier media WebSocket
//!
//! The carrier connects here after `streaming_start`. A JSON `start`
//! prelude names the call; after that, `media` frames flow both ways:
//! inbound mu-law towards the STT chunker, outbound paced frames from the
//! speaker task.

use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use outdial_core::audio::{AudioFrame, SampleRate};
use outdial_dialer::attach_media;
use outdial_pipeline::{InboundChunker, MediaStreamMessage};

use crate::state::AppState;

/// GET /media (WebSocket upgrade)
pub async fn media_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let limit = state.max_media_connections();
    let current = state.media_connections.fetch_add(1, Ordering::SeqCst);
    if current >= limit {
        state.media_connections.fetch_sub(1, Ordering::SeqCst);
        tracing::warn!(current, limit, "Media connection limit reached");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        handle_media_socket(state.clone(), socket).await;
        state.media_connections.fetch_sub(1, Ordering::SeqCst);
    })
}

async fn handle_media_socket(state: AppState, mut socket: WebSocket) {
    // Control prelude: read until `start` identifies the call
    let call_id = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match MediaStreamMessage::parse(&text) {
                Some(MediaStreamMessage::Connected) => continue,
                Some(MediaStreamMessage::Start { start }) => break start.call_control_id,
                Some(MediaStreamMessage::Stop) | None => continue,
                Some(MediaStreamMessage::Media { .. }) => continue,
            },
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::warn!("Media socket error before start: {}", e);
                return;
            }
            None => return,
        }
    };

    let Some(context) = state.services.contexts.get(&call_id) else {
        tracing::warn!(call_id = %call_id, "Media socket for unknown call");
        return;
    };
    tracing::info!(call_id = %call_id, "Media stream attached");

    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(256);
    // The speaker handle is stored on the context for the dialogue loop
    let _speaker = attach_media(&state.services, &context, frame_tx).await;

    let (mut sink, mut stream) = socket.split();

    // Outbound pump: paced speaker frames onto the socket
    let mut writer_cancel = context.cancel_token();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = frame_rx.recv() => match frame {
                    Some(frame) => {
                        let message = MediaStreamMessage::outbound_media(&frame).to_text();
                        if sink.send(Message::Text(message)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_cancel.changed() => {
                    if *writer_cancel.borrow() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    // Inbound loop: carrier frames -> 100 ms chunks -> STT
    let mut chunker = InboundChunker::new();
    let mut cancel = context.cancel_token();
    let stt_chunk_seconds = outdial_pipeline::STT_CHUNK_BYTES as f64 / 8000.0;
    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match MediaStreamMessage::parse(&text) {
                    Some(MediaStreamMessage::Media { media }) => {
                        let Some(bytes) = media.decode() else { continue };
                        if !context.stt_ready() {
                            // Frames before the STT client is up are dropped
                            continue;
                        }
                        for chunk in chunker.push(&bytes) {
                            state
                                .services
                                .ledger
                                .add_stt_seconds(&call_id, stt_chunk_seconds);
                            let chunk = if state.services.stt_linear16 {
                                // Provider wants linear audio: decode the
                                // mu-law chunk and upsample to 16 kHz PCM
                                AudioFrame::from_mulaw(&chunk, SampleRate::Hz8000)
                                    .resample(SampleRate::Hz16000)
                                    .to_pcm16()
                            } else {
                                chunk
                            };
                            context.send_audio(chunk);
                        }
                    }
                    Some(MediaStreamMessage::Stop) => break,
                    _ => {}
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(call_id = %call_id, "Media socket error: {}", e);
                    break;
                }
            },
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    break;
                }
            }
        }
    }

    writer.abort();
    tracing::info!(call_id = %call_id, "Media stream detached");
}
