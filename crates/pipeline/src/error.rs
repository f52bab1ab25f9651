//! Media pipeline errors

use thiserror::Error;

/// Errors raised inside a call's media path.
///
/// Any of these fails the pipeline for that call; there are no in-call
/// reconnects. The call is hung up and the recorder classifies the result.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("STT socket error: {0}")]
    Stt(String),

    #[error("TTS request error: {0}")]
    Tts(String),

    #[error("carrier media socket closed")]
    MediaSocketClosed,

    #[error("call cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
