//! Per-call duplex media pipeline
//!
//! Three cooperating tasks per call: an inbound chunker feeding carrier
//! mu-law frames to the STT socket, the STT client surfacing transcript
//! events, and a single-writer outbound speaker that synthesizes one
//! utterance at a time and paces 20 ms frames back towards the carrier.
//! Everything observes the call's cancellation channel and exits at the
//! next suspension point once the call ends.

mod chunker;
mod error;
mod speaker;
mod stt;
mod tts;
mod wire;

pub use chunker::InboundChunker;
pub use error::PipelineError;
pub use speaker::{
    ActiveCheck, OutboundSpeaker, SpeakerHandle, Synthesizer, SynthesizedCallback,
    OUTBOUND_FRAME_BYTES,
};
pub use stt::{ProviderSttConnector, SttClient, SttConnector, SttEvent, SttHandle};
pub use tts::TtsClient;
pub use wire::{MediaPayload, MediaStreamMessage, StartPayload};

/// STT chunk cadence: 100 ms of 8 kHz mu-law
pub const STT_CHUNK_BYTES: usize = 1600;
