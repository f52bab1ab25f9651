//! Core types for the outbound dialer
//!
//! This crate provides foundational types used across all other crates:
//! - Lead and call-attempt domain types
//! - Conversation and cost records
//! - Phone number normalization (E.164 / NANP)
//! - Telephony audio frames and the G.711 mu-law codec

pub mod audio;
pub mod call;
pub mod conversation;
pub mod lead;
pub mod phone;

pub use audio::{mulaw_decode, mulaw_encode, AudioFrame, SampleRate};
pub use call::{CallAttempt, TerminalReason};
pub use conversation::{
    ConversationRecord, ConversationStatus, Speaker, TranscriptMessage, TransferRecord,
};
pub use lead::{AnswerType, Lead, LeadStatus};
pub use phone::{area_code, digits_only, normalize_phone};
