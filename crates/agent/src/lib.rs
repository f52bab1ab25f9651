//! Qualification dialogue engine
//!
//! A deterministic, per-call state machine around an LLM: scripted greeting,
//! a fixed ladder of qualification questions, forced tool-call extraction
//! with a manual-inference safety net, and auto-detected hangup/transfer
//! transitions. The engine is single-threaded per call; the media pipeline
//! feeds it final transcripts in arrival order.

mod engine;
mod filter;
mod heuristics;
mod qualification;
mod script;
mod tools;

pub use engine::{DialogueEngine, TurnOutcome};
pub use filter::sanitize_reply;
pub use heuristics::{classify_yes_no, is_hangup_request, looks_like_answer};
pub use qualification::{DialogueStage, QualAnswer, QualKey, QualificationMap};
pub use script::{LadderQuestion, FALLBACK_REPLY, NO_RESPONSE_PROMPT};
pub use tools::{qualification_tools, CallOutcomeChoice, ParsedToolCall};

use thiserror::Error;

/// Dialogue engine errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] outdial_llm::LlmError),

    #[error("invalid tool arguments: {0}")]
    InvalidToolArguments(String),
}
