//! Chat-completions client with tool calling
//!
//! One provider-agnostic message/tool model plus an OpenAI-compatible HTTP
//! backend. The dialogue engine depends only on the [`ChatBackend`] trait
//! so tests can substitute a scripted fake.

mod client;
mod types;

pub use client::OpenAiClient;
pub use types::{
    ChatMessage, ChatOutcome, ChatRequest, Role, TokenUsage, ToolCall, ToolChoice, ToolDefinition,
};

use async_trait::async_trait;
use thiserror::Error;

/// LLM errors
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("provider returned an error: {0}")]
    Api(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Chat backend seam
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Run one chat-completions round trip
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, LlmError>;

    /// Model identifier, for cost attribution
    fn model_name(&self) -> &str;
}
