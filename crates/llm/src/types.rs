//! Chat message and tool types

use serde::{Deserialize, Serialize};

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Assistant,
    User,
    Tool,
}

/// One conversation message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A function tool offered to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub parameters: serde_json::Value,
}

/// Tool-choice policy for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// The model decides whether to call a tool
    #[default]
    Auto,
    /// The model must call one of the offered tools
    Required,
}

/// A tool invocation returned by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    /// Parsed arguments object
    pub arguments: serde_json::Value,
}

/// Token accounting for one round trip
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// One chat-completions request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Disallow more than one tool call per response
    pub parallel_tool_calls: bool,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            temperature: 0.7,
            max_tokens: 256,
            parallel_tool_calls: false,
        }
    }
}

/// The model's reply: optional text, optional tool calls, usage
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

impl ChatOutcome {
    /// First tool call, if any
    pub fn tool_call(&self) -> Option<&ToolCall> {
        self.tool_calls.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        assert_eq!(ChatMessage::system("a").role, Role::System);
        assert_eq!(ChatMessage::assistant("b").role, Role::Assistant);
        assert_eq!(ChatMessage::user("c").role, Role::User);
    }

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::from_str::<Role>("\"assistant\"").unwrap(),
            Role::Assistant
        );
    }
}
