//! OpenAI-compatible chat backend

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use outdial_config::LlmProviderConfig;

use crate::{
    ChatBackend, ChatMessage, ChatOutcome, ChatRequest, LlmError, TokenUsage, ToolCall, ToolChoice,
};

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_tool_calls: Option<bool>,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    r#type: &'static str,
    function: WireFunction<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireCalledFunction,
}

#[derive(Debug, Deserialize)]
struct WireCalledFunction {
    name: String,
    /// JSON-encoded arguments string, per the chat-completions wire format
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Chat-completions HTTP client
pub struct OpenAiClient {
    http: Client,
    config: LlmProviderConfig,
}

impl OpenAiClient {
    pub fn new(config: LlmProviderConfig) -> Result<Self, LlmError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl ChatBackend for OpenAiClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, LlmError> {
        let tools: Option<Vec<WireTool<'_>>> = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| WireTool {
                        r#type: "function",
                        function: WireFunction {
                            name: &t.name,
                            description: &t.description,
                            parameters: &t.parameters,
                        },
                    })
                    .collect(),
            )
        };

        let wire = WireRequest {
            model: &self.config.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tool_choice: tools.as_ref().map(|_| match request.tool_choice {
                ToolChoice::Auto => "auto",
                ToolChoice::Required => "required",
            }),
            parallel_tool_calls: tools.as_ref().map(|_| request.parallel_tool_calls),
            tools,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.endpoint))
            .bearer_auth(&self.config.api_key)
            .json(&wire)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Network(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{}: {}", status, body)));
        }

        let body: WireResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices in response".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .filter_map(|tc| {
                match serde_json::from_str::<serde_json::Value>(&tc.function.arguments) {
                    Ok(arguments) => Some(ToolCall {
                        name: tc.function.name,
                        arguments,
                    }),
                    Err(e) => {
                        tracing::warn!(
                            tool = %tc.function.name,
                            "Dropping tool call with unparseable arguments: {}",
                            e
                        );
                        None
                    }
                }
            })
            .collect();

        let usage = body
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(ChatOutcome {
            text: choice.message.content.filter(|c| !c.trim().is_empty()),
            tool_calls,
            usage,
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_request_omits_empty_tools() {
        let request = WireRequest {
            model: "gpt-4o-mini",
            messages: &[ChatMessage::user("hi")],
            temperature: 0.3,
            max_tokens: 150,
            tools: None,
            tool_choice: None,
            parallel_tool_calls: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("tool_choice").is_none());
    }

    #[test]
    fn test_wire_response_with_tool_call() {
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "update_qualification",
                            "arguments": "{\"no_alzheimers\": true}"
                        }
                    }]
                }
            }],
            "usage": {"prompt_tokens": 412, "completion_tokens": 18}
        });
        let parsed: WireResponse = serde_json::from_value(body).unwrap();
        let choice = &parsed.choices[0];
        assert_eq!(choice.message.tool_calls.len(), 1);
        assert_eq!(choice.message.tool_calls[0].function.name, "update_qualification");
        assert_eq!(parsed.usage.as_ref().unwrap().prompt_tokens, 412);
    }
}
