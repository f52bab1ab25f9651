//! Tool schemas and tool-call parsing
//!
//! Exactly two tools are offered to the model: `update_qualification` and
//! `set_call_outcome`. Anything else the model invents is ignored.

use serde_json::json;

use outdial_llm::{ToolCall, ToolDefinition};

use crate::qualification::{QualAnswer, QualKey};
use crate::AgentError;

pub const TOOL_UPDATE_QUALIFICATION: &str = "update_qualification";
pub const TOOL_SET_CALL_OUTCOME: &str = "set_call_outcome";

/// Outcome values of `set_call_outcome`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcomeChoice {
    TransferToAgent,
    Disqualified,
    UserDeclined,
    UserRequestedHangup,
}

impl CallOutcomeChoice {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "transfer_to_agent" => Some(CallOutcomeChoice::TransferToAgent),
            "disqualified" => Some(CallOutcomeChoice::Disqualified),
            "user_declined" => Some(CallOutcomeChoice::UserDeclined),
            "user_requested_hangup" => Some(CallOutcomeChoice::UserRequestedHangup),
            _ => None,
        }
    }
}

/// A recognized, validated tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedToolCall {
    UpdateQualification(Vec<(QualKey, QualAnswer)>),
    SetCallOutcome {
        outcome: CallOutcomeChoice,
        reason: Option<String>,
    },
}

/// The two tool definitions offered on every turn
pub fn qualification_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: TOOL_UPDATE_QUALIFICATION.to_string(),
            description: "Record the lead's answer to one or more qualification questions. \
                          Only include keys the lead just answered."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "verified_info": {
                        "type": "boolean",
                        "description": "The person on the line confirmed their identity"
                    },
                    "no_alzheimers": {
                        "type": "boolean",
                        "description": "True if the lead has never been diagnosed with Alzheimer's or dementia"
                    },
                    "no_hospice": {
                        "type": "boolean",
                        "description": "True if the lead is not in hospice care"
                    },
                    "age_qualified": {
                        "type": "boolean",
                        "description": "True if the lead's age is within the program range"
                    },
                    "has_bank_account": {
                        "type": "boolean",
                        "description": "True if the lead has an active bank account or Direct Express card"
                    }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: TOOL_SET_CALL_OUTCOME.to_string(),
            description: "End the qualification flow: transfer a fully qualified lead or \
                          close the call."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "outcome": {
                        "type": "string",
                        "enum": [
                            "transfer_to_agent",
                            "disqualified",
                            "user_declined",
                            "user_requested_hangup"
                        ]
                    },
                    "reason": {
                        "type": "string",
                        "description": "Short reason for the outcome"
                    }
                },
                "required": ["outcome"],
                "additionalProperties": false
            }),
        },
    ]
}

/// Parse a raw tool call into a typed value.
///
/// Unknown tool names yield `Ok(None)`; recognized tools with malformed
/// arguments are an error so the caller can fall back deliberately.
pub fn parse_tool_call(call: &ToolCall) -> Result<Option<ParsedToolCall>, AgentError> {
    match call.name.as_str() {
        TOOL_UPDATE_QUALIFICATION => {
            let object = call.arguments.as_object().ok_or_else(|| {
                AgentError::InvalidToolArguments("update_qualification: not an object".to_string())
            })?;
            let mut updates = Vec::new();
            for (key, qual_key) in [
                ("verified_info", QualKey::VerifiedInfo),
                ("no_alzheimers", QualKey::NoAlzheimers),
                ("no_hospice", QualKey::NoHospice),
                ("age_qualified", QualKey::AgeQualified),
                ("has_bank_account", QualKey::HasBankAccount),
            ] {
                if let Some(value) = object.get(key) {
                    let flag = value.as_bool().ok_or_else(|| {
                        AgentError::InvalidToolArguments(format!(
                            "update_qualification: {} is not a boolean",
                            key
                        ))
                    })?;
                    updates.push((qual_key, QualAnswer::from_bool(flag)));
                }
            }
            Ok(Some(ParsedToolCall::UpdateQualification(updates)))
        }
        TOOL_SET_CALL_OUTCOME => {
            let outcome_raw = call
                .arguments
                .get("outcome")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    AgentError::InvalidToolArguments("set_call_outcome: missing outcome".to_string())
                })?;
            let outcome = CallOutcomeChoice::parse(outcome_raw).ok_or_else(|| {
                AgentError::InvalidToolArguments(format!(
                    "set_call_outcome: unknown outcome '{}'",
                    outcome_raw
                ))
            })?;
            let reason = call
                .arguments
                .get("reason")
                .and_then(|v| v.as_str())
                .map(String::from);
            Ok(Some(ParsedToolCall::SetCallOutcome { outcome, reason }))
        }
        other => {
            tracing::debug!(tool = %other, "Ignoring unrecognized tool call");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_definitions() {
        let tools = qualification_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, TOOL_UPDATE_QUALIFICATION);
        assert_eq!(tools[1].name, TOOL_SET_CALL_OUTCOME);
    }

    #[test]
    fn test_parse_update_qualification() {
        let call = ToolCall {
            name: TOOL_UPDATE_QUALIFICATION.to_string(),
            arguments: json!({"no_alzheimers": true, "age_qualified": false}),
        };
        let parsed = parse_tool_call(&call).unwrap().unwrap();
        assert_eq!(
            parsed,
            ParsedToolCall::UpdateQualification(vec![
                (QualKey::NoAlzheimers, QualAnswer::Yes),
                (QualKey::AgeQualified, QualAnswer::No),
            ])
        );
    }

    #[test]
    fn test_parse_set_call_outcome() {
        let call = ToolCall {
            name: TOOL_SET_CALL_OUTCOME.to_string(),
            arguments: json!({"outcome": "transfer_to_agent", "reason": "fully qualified"}),
        };
        let parsed = parse_tool_call(&call).unwrap().unwrap();
        match parsed {
            ParsedToolCall::SetCallOutcome { outcome, reason } => {
                assert_eq!(outcome, CallOutcomeChoice::TransferToAgent);
                assert_eq!(reason.as_deref(), Some("fully qualified"));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tool_is_ignored() {
        let call = ToolCall {
            name: "make_coffee".to_string(),
            arguments: json!({}),
        };
        assert!(parse_tool_call(&call).unwrap().is_none());
    }

    #[test]
    fn test_malformed_arguments_error() {
        let call = ToolCall {
            name: TOOL_UPDATE_QUALIFICATION.to_string(),
            arguments: json!({"no_alzheimers": "yes"}),
        };
        assert!(parse_tool_call(&call).is_err());

        let call = ToolCall {
            name: TOOL_SET_CALL_OUTCOME.to_string(),
            arguments: json!({"outcome": "party_time"}),
        };
        assert!(parse_tool_call(&call).is_err());
    }
}
