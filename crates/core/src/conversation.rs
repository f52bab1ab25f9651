//! Conversation and transfer records
//!
//! A [`ConversationRecord`] accumulates in memory while a call is live and
//! is persisted exactly once when the call reaches a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who produced a transcript line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speaker {
    #[serde(rename = "AI")]
    Ai,
    Lead,
    System,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Ai => "AI",
            Speaker::Lead => "Lead",
            Speaker::System => "System",
        }
    }
}

impl std::str::FromStr for Speaker {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AI" => Ok(Speaker::Ai),
            "Lead" => Ok(Speaker::Lead),
            "System" => Ok(Speaker::System),
            other => Err(format!("unknown speaker: {}", other)),
        }
    }
}

/// One transcript line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp_ms: i64,
}

impl TranscriptMessage {
    pub fn now(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Canonical outcome label of a finalized conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    /// The lead actually engaged with the agent
    Completed,
    Transferred,
    /// The AI spoke but nothing usable came back
    NoResponse,
    /// The call was never picked up
    NoAnswer,
    Voicemail,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Completed => "completed",
            ConversationStatus::Transferred => "transferred",
            ConversationStatus::NoResponse => "no_response",
            ConversationStatus::NoAnswer => "no_answer",
            ConversationStatus::Voicemail => "voicemail",
        }
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "completed" => Ok(ConversationStatus::Completed),
            "transferred" => Ok(ConversationStatus::Transferred),
            "no_response" => Ok(ConversationStatus::NoResponse),
            "no_answer" => Ok(ConversationStatus::NoAnswer),
            "voicemail" => Ok(ConversationStatus::Voicemail),
            other => Err(format!("unknown conversation status: {}", other)),
        }
    }
}

/// Persisted record of one call's conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub call_id: String,
    pub from_did: String,
    pub to_phone: String,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub duration_secs: i64,
    pub cost_total: f64,
    /// Per-service breakdown, stored as JSON
    pub cost_breakdown: serde_json::Value,
    pub messages: Vec<TranscriptMessage>,
    pub status: ConversationStatus,
    pub hangup_cause: Option<String>,
}

impl ConversationRecord {
    pub fn new(call_id: impl Into<String>, from_did: &str, to_phone: &str) -> Self {
        Self {
            call_id: call_id.into(),
            from_did: from_did.to_string(),
            to_phone: to_phone.to_string(),
            started_at_ms: Utc::now().timestamp_millis(),
            ended_at_ms: None,
            duration_secs: 0,
            cost_total: 0.0,
            cost_breakdown: serde_json::Value::Null,
            messages: Vec::new(),
            status: ConversationStatus::Active,
            hangup_cause: None,
        }
    }
}

/// Persisted when a call is successfully blind-transferred
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub call_id: String,
    pub lead_id: Uuid,
    pub lead_name: String,
    pub lead_phone: String,
    pub from_did: String,
    pub to_agent_number: String,
    pub transferred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speaker_serde_labels() {
        let json = serde_json::to_string(&Speaker::Ai).unwrap();
        assert_eq!(json, "\"AI\"");
        let back: Speaker = serde_json::from_str("\"Lead\"").unwrap();
        assert_eq!(back, Speaker::Lead);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ConversationStatus::Active,
            ConversationStatus::Completed,
            ConversationStatus::Transferred,
            ConversationStatus::NoResponse,
            ConversationStatus::NoAnswer,
            ConversationStatus::Voicemail,
        ] {
            assert_eq!(
                status.as_str().parse::<ConversationStatus>().unwrap(),
                status
            );
        }
    }

    #[test]
    fn test_new_record_is_active() {
        let record = ConversationRecord::new("cc-1", "+16592389182", "+15307748286");
        assert_eq!(record.status, ConversationStatus::Active);
        assert!(record.messages.is_empty());
    }
}
