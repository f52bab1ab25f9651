//! Lead domain types
//!
//! Leads are created by the external CSV ingest and mutated only by the
//! dispatcher and the conversation recorder on terminal call events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a lead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    #[default]
    Pending,
    /// The carrier confirmed origination of at least one call to this lead
    Called,
    Qualified,
    Disqualified,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Pending => "pending",
            LeadStatus::Called => "called",
            LeadStatus::Qualified => "qualified",
            LeadStatus::Disqualified => "disqualified",
        }
    }
}

impl std::str::FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LeadStatus::Pending),
            "called" => Ok(LeadStatus::Called),
            "qualified" => Ok(LeadStatus::Qualified),
            "disqualified" => Ok(LeadStatus::Disqualified),
            other => Err(format!("unknown lead status: {}", other)),
        }
    }
}

/// How the last call to this lead was answered.
///
/// Independent of [`LeadStatus`]: a lead can be `called` with answer type
/// `voicemail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerType {
    Answered,
    Voicemail,
    NoAnswer,
    NotFound,
    Busy,
}

impl AnswerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerType::Answered => "answered",
            AnswerType::Voicemail => "voicemail",
            AnswerType::NoAnswer => "no_answer",
            AnswerType::NotFound => "not_found",
            AnswerType::Busy => "busy",
        }
    }
}

impl std::str::FromStr for AnswerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "answered" => Ok(AnswerType::Answered),
            "voicemail" => Ok(AnswerType::Voicemail),
            "no_answer" => Ok(AnswerType::NoAnswer),
            "not_found" => Ok(AnswerType::NotFound),
            "busy" => Ok(AnswerType::Busy),
            other => Err(format!("unknown answer type: {}", other)),
        }
    }
}

/// A person to be dialled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    /// E.164; unique across leads when present
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub status: LeadStatus,
    pub answer_type: Option<AnswerType>,
    /// Total dial attempts; only ever increases
    pub call_attempts: i32,
    pub last_call_at: Option<DateTime<Utc>>,
    /// DID used on the most recent call
    pub from_number: Option<String>,
}

impl Lead {
    /// Display name used in prompts and transfer records
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            LeadStatus::Pending,
            LeadStatus::Called,
            LeadStatus::Qualified,
            LeadStatus::Disqualified,
        ] {
            assert_eq!(status.as_str().parse::<LeadStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_full_name() {
        let lead = Lead {
            id: Uuid::new_v4(),
            first_name: "Terry".to_string(),
            last_name: "Hodges".to_string(),
            phone: Some("+15307748286".to_string()),
            email: None,
            address: None,
            status: LeadStatus::Pending,
            answer_type: None,
            call_attempts: 0,
            last_call_at: None,
            from_number: None,
        };
        assert_eq!(lead.full_name(), "Terry Hodges");
    }
}
