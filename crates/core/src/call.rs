//! Call attempt types
//!
//! A [`CallAttempt`] is the ephemeral in-memory record owning one dialling
//! attempt. The dispatcher worker that created it has exclusive ownership;
//! the webhook router communicates through channels, never by mutating the
//! struct directly.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The single value describing how a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// Answered and ran to a normal hangup
    Completed,
    NoAnswer,
    Busy,
    Voicemail,
    Transferred,
    /// The carrier refused the create-call request
    OriginationFailed,
    /// The dispatcher's completion wait expired; the call itself may still
    /// finalize later via webhook
    Timeout,
}

impl TerminalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalReason::Completed => "completed",
            TerminalReason::NoAnswer => "no_answer",
            TerminalReason::Busy => "busy",
            TerminalReason::Voicemail => "voicemail",
            TerminalReason::Transferred => "transferred",
            TerminalReason::OriginationFailed => "origination_failed",
            TerminalReason::Timeout => "timeout",
        }
    }
}

/// One dialling attempt, owned by the dispatcher worker that created it
#[derive(Debug, Clone)]
pub struct CallAttempt {
    /// Carrier-assigned call control id
    pub call_id: String,
    pub lead_id: Uuid,
    pub from_did: String,
    /// E.164 recipient
    pub to_phone: String,
    pub started: Instant,
    pub connected: Option<Instant>,
    pub ended: Option<Instant>,
    pub terminal: Option<TerminalReason>,
    pub transferred: bool,
}

impl CallAttempt {
    pub fn new(call_id: impl Into<String>, lead_id: Uuid, from_did: &str, to_phone: &str) -> Self {
        Self {
            call_id: call_id.into(),
            lead_id,
            from_did: from_did.to_string(),
            to_phone: to_phone.to_string(),
            started: Instant::now(),
            connected: None,
            ended: None,
            terminal: None,
            transferred: false,
        }
    }

    /// Seconds from answer to hangup; zero when never connected
    pub fn connected_secs(&self) -> u64 {
        match (self.connected, self.ended) {
            (Some(connected), Some(ended)) => ended.duration_since(connected).as_secs(),
            (Some(connected), None) => connected.elapsed().as_secs(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_secs_without_answer() {
        let attempt = CallAttempt::new("cc-1", Uuid::new_v4(), "+16592389182", "+15307748286");
        assert_eq!(attempt.connected_secs(), 0);
    }

    #[test]
    fn test_terminal_reason_labels() {
        assert_eq!(TerminalReason::Voicemail.as_str(), "voicemail");
        assert_eq!(TerminalReason::OriginationFailed.as_str(), "origination_failed");
    }
}
