//! Carrier webhook event model
//!
//! Webhooks arrive as `{"data": {"event_type": ..., "payload": {...}}}`.
//! Only the fields the router consumes are modelled; everything else is
//! ignored by serde.

use serde::{Deserialize, Serialize};

/// Event types the router dispatches on
pub mod event_types {
    pub const CALL_INITIATED: &str = "call.initiated";
    pub const CALL_ANSWERED: &str = "call.answered";
    pub const CALL_HANGUP: &str = "call.hangup";
    pub const STREAMING_STARTED: &str = "streaming.started";
    pub const STREAMING_STOPPED: &str = "streaming.stopped";
    pub const MACHINE_DETECTION_ENDED: &str = "call.machine.detection.ended";
    pub const TRANSCRIPTION: &str = "call.transcription";
}

/// Top-level webhook body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub data: WebhookEvent,
}

/// One carrier event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_type: String,
    pub payload: WebhookPayload,
}

/// Event payload; a superset across event types
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub call_control_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hangup_cause: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// Answering-machine detection verdict (`human`, `machine`, `fax`,
    /// `not_sure`) on `call.machine.detection.ended`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Carrier-side transcription text on `call.transcription`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_data: Option<TranscriptionData>,
}

/// Carrier-side STT fallback payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionData {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub confidence: f64,
}

/// Simplified AMD verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineDetectionResult {
    Human,
    Machine,
    NotSure,
}

impl MachineDetectionResult {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "human" => MachineDetectionResult::Human,
            "machine" | "fax" => MachineDetectionResult::Machine,
            _ => MachineDetectionResult::NotSure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_hangup_event() {
        let body = serde_json::json!({
            "data": {
                "event_type": "call.hangup",
                "payload": {
                    "call_control_id": "cc-123",
                    "hangup_cause": "normal_clearing",
                    "from": "+16592389182",
                    "to": "+15307748286"
                }
            }
        });
        let envelope: WebhookEnvelope = serde_json::from_value(body).unwrap();
        assert_eq!(envelope.data.event_type, event_types::CALL_HANGUP);
        assert_eq!(envelope.data.payload.call_control_id, "cc-123");
        assert_eq!(
            envelope.data.payload.hangup_cause.as_deref(),
            Some("normal_clearing")
        );
    }

    #[test]
    fn test_decode_tolerates_unknown_fields() {
        let body = serde_json::json!({
            "data": {
                "event_type": "call.answered",
                "payload": {
                    "call_control_id": "cc-9",
                    "connection_id": "conn-1",
                    "occurred_at": "2025-01-01T00:00:00Z"
                }
            }
        });
        let envelope: WebhookEnvelope = serde_json::from_value(body).unwrap();
        assert_eq!(envelope.data.payload.call_control_id, "cc-9");
        assert!(envelope.data.payload.hangup_cause.is_none());
    }

    #[test]
    fn test_machine_detection_parse() {
        assert_eq!(
            MachineDetectionResult::parse("human"),
            MachineDetectionResult::Human
        );
        assert_eq!(
            MachineDetectionResult::parse("machine"),
            MachineDetectionResult::Machine
        );
        assert_eq!(
            MachineDetectionResult::parse("not_sure"),
            MachineDetectionResult::NotSure
        );
    }
}
