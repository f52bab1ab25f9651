//! Opaque client-state blob
//!
//! The carrier echoes `client_state` verbatim on every webhook for a call.
//! We pack a lead snapshot into it at origination time so the webhook
//! router can associate events with a dialled lead even before the per-call
//! context is registered.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CarrierError;

/// Structured payload carried inside the carrier's opaque client_state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub lead_id: Uuid,
    pub lead_name: String,
    /// E.164 recipient; authoritative over webhook `to` fields
    pub to_phone: String,
    pub from_did: String,
    pub timestamp_ms: i64,
    /// Set on the transfer leg so its webhooks are not mistaken for a dial
    #[serde(default)]
    pub is_transfer: bool,
}

impl ClientState {
    pub fn for_dial(lead_id: Uuid, lead_name: &str, to_phone: &str, from_did: &str) -> Self {
        Self {
            lead_id,
            lead_name: lead_name.to_string(),
            to_phone: to_phone.to_string(),
            from_did: from_did.to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
            is_transfer: false,
        }
    }

    /// Encode as base64 JSON for the origination request
    pub fn encode(&self) -> String {
        // Serializing a struct of strings and integers cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        BASE64.encode(json)
    }

    /// Decode from a webhook's client_state field
    pub fn decode(encoded: &str) -> Result<Self, CarrierError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CarrierError::InvalidResponse(format!("bad client_state base64: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CarrierError::InvalidResponse(format!("bad client_state JSON: {}", e)))
    }
}
