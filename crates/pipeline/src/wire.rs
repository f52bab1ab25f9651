//! Carrier media WebSocket messages
//!
//! The carrier connects to our published URL and exchanges JSON text
//! frames: a control prelude (`connected`, `start`) identifying the call,
//! then `media` frames with base64 mu-law payloads in both directions,
//! and a final `stop`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

/// One message on the carrier media socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MediaStreamMessage {
    /// Socket-level hello; carries no call identity
    Connected,
    /// Control prelude naming the call this socket belongs to
    Start { start: StartPayload },
    /// Audio in either direction
    Media { media: MediaPayload },
    /// End of stream
    Stop,
}

/// `start` prelude payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartPayload {
    pub call_control_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_format: Option<MediaFormat>,
}

/// Declared stream format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaFormat {
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub channels: u32,
}

/// `media` frame payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded mu-law bytes
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
}

impl MediaStreamMessage {
    /// Parse a text frame; unknown events map to `None`
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Build an outbound media frame from raw mu-law bytes
    pub fn outbound_media(mulaw: &[u8]) -> Self {
        MediaStreamMessage::Media {
            media: MediaPayload {
                payload: BASE64.encode(mulaw),
                track: None,
            },
        }
    }

    /// Serialize for the socket
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl MediaPayload {
    /// Decode the base64 audio payload
    pub fn decode(&self) -> Option<Vec<u8>> {
        BASE64.decode(&self.payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        let text = r#"{"event":"start","start":{"call_control_id":"cc-1","media_format":{"encoding":"PCMU","sample_rate":8000,"channels":1}}}"#;
        match MediaStreamMessage::parse(text) {
            Some(MediaStreamMessage::Start { start }) => {
                assert_eq!(start.call_control_id, "cc-1");
                assert_eq!(start.media_format.unwrap().sample_rate, 8000);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_media_round_trip() {
        let frame = MediaStreamMessage::outbound_media(&[0xFF; 160]);
        let text = frame.to_text();
        match MediaStreamMessage::parse(&text) {
            Some(MediaStreamMessage::Media { media }) => {
                assert_eq!(media.decode().unwrap(), vec![0xFF; 160]);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_is_none() {
        assert!(MediaStreamMessage::parse(r#"{"event":"mark"}"#).is_none());
        assert!(MediaStreamMessage::parse("not json").is_none());
    }
}
