//! Conversation recorder
//!
//! Accumulates transcript messages per call while it is live and, on the
//! terminal event, collapses webhook data, transcript history and cost
//! signals into one canonical status label. Finalization is guarded per
//! call id; a second finalize is a no-op.

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use outdial_core::{ConversationRecord, ConversationStatus, Speaker, TranscriptMessage};
use outdial_llm::{ChatMessage, Role};

/// Markers prefixing non-substantive lead messages
const NOISE_PREFIXES: [&str; 3] = ["[Voicemail detected]", "[Background noise]", "[Filtered:"];

/// Marker inserted by answering-machine detection
const AMD_MARKER: &str = "[AMD Detection:";

/// Placeholder when the AI spoke but no transcript lines survived
const RECOVERY_PLACEHOLDER: &str = "[AI agent spoke but messages were not captured]";

/// Calls shorter than this with no engagement classify as voicemail
const SHORT_CALL_SECS: i64 = 30;

/// Signals consulted at finalize, alongside the recorded messages
pub struct FinalizeInputs<'a> {
    pub cost_total: f64,
    pub cost_breakdown: serde_json::Value,
    /// Synthesized audio seconds; > 0 means the AI actually spoke
    pub tts_seconds: f64,
    pub llm_calls: u64,
    pub transferred: bool,
    pub hangup_cause: Option<String>,
    /// Dialogue engine history, for transcript recovery
    pub engine_history: &'a [ChatMessage],
    /// Authoritative recipient; corrects a mistakenly stored DID
    pub expected_to_phone: Option<&'a str>,
}

/// The recorder
#[derive(Default)]
pub struct ConversationRecorder {
    records: DashMap<String, Mutex<ConversationRecord>>,
    finalized: DashSet<String>,
}

impl ConversationRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call; idempotent on duplicate init.
    pub fn initialize(&self, call_id: &str, from_did: &str, to_phone: &str) {
        self.records
            .entry(call_id.to_string())
            .or_insert_with(|| Mutex::new(ConversationRecord::new(call_id, from_did, to_phone)));
    }

    /// Append a transcript line. Silently ignored after finalize.
    pub fn add_message(&self, call_id: &str, speaker: Speaker, text: &str) {
        if self.finalized.contains(call_id) {
            tracing::debug!(call_id = %call_id, "Dropping message for finalized conversation");
            return;
        }
        if let Some(entry) = self.records.get(call_id) {
            entry
                .lock()
                .messages
                .push(TranscriptMessage::now(speaker, text));
        } else {
            tracing::warn!(call_id = %call_id, "Message for unknown conversation");
        }
    }

    pub fn message_count(&self, call_id: &str) -> usize {
        self.records
            .get(call_id)
            .map(|entry| entry.lock().messages.len())
            .unwrap_or(0)
    }

    pub fn get(&self, call_id: &str) -> Option<ConversationRecord> {
        self.records.get(call_id).map(|entry| entry.lock().clone())
    }

    pub fn is_finalized(&self, call_id: &str) -> bool {
        self.finalized.contains(call_id)
    }

    /// Finalize exactly once; returns `None` on repeat calls.
    pub fn finalize(&self, call_id: &str, inputs: FinalizeInputs<'_>) -> Option<ConversationRecord> {
        if !self.finalized.insert(call_id.to_string()) {
            return None;
        }
        let entry = self.records.get(call_id)?;
        let mut record = entry.lock();

        // Guard against persisting the DID as the recipient
        if let Some(expected) = inputs.expected_to_phone {
            if record.to_phone != expected {
                tracing::warn!(
                    call_id = %call_id,
                    stored = %record.to_phone,
                    expected = %expected,
                    "Correcting recipient number from call metadata"
                );
                record.to_phone = expected.to_string();
            }
        }

        let ended_ms = Utc::now().timestamp_millis();
        record.ended_at_ms = Some(ended_ms);
        record.duration_secs = ((ended_ms - record.started_at_ms) / 1000).max(0);
        record.cost_total = inputs.cost_total;
        record.cost_breakdown = inputs.cost_breakdown.clone();
        record.hangup_cause = inputs.hangup_cause.clone();

        let had_zero_messages = record.messages.is_empty();
        if had_zero_messages {
            // Recover AI-side lines from the engine history
            for message in inputs.engine_history {
                if message.role == Role::Assistant {
                    record
                        .messages
                        .push(TranscriptMessage::now(Speaker::Ai, &message.content));
                }
            }
            if record.messages.is_empty() && inputs.tts_seconds > 0.0 {
                record
                    .messages
                    .push(TranscriptMessage::now(Speaker::Ai, RECOVERY_PLACEHOLDER));
            }
        }

        record.status = classify(
            &record.messages,
            had_zero_messages,
            record.duration_secs,
            &inputs,
        );

        tracing::info!(
            call_id = %call_id,
            status = record.status.as_str(),
            duration_secs = record.duration_secs,
            messages = record.messages.len(),
            "Conversation finalized"
        );

        Some(record.clone())
    }

    /// Drop the in-memory record once persisted
    pub fn remove(&self, call_id: &str) {
        self.records.remove(call_id);
    }
}

fn is_voicemail_cause(hangup_cause: &Option<String>) -> bool {
    hangup_cause
        .as_deref()
        .map(|c| c.eq_ignore_ascii_case("voicemail"))
        .unwrap_or(false)
}

fn is_noise(text: &str) -> bool {
    NOISE_PREFIXES.iter().any(|p| text.starts_with(p))
}

fn classify(
    messages: &[TranscriptMessage],
    had_zero_messages: bool,
    duration_secs: i64,
    inputs: &FinalizeInputs<'_>,
) -> ConversationStatus {
    // 1. A successful transfer wins outright
    if inputs.transferred {
        return ConversationStatus::Transferred;
    }

    // 2. Nothing was recorded during the call
    if had_zero_messages {
        if inputs.tts_seconds > 0.0 {
            if is_voicemail_cause(&inputs.hangup_cause) || duration_secs < SHORT_CALL_SECS {
                return ConversationStatus::Voicemail;
            }
            return ConversationStatus::NoResponse;
        }
        return ConversationStatus::NoAnswer;
    }

    // 3. Machine-detection markers
    let has_amd_marker = messages
        .iter()
        .any(|m| m.text.contains(AMD_MARKER) || m.text.contains("[Voicemail detected]"));
    if has_amd_marker || is_voicemail_cause(&inputs.hangup_cause) {
        return ConversationStatus::Voicemail;
    }

    // 4. Engagement analysis
    let lead_messages: Vec<&TranscriptMessage> = messages
        .iter()
        .filter(|m| m.speaker == Speaker::Lead)
        .collect();
    let real_user_messages = lead_messages.iter().any(|m| !is_noise(&m.text));
    let engine_user_turns = inputs
        .engine_history
        .iter()
        .any(|m| m.role == Role::User);

    if inputs.llm_calls > 0 {
        return ConversationStatus::Completed;
    }
    if real_user_messages || engine_user_turns {
        return ConversationStatus::Completed;
    }
    if !lead_messages.is_empty() && duration_secs >= SHORT_CALL_SECS {
        return ConversationStatus::Completed;
    }
    if !lead_messages.is_empty() {
        // Only noise/voicemail lines from the lead
        return ConversationStatus::Voicemail;
    }
    if duration_secs < SHORT_CALL_SECS && inputs.tts_seconds > 0.0 {
        return ConversationStatus::Voicemail;
    }
    ConversationStatus::NoResponse
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>(history: &'a [ChatMessage]) -> FinalizeInputs<'a> {
        FinalizeInputs {
            cost_total: 0.0,
            cost_breakdown: serde_json::json!({}),
            tts_seconds: 0.0,
            llm_calls: 0,
            transferred: false,
            hangup_cause: None,
            engine_history: history,
            expected_to_phone: None,
        }
    }

    #[test]
    fn test_finalize_runs_exactly_once() {
        let recorder = ConversationRecorder::new();
        recorder.initialize("cc-1", "+16592389182", "+15307748286");
        assert!(recorder.finalize("cc-1", inputs(&[])).is_some());
        assert!(recorder.finalize("cc-1", inputs(&[])).is_none());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let recorder = ConversationRecorder::new();
        recorder.initialize("cc-1", "+16592389182", "+15307748286");
        recorder.add_message("cc-1", Speaker::Ai, "Hello");
        recorder.initialize("cc-1", "+16592389182", "+15307748286");
        assert_eq!(recorder.message_count("cc-1"), 1);
    }

    #[test]
    fn test_transferred_wins() {
        let recorder = ConversationRecorder::new();
        recorder.initialize("cc-1", "+16592389182", "+15307748286");
        recorder.add_message("cc-1", Speaker::Ai, "Hello");
        let mut i = inputs(&[]);
        i.transferred = true;
        let record = recorder.finalize("cc-1", i).unwrap();
        assert_eq!(record.status, ConversationStatus::Transferred);
    }

    #[test]
    fn test_no_answer_when_nothing_happened() {
        let recorder = ConversationRecorder::new();
        recorder.initialize("cc-1", "+16592389182", "+15307748286");
        let record = recorder.finalize("cc-1", inputs(&[])).unwrap();
        assert_eq!(record.status, ConversationStatus::NoAnswer);
        assert!(record.messages.is_empty());
    }

    #[test]
    fn test_voicemail_when_ai_spoke_into_silence_short_call() {
        let recorder = ConversationRecorder::new();
        recorder.initialize("cc-1", "+16592389182", "+15307748286");
        let mut i = inputs(&[]);
        i.tts_seconds = 6.0;
        let record = recorder.finalize("cc-1", i).unwrap();
        // Short call, TTS cost, zero messages: classic voicemail shape
        assert_eq!(record.status, ConversationStatus::Voicemail);
        // The placeholder documents the lost transcript
        assert_eq!(record.messages.len(), 1);
        assert!(record.messages[0].text.contains("not captured"));
    }

    #[test]
    fn test_recovery_pulls_ai_lines_from_engine() {
        let recorder = ConversationRecorder::new();
        recorder.initialize("cc-1", "+16592389182", "+15307748286");
        let history = vec![
            ChatMessage::system("prompt"),
            ChatMessage::assistant("Hello, am I speaking with Terry?"),
        ];
        let mut i = inputs(&history);
        i.tts_seconds = 4.0;
        let record = recorder.finalize("cc-1", i).unwrap();
        assert_eq!(record.messages.len(), 1);
        assert_eq!(record.messages[0].speaker, Speaker::Ai);
        assert!(record.messages[0].text.contains("Terry"));
    }

    #[test]
    fn test_amd_marker_classifies_voicemail() {
        let recorder = ConversationRecorder::new();
        recorder.initialize("cc-1", "+16592389182", "+15307748286");
        recorder.add_message("cc-1", Speaker::Ai, "Hello there");
        recorder.add_message("cc-1", Speaker::System, "[AMD Detection: machine]");
        let record = recorder.finalize("cc-1", inputs(&[])).unwrap();
        assert_eq!(record.status, ConversationStatus::Voicemail);
    }

    #[test]
    fn test_llm_calls_are_the_strongest_completed_signal() {
        let recorder = ConversationRecorder::new();
        recorder.initialize("cc-1", "+16592389182", "+15307748286");
        recorder.add_message("cc-1", Speaker::Ai, "Hello");
        let mut i = inputs(&[]);
        i.llm_calls = 2;
        let record = recorder.finalize("cc-1", i).unwrap();
        assert_eq!(record.status, ConversationStatus::Completed);
    }

    #[test]
    fn test_real_user_message_completes() {
        let recorder = ConversationRecorder::new();
        recorder.initialize("cc-1", "+16592389182", "+15307748286");
        recorder.add_message("cc-1", Speaker::Ai, "Hello");
        recorder.add_message("cc-1", Speaker::Lead, "Yes that's right");
        let record = recorder.finalize("cc-1", inputs(&[])).unwrap();
        assert_eq!(record.status, ConversationStatus::Completed);
    }

    #[test]
    fn test_noise_only_lead_lines_classify_voicemail() {
        let recorder = ConversationRecorder::new();
        recorder.initialize("cc-1", "+16592389182", "+15307748286");
        recorder.add_message("cc-1", Speaker::Ai, "Hello");
        recorder.add_message("cc-1", Speaker::Lead, "[Background noise] hum");
        let record = recorder.finalize("cc-1", inputs(&[])).unwrap();
        assert_eq!(record.status, ConversationStatus::Voicemail);
    }

    #[test]
    fn test_to_phone_correction() {
        let recorder = ConversationRecorder::new();
        // The DID slipped into the to slot
        recorder.initialize("cc-1", "+16592389182", "+16592389182");
        recorder.add_message("cc-1", Speaker::Ai, "Hello");
        let mut i = inputs(&[]);
        i.expected_to_phone = Some("+15307748286");
        let record = recorder.finalize("cc-1", i).unwrap();
        assert_eq!(record.to_phone, "+15307748286");
    }

    #[test]
    fn test_messages_after_finalize_are_dropped() {
        let recorder = ConversationRecorder::new();
        recorder.initialize("cc-1", "+16592389182", "+15307748286");
        recorder.finalize("cc-1", inputs(&[]));
        recorder.add_message("cc-1", Speaker::Lead, "too late");
        assert!(recorder
            .get("cc-1")
            .unwrap()
            .messages
            .iter()
            .all(|m| m.text != "too late"));
    }
}
