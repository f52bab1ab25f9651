//! The per-call dialogue engine
//!
//! Owns one call's history and qualification record, and turns each final
//! transcript into a spoken reply plus hangup/transfer decisions. The
//! engine is driven from the call's webhook task, so all methods take
//! `&mut self`; nothing here is shared across calls.

use std::sync::Arc;
use std::time::Instant;

use outdial_core::Lead;
use outdial_llm::{
    ChatBackend, ChatMessage, ChatRequest, Role, TokenUsage, ToolChoice,
};

use crate::filter::sanitize_reply;
use crate::heuristics::{classify_yes_no, infer_qualification, is_hangup_request, looks_like_answer};
use crate::qualification::{DialogueStage, QualAnswer, QualificationMap};
use crate::script::{self, LadderQuestion, FALLBACK_REPLY};
use crate::tools::{parse_tool_call, qualification_tools, CallOutcomeChoice, ParsedToolCall};

const LLM_TEMPERATURE: f32 = 0.3;
const LLM_MAX_TOKENS: u32 = 150;
/// LLM failures in a row before the engine reports the error stage
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Result of one dialogue turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Sanitized reply to synthesize
    pub reply: String,
    pub stage: DialogueStage,
    pub should_hangup: bool,
    pub should_transfer: bool,
    pub qualifications: QualificationMap,
    /// Token usage of this turn's LLM round trip (zero on fallback)
    pub usage: TokenUsage,
}

/// Per-call dialogue engine
pub struct DialogueEngine {
    backend: Arc<dyn ChatBackend>,
    first_name: String,
    history: Vec<ChatMessage>,
    qualifications: QualificationMap,
    stage: DialogueStage,
    greeting_sent: bool,
    greeting_part_two_sent: bool,
    started: Instant,
    llm_calls: u64,
    consecutive_failures: u32,
}

impl DialogueEngine {
    /// Build the initial dialogue state from a lead snapshot.
    pub fn new(backend: Arc<dyn ChatBackend>, lead: &Lead) -> Self {
        let system = script::system_prompt(
            &lead.first_name,
            &lead.last_name,
            lead.address.as_deref(),
        );
        Self {
            backend,
            first_name: lead.first_name.clone(),
            history: vec![ChatMessage::system(system)],
            qualifications: QualificationMap::default(),
            stage: DialogueStage::Greeting,
            greeting_sent: false,
            greeting_part_two_sent: false,
            started: Instant::now(),
            llm_calls: 0,
            consecutive_failures: 0,
        }
    }

    /// Scripted opening line; `None` once it has been sent.
    pub fn greeting_text(&mut self) -> Option<String> {
        if self.greeting_sent {
            return None;
        }
        self.greeting_sent = true;
        let text = script::greeting(&self.first_name);
        self.history.push(ChatMessage::assistant(text.clone()));
        Some(text)
    }

    /// Scripted second greeting line; `None` once sent.
    pub fn greeting_part_two_text(&mut self) -> Option<String> {
        if self.greeting_part_two_sent {
            return None;
        }
        self.greeting_part_two_sent = true;
        let text = script::greeting_part_two();
        self.history.push(ChatMessage::assistant(text.clone()));
        Some(text)
    }

    pub fn stage(&self) -> DialogueStage {
        self.stage
    }

    pub fn qualifications(&self) -> QualificationMap {
        self.qualifications
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn llm_calls(&self) -> u64 {
        self.llm_calls
    }

    pub fn user_turn_count(&self) -> usize {
        self.history.iter().filter(|m| m.role == Role::User).count()
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// The ladder question asked by the most recent assistant turn
    fn last_question(&self) -> Option<LadderQuestion> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .and_then(|m| script::question_in(&m.content))
    }

    /// Has this ladder question already been asked on this call?
    fn already_asked(&self, question: LadderQuestion) -> bool {
        self.history
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .any(|m| script::question_in(&m.content) == Some(question))
    }

    /// Deterministic next line, following the ladder: health discovery
    /// right after verification, then the first unanswered qualification
    /// question that has not been asked, the transfer confirmation once
    /// everything is answered, and a goodbye when the lead is already out.
    fn template_reply(&self) -> String {
        if self.qualifications.any_no() {
            return script::goodbye().to_string();
        }
        // Health discovery sits between verification and the
        // qualification questions; it records nothing but is still asked
        // exactly once
        if self.qualifications.verified_info == QualAnswer::Yes
            && !self.already_asked(LadderQuestion::HealthDiscovery)
        {
            return LadderQuestion::HealthDiscovery.text().to_string();
        }
        if let Some(key) = self.qualifications.next_unanswered() {
            return script::next_question_for(key).to_string();
        }
        if !self.already_asked(LadderQuestion::TransferConfirmation) {
            return LadderQuestion::TransferConfirmation.text().to_string();
        }
        script::transfer_announcement().to_string()
    }

    /// Run one dialogue turn on a final transcript.
    pub async fn next_turn(&mut self, user_transcript: &str) -> TurnOutcome {
        self.history
            .push(ChatMessage::user(user_transcript.to_string()));

        let last_question = self.last_question();
        let hangup_requested = is_hangup_request(user_transcript);

        // Forced tool choice only when the lead plausibly answered a
        // qualification or transfer-confirmation question, or asked to stop.
        let force_tool = hangup_requested
            || last_question
                .map(|q| {
                    (q.qual_key().is_some() || q == LadderQuestion::TransferConfirmation)
                        && looks_like_answer(user_transcript, q)
                })
                .unwrap_or(false);

        let request = ChatRequest {
            messages: self.history.clone(),
            tools: qualification_tools(),
            tool_choice: if force_tool {
                ToolChoice::Required
            } else {
                ToolChoice::Auto
            },
            temperature: LLM_TEMPERATURE,
            max_tokens: LLM_MAX_TOKENS,
            parallel_tool_calls: false,
        };

        let outcome = match self.backend.chat(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    self.stage = DialogueStage::Error;
                }
                tracing::warn!(failures = self.consecutive_failures, "LLM call failed: {}", e);
                self.history.push(ChatMessage::assistant(FALLBACK_REPLY));
                return TurnOutcome {
                    reply: FALLBACK_REPLY.to_string(),
                    stage: self.stage,
                    should_hangup: false,
                    should_transfer: false,
                    qualifications: self.qualifications,
                    usage: TokenUsage::default(),
                };
            }
        };

        self.llm_calls += 1;
        self.consecutive_failures = 0;
        let usage = outcome.usage;
        let previous_map = self.qualifications;

        let mut reply = outcome.text.clone();
        let mut should_hangup = false;
        let mut should_transfer = false;
        let mut tool_handled = false;

        if let Some(call) = outcome.tool_call() {
            match parse_tool_call(call) {
                Ok(Some(ParsedToolCall::UpdateQualification(updates))) => {
                    tool_handled = true;
                    for (key, answer) in updates {
                        self.qualifications.set(key, answer);
                    }
                    if reply.is_none() {
                        reply = Some(self.template_reply());
                    }
                }
                Ok(Some(ParsedToolCall::SetCallOutcome { outcome, reason })) => {
                    tool_handled = true;
                    match outcome {
                        CallOutcomeChoice::TransferToAgent => {
                            if self.qualifications.all_yes() {
                                should_transfer = true;
                                if reply.is_none() {
                                    reply = Some(script::transfer_announcement().to_string());
                                }
                            } else {
                                // The model jumped the gun; keep qualifying
                                tracing::debug!(
                                    reason = reason.as_deref().unwrap_or(""),
                                    "Dropping premature transfer"
                                );
                                reply = Some(self.template_reply());
                            }
                        }
                        CallOutcomeChoice::Disqualified
                        | CallOutcomeChoice::UserDeclined
                        | CallOutcomeChoice::UserRequestedHangup => {
                            should_hangup = true;
                            if reply.is_none() {
                                reply = Some(script::goodbye().to_string());
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Malformed tool call: {}", e);
                }
            }
        }

        // Manual-inference fallback: the provider did not honour the forced
        // tool choice, so read the answer straight out of the transcript.
        if force_tool && !tool_handled {
            if let Some(question) = last_question {
                if let Some((key, answer)) = infer_qualification(user_transcript, question) {
                    self.qualifications.set(key, answer);
                    reply = Some(self.template_reply());
                } else if question == LadderQuestion::TransferConfirmation {
                    match classify_yes_no(user_transcript) {
                        Some(true) if self.qualifications.all_yes() => {
                            should_transfer = true;
                            reply = Some(script::transfer_announcement().to_string());
                        }
                        Some(false) => {
                            should_hangup = true;
                            reply = Some(script::goodbye().to_string());
                        }
                        _ => {}
                    }
                }
            }
            if hangup_requested && !should_transfer {
                should_hangup = true;
                if reply.is_none() {
                    reply = Some(script::goodbye().to_string());
                }
            }
        }

        let mut reply = reply.unwrap_or_else(|| self.template_reply());

        // Auto-detected transitions
        let newly_failed = self.qualifications.any_no() && !previous_map.any_no();
        if newly_failed {
            should_hangup = true;
            if !reply.to_lowercase().contains("day") && !reply.to_lowercase().contains("goodbye") {
                reply = script::goodbye().to_string();
            }
        }

        if !should_transfer
            && !should_hangup
            && self.qualifications.all_yes()
            && last_question == Some(LadderQuestion::TransferConfirmation)
        {
            match classify_yes_no(user_transcript) {
                Some(true) => should_transfer = true,
                Some(false) => {
                    should_hangup = true;
                    reply = script::goodbye().to_string();
                }
                None => {}
            }
        }

        let lowered = reply.to_lowercase();
        let says_transfer = lowered.contains("transferring you now")
            || lowered.contains("connect you now")
            || lowered.contains("while i connect you");
        if says_transfer && !should_transfer {
            if self.qualifications.all_yes() {
                should_transfer = true;
            } else {
                reply = script::polite_defer().to_string();
                should_hangup = true;
            }
        }

        let says_goodbye = {
            let lowered = reply.to_lowercase();
            lowered.contains("goodbye")
                || lowered.contains("have a great day")
                || lowered.contains("have a wonderful day")
                || lowered.contains("take care")
        };
        if says_goodbye && !should_hangup && !should_transfer {
            should_hangup = true;
        }

        let mut reply = sanitize_reply(&reply);
        if reply.is_empty() {
            reply = self.template_reply();
        }

        self.history.push(ChatMessage::assistant(reply.clone()));
        if self.stage != DialogueStage::Error {
            self.stage = DialogueStage::from_map(&self.qualifications);
        }

        TurnOutcome {
            reply,
            stage: self.stage,
            should_hangup,
            should_transfer,
            qualifications: self.qualifications,
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qualification::QualAnswer;
    use async_trait::async_trait;
    use outdial_llm::{ChatOutcome, LlmError, ToolCall};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use uuid::Uuid;

    struct ScriptedBackend {
        responses: Mutex<VecDeque<Result<ChatOutcome, LlmError>>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<Result<ChatOutcome, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatOutcome, LlmError> {
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Timeout))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn test_lead() -> Lead {
        Lead {
            id: Uuid::new_v4(),
            first_name: "Terry".to_string(),
            last_name: "Hodges".to_string(),
            phone: Some("+15307748286".to_string()),
            email: None,
            address: Some("Sacramento".to_string()),
            status: Default::default(),
            answer_type: None,
            call_attempts: 0,
            last_call_at: None,
            from_number: None,
        }
    }

    fn qual_update(args: serde_json::Value) -> ChatOutcome {
        ChatOutcome {
            text: None,
            tool_calls: vec![ToolCall {
                name: "update_qualification".to_string(),
                arguments: args,
            }],
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 10,
            },
        }
    }

    #[test]
    fn test_greeting_is_idempotent() {
        let backend = ScriptedBackend::new(vec![]);
        let lead = test_lead();
        let mut engine = DialogueEngine::new(backend, &lead);

        let first = engine.greeting_text();
        assert!(first.is_some());
        assert!(first.unwrap().contains("Terry"));
        assert!(engine.greeting_text().is_none());

        assert!(engine.greeting_part_two_text().is_some());
        assert!(engine.greeting_part_two_text().is_none());
    }

    #[tokio::test]
    async fn test_verification_yes_advances_ladder() {
        let backend =
            ScriptedBackend::new(vec![Ok(qual_update(serde_json::json!({"verified_info": true})))]);
        let lead = test_lead();
        let mut engine = DialogueEngine::new(backend, &lead);
        engine.greeting_text();

        let outcome = engine.next_turn("Yes that's right").await;
        assert_eq!(outcome.qualifications.verified_info, QualAnswer::Yes);
        assert_eq!(outcome.stage, DialogueStage::Qualifying);
        assert!(!outcome.should_hangup);
        assert!(!outcome.should_transfer);
        // Pure tool call: the template supplies the next ladder step,
        // which is the health-discovery question
        assert!(outcome.reply.to_lowercase().contains("health"));
    }

    #[tokio::test]
    async fn test_health_discovery_asked_once_then_qualifications() {
        let backend = ScriptedBackend::new(vec![
            Ok(qual_update(serde_json::json!({"verified_info": true}))),
            // Pure tool call with nothing new: the template must move past
            // the already-asked health question to Alzheimer's
            Ok(qual_update(serde_json::json!({}))),
        ]);
        let lead = test_lead();
        let mut engine = DialogueEngine::new(backend, &lead);
        engine.greeting_text();

        let health = engine.next_turn("Yes that's right").await;
        assert!(health.reply.to_lowercase().contains("health"));

        let next = engine.next_turn("Just the usual aches").await;
        assert!(next.reply.to_lowercase().contains("alzheimer"));
    }

    #[tokio::test]
    async fn test_disqualifying_answer_hangs_up() {
        let backend = ScriptedBackend::new(vec![
            Ok(qual_update(serde_json::json!({"verified_info": true}))),
            Ok(qual_update(serde_json::json!({"no_alzheimers": false}))),
        ]);
        let lead = test_lead();
        let mut engine = DialogueEngine::new(backend, &lead);
        engine.greeting_text();

        engine.next_turn("Yes that's me").await;
        let outcome = engine.next_turn("Yes, I was diagnosed with Alzheimer's").await;
        assert!(outcome.should_hangup);
        assert!(!outcome.should_transfer);
        assert_eq!(outcome.stage, DialogueStage::Disqualified);
        assert!(outcome.reply.to_lowercase().contains("day"));
    }

    #[tokio::test]
    async fn test_full_ladder_to_transfer() {
        let backend = ScriptedBackend::new(vec![
            Ok(qual_update(serde_json::json!({"verified_info": true}))),
            // Free-text reply to the non-qualification health question
            Ok(ChatOutcome {
                text: Some(
                    "Glad to hear it. Have you ever been diagnosed with Alzheimer's or dementia?"
                        .to_string(),
                ),
                tool_calls: vec![],
                usage: TokenUsage::default(),
            }),
            Ok(qual_update(serde_json::json!({"no_alzheimers": true}))),
            Ok(qual_update(serde_json::json!({"no_hospice": true}))),
            Ok(qual_update(serde_json::json!({"age_qualified": true}))),
            Ok(qual_update(serde_json::json!({"has_bank_account": true}))),
            Ok(ChatOutcome {
                text: None,
                tool_calls: vec![ToolCall {
                    name: "set_call_outcome".to_string(),
                    arguments: serde_json::json!({"outcome": "transfer_to_agent"}),
                }],
                usage: TokenUsage::default(),
            }),
        ]);
        let lead = test_lead();
        let mut engine = DialogueEngine::new(backend, &lead);
        engine.greeting_text();

        let health = engine.next_turn("Yes that's right").await;
        assert!(health.reply.to_lowercase().contains("health"));
        engine.next_turn("No, nothing major").await;
        engine.next_turn("No").await;
        engine.next_turn("No, I'm at home").await;
        engine.next_turn("I'm 62").await;
        let confirm = engine.next_turn("Yes I do").await;
        // All five qualified: the engine should now pitch the transfer
        assert_eq!(confirm.stage, DialogueStage::Qualified);
        assert!(confirm.reply.to_lowercase().contains("sound good"));

        let transfer = engine.next_turn("Yes").await;
        assert!(transfer.should_transfer);
        assert!(!transfer.should_hangup);
    }

    #[tokio::test]
    async fn test_premature_transfer_is_dropped() {
        let backend = ScriptedBackend::new(vec![Ok(ChatOutcome {
            text: None,
            tool_calls: vec![ToolCall {
                name: "set_call_outcome".to_string(),
                arguments: serde_json::json!({"outcome": "transfer_to_agent"}),
            }],
            usage: TokenUsage::default(),
        })]);
        let lead = test_lead();
        let mut engine = DialogueEngine::new(backend, &lead);
        engine.greeting_text();

        let outcome = engine.next_turn("Yes").await;
        assert!(!outcome.should_transfer);
        assert!(!outcome.should_hangup);
        // Falls back to the next qualification question
        assert!(!outcome.reply.is_empty());
    }

    #[tokio::test]
    async fn test_manual_inference_when_tool_not_called() {
        // Forced choice, but the model replies with plain text
        let backend = ScriptedBackend::new(vec![Ok(ChatOutcome {
            text: Some("Okay, noted.".to_string()),
            tool_calls: vec![],
            usage: TokenUsage::default(),
        })]);
        let lead = test_lead();
        let mut engine = DialogueEngine::new(backend, &lead);
        engine.greeting_text();

        let outcome = engine.next_turn("Yes that's right").await;
        assert_eq!(outcome.qualifications.verified_info, QualAnswer::Yes);
        // Reply regenerated from the ladder, not the model text; the step
        // after verification is health discovery
        assert!(outcome.reply.to_lowercase().contains("health"));
    }

    #[tokio::test]
    async fn test_llm_failure_returns_fallback() {
        let backend = ScriptedBackend::new(vec![Err(LlmError::Timeout)]);
        let lead = test_lead();
        let mut engine = DialogueEngine::new(backend, &lead);
        engine.greeting_text();

        let outcome = engine.next_turn("Yes").await;
        assert_eq!(outcome.reply, FALLBACK_REPLY);
        assert!(!outcome.should_hangup);
        assert!(!outcome.should_transfer);
        assert_eq!(engine.llm_calls(), 0);
    }

    #[tokio::test]
    async fn test_hangup_request_honoured_without_tool() {
        let backend = ScriptedBackend::new(vec![Ok(ChatOutcome {
            text: None,
            tool_calls: vec![],
            usage: TokenUsage::default(),
        })]);
        let lead = test_lead();
        let mut engine = DialogueEngine::new(backend, &lead);
        engine.greeting_text();

        let outcome = engine.next_turn("take me off your list").await;
        assert!(outcome.should_hangup);
    }

    #[tokio::test]
    async fn test_transfer_announcement_without_qualification_is_deferred() {
        let backend = ScriptedBackend::new(vec![Ok(ChatOutcome {
            text: Some("Perfect, one moment while I connect you now.".to_string()),
            tool_calls: vec![],
            usage: TokenUsage::default(),
        })]);
        let lead = test_lead();
        let mut engine = DialogueEngine::new(backend, &lead);
        engine.greeting_text();

        let outcome = engine.next_turn("okay").await;
        assert!(!outcome.should_transfer);
        assert!(outcome.should_hangup);
        assert_eq!(outcome.reply, script::polite_defer());
    }

    #[tokio::test]
    async fn test_each_question_asked_once() {
        let backend = ScriptedBackend::new(vec![
            Ok(qual_update(serde_json::json!({"verified_info": true}))),
            Ok(qual_update(serde_json::json!({"no_alzheimers": true}))),
        ]);
        let lead = test_lead();
        let mut engine = DialogueEngine::new(backend, &lead);
        engine.greeting_text();

        engine.next_turn("yes").await;
        engine.next_turn("no").await;

        let questions: Vec<_> = engine
            .history()
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .filter_map(|m| script::question_in(&m.content))
            .collect();
        let mut deduped = questions.clone();
        deduped.dedup();
        assert_eq!(questions, deduped, "a ladder question was repeated");
    }
}
