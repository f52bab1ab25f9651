//! Per-call runtime
//!
//! Wires one call end to end: origination through the carrier, the
//! webhook event loop, the transcript-to-dialogue loop, transfer and
//! hangup flows, and finalization into the recorder, ledger and stores.
//! The dispatcher only ever sees the [`CallDriver`] seam and a completion
//! channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use outdial_agent::{DialogueEngine, DialogueStage, NO_RESPONSE_PROMPT};
use outdial_core::{AnswerType, Lead, LeadStatus, Speaker, TerminalReason, TransferRecord};
use outdial_llm::ChatBackend;
use outdial_persistence::PersistenceLayer;
use outdial_pipeline::{
    OutboundSpeaker, SpeakerHandle, SttConnector, SttEvent, Synthesizer,
};
use outdial_telephony::{event_types, CarrierApi, CarrierError, ClientState, WebhookEvent};

use crate::context::{CallContext, CallContextRegistry, CallEvent};
use crate::costs::CostLedger;
use crate::dispatcher::{CallDriver, OriginatedCall};
use crate::did::Did;
use crate::recorder::{ConversationRecorder, FinalizeInputs};
use crate::registry::ActivePhoneRegistry;

/// Bound on waiting for the speaker to drain before hangup or finalize
const SPEAKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the per-call runtime needs, shared process-wide
pub struct CallServices {
    pub carrier: Arc<dyn CarrierApi>,
    pub tts: Arc<dyn Synthesizer>,
    pub llm: Arc<dyn ChatBackend>,
    pub stt: Arc<dyn SttConnector>,
    /// When true, inbound carrier audio is decoded and upsampled to PCM
    /// 16 kHz before it is fed to the STT provider
    pub stt_linear16: bool,
    /// Public base URL; the media socket URL is derived from it
    pub webhook_base_url: String,
    /// Number qualified leads are transferred to; operator-adjustable
    pub transfer_number: RwLock<String>,
    /// Carrier-verified origination number for the transfer leg, if any
    pub verified_number: Option<String>,
    pub no_response_timeout: Duration,
    pub contexts: Arc<CallContextRegistry>,
    pub registry: Arc<ActivePhoneRegistry>,
    pub recorder: Arc<ConversationRecorder>,
    pub ledger: Arc<CostLedger>,
    pub persistence: Option<PersistenceLayer>,
}

impl CallServices {
    /// WebSocket URL the carrier should connect its media stream to
    pub fn media_ws_url(&self) -> String {
        let base = self
            .webhook_base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/media", base.trim_end_matches('/'))
    }
}

/// Production [`CallDriver`]: originates through the carrier and runs the
/// call until its terminal webhook.
pub struct ProductionCallDriver {
    services: Arc<CallServices>,
}

impl ProductionCallDriver {
    pub fn new(services: Arc<CallServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CallDriver for ProductionCallDriver {
    async fn originate(&self, lead: &Lead, did: &Did) -> Result<OriginatedCall, CarrierError> {
        let services = &self.services;
        let to_phone = lead.phone.clone().unwrap_or_default();
        let client_state =
            ClientState::for_dial(lead.id, &lead.full_name(), &to_phone, &did.number);

        let created = services
            .carrier
            .create_call(&to_phone, &did.number, &client_state)
            .await?;
        let call_id = created.call_id;

        let engine = DialogueEngine::new(services.llm.clone(), lead);
        let (context, completion) =
            CallContext::new(&call_id, lead.clone(), &did.number, &to_phone, engine);

        services.recorder.initialize(&call_id, &did.number, &to_phone);
        services.ledger.init(&call_id);
        services.contexts.insert(context.clone());

        // Event loop owning this call's webhook inbox
        tokio::spawn(run_call_events(Arc::clone(services), context));

        // Source-of-truth call row first, then the lead flips to `called`.
        // Metadata failures never abort the call.
        if let Some(persistence) = &services.persistence {
            if let Err(e) = persistence
                .calls
                .record(&call_id, lead.id, &did.number, &to_phone)
                .await
            {
                tracing::warn!(call_id = %call_id, "Failed to record call row: {}", e);
            }
            if let Err(e) = persistence.leads.mark_called(lead.id, &did.number).await {
                tracing::warn!(call_id = %call_id, "Failed to mark lead called: {}", e);
            }
        }

        Ok(OriginatedCall {
            call_id,
            completion,
        })
    }
}

/// Translate and route one carrier webhook. Unknown calls get a short
/// buffering grace; transfer-leg events are ignored.
pub fn route_webhook(services: &Arc<CallServices>, event: WebhookEvent) {
    let call_id = event.payload.call_control_id.clone();
    if call_id.is_empty() {
        tracing::debug!(event_type = %event.event_type, "Webhook without call id");
        return;
    }

    let call_event = match event.event_type.as_str() {
        event_types::CALL_INITIATED => CallEvent::Initiated,
        event_types::CALL_ANSWERED => CallEvent::Answered,
        event_types::STREAMING_STARTED => CallEvent::StreamingStarted,
        event_types::STREAMING_STOPPED => CallEvent::StreamingStopped,
        event_types::MACHINE_DETECTION_ENDED => CallEvent::MachineDetection {
            result: event.payload.result.clone().unwrap_or_default(),
        },
        event_types::CALL_HANGUP => CallEvent::Hangup {
            cause: event.payload.hangup_cause.clone(),
        },
        event_types::TRANSCRIPTION => {
            let Some(data) = event.payload.transcription_data.clone() else {
                return;
            };
            CallEvent::Transcription {
                text: data.transcript,
                is_final: data.is_final,
            }
        }
        other => {
            tracing::debug!(event_type = %other, "Ignoring webhook event");
            return;
        }
    };

    if let Some(context) = services.contexts.get(&call_id) {
        context.enqueue(call_event);
        return;
    }

    // The transfer leg carries our client_state with is_transfer set; its
    // lifecycle is not ours to manage
    if let Some(encoded) = &event.payload.client_state {
        if let Ok(state) = ClientState::decode(encoded) {
            if state.is_transfer {
                tracing::debug!(call_id = %call_id, "Ignoring transfer-leg event");
                return;
            }
        }
    }

    if matches!(call_event, CallEvent::Hangup { .. }) {
        // Late terminal event for a call we no longer own (e.g. after a
        // completion timeout or restart): persist what we can, do not
        // re-enter the pipeline
        tracing::warn!(call_id = %call_id, "Hangup for unregistered call");
        if !services.recorder.is_finalized(&call_id) && services.recorder.get(&call_id).is_some() {
            let summary = services.ledger.finalize(&call_id, false);
            let record = services.recorder.finalize(
                &call_id,
                FinalizeInputs {
                    cost_total: summary.total,
                    cost_breakdown: summary.breakdown.clone(),
                    tts_seconds: summary.tts_seconds,
                    llm_calls: summary.llm_calls,
                    transferred: false,
                    hangup_cause: None,
                    engine_history: &[],
                    expected_to_phone: None,
                },
            );
            if let (Some(record), Some(persistence)) = (record, services.persistence.clone()) {
                tokio::spawn(async move {
                    if let Err(e) = persistence.conversations.upsert(&record).await {
                        tracing::warn!(call_id = %record.call_id, "Best-effort persist failed: {}", e);
                    }
                });
            }
        }
        return;
    }

    tracing::debug!(call_id = %call_id, "Buffering webhook for unregistered call");
    services.contexts.buffer_event(&call_id, call_event);
}

/// Per-call event loop: consumes the inbox serially, in arrival order.
pub async fn run_call_events(services: Arc<CallServices>, context: Arc<CallContext>) {
    let Some(mut inbox) = context.take_event_rx() else {
        return;
    };
    let mut cancel = context.cancel_token();

    loop {
        tokio::select! {
            event = inbox.recv() => match event {
                Some(event) => {
                    let terminal = matches!(event, CallEvent::Hangup { .. });
                    handle_event(&services, &context, event).await;
                    if terminal {
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!(call_id = %context.call_id, "Call event loop exited");
}

async fn handle_event(services: &Arc<CallServices>, context: &Arc<CallContext>, event: CallEvent) {
    match event {
        CallEvent::Initiated => {
            services.ledger.mark_initiated(&context.call_id);
            mark_webhook(services, &context.call_id, "initiated").await;
        }
        CallEvent::Answered => {
            services.ledger.mark_connected(&context.call_id);
            context.mark_connected();
            context.set_active(true);
            mark_webhook(services, &context.call_id, "answered").await;

            match services.stt.connect(context.cancel_token()).await {
                Ok((handle, events)) => {
                    context.set_stt(handle);
                    tokio::spawn(run_transcripts(
                        Arc::clone(services),
                        Arc::clone(context),
                        events,
                    ));
                }
                Err(e) => {
                    // One STT failure fails the media pipeline for the call
                    tracing::error!(call_id = %context.call_id, "STT connect failed: {}", e);
                    initiate_hangup(services, context).await;
                    return;
                }
            }

            let ws_url = services.media_ws_url();
            if let Err(e) = services
                .carrier
                .start_bidirectional_stream(&context.call_id, &ws_url)
                .await
            {
                tracing::error!(call_id = %context.call_id, "Failed to start media stream: {}", e);
                initiate_hangup(services, context).await;
            }
        }
        CallEvent::StreamingStarted => {
            services.ledger.mark_streaming(&context.call_id);
        }
        CallEvent::StreamingStopped => {}
        CallEvent::MachineDetection { result } => {
            let verdict = outdial_telephony::MachineDetectionResult::parse(&result);
            if verdict == outdial_telephony::MachineDetectionResult::Machine {
                services.recorder.add_message(
                    &context.call_id,
                    Speaker::System,
                    &format!("[AMD Detection: {}]", result),
                );
            }
        }
        CallEvent::Transcription { text, is_final } => {
            // Carrier-side STT fallback mirrors the provider's final event
            if is_final {
                handle_final_transcript(services, context, &text).await;
            }
        }
        CallEvent::Hangup { cause } => {
            context.mark_pending_hangup();
            context.set_active(false);
            finalize_call(services, context, cause).await;
        }
    }
}

/// STT event loop for one call
async fn run_transcripts(
    services: Arc<CallServices>,
    context: Arc<CallContext>,
    mut events: mpsc::Receiver<SttEvent>,
) {
    let mut cancel = context.cancel_token();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SttEvent::Partial { .. }) => {}
                Some(SttEvent::Final { text, confidence }) => {
                    tracing::debug!(call_id = %context.call_id, confidence, transcript = %text, "Final transcript");
                    handle_final_transcript(&services, &context, &text).await;
                }
                Some(SttEvent::Closed) | None => {
                    if context.is_active() {
                        // Media fault mid-call: hang up; the recorder
                        // classifies from what was captured
                        tracing::warn!(call_id = %context.call_id, "STT stream closed mid-call");
                        initiate_hangup(&services, &context).await;
                    }
                    break;
                }
            },
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    break;
                }
            }
        }
    }
}

/// One dialogue turn: transcript in, spoken reply and transitions out.
async fn handle_final_transcript(
    services: &Arc<CallServices>,
    context: &Arc<CallContext>,
    transcript: &str,
) {
    if !context.is_active() {
        tracing::debug!(call_id = %context.call_id, "Dropping transcript for inactive call");
        return;
    }
    context.note_final_transcript();
    services
        .recorder
        .add_message(&context.call_id, Speaker::Lead, transcript);

    let outcome = {
        let mut engine = context.engine.lock().await;
        let calls_before = engine.llm_calls();
        let outcome = engine.next_turn(transcript).await;
        if engine.llm_calls() > calls_before {
            services.ledger.add_llm_usage(&context.call_id, outcome.usage);
        }
        outcome
    };

    services
        .recorder
        .add_message(&context.call_id, Speaker::Ai, &outcome.reply);
    if let Some(speaker) = context.speaker() {
        speaker.speak(outcome.reply.clone());
    }

    if outcome.should_transfer {
        perform_transfer(services, context).await;
    } else if outcome.should_hangup {
        initiate_hangup(services, context).await;
    }
}

/// Blind-transfer a fully qualified lead to the human agent number.
async fn perform_transfer(services: &Arc<CallServices>, context: &Arc<CallContext>) {
    // Let the announcement play out before the leg is replaced
    if let Some(speaker) = context.speaker() {
        speaker.wait_idle(SPEAKER_DRAIN_TIMEOUT).await;
    }

    let transfer_to = services.transfer_number.read().clone();
    if transfer_to.is_empty() {
        tracing::error!(call_id = %context.call_id, "No transfer number configured");
        initiate_hangup(services, context).await;
        return;
    }
    let transfer_from = services
        .verified_number
        .clone()
        .unwrap_or_else(|| context.from_did.clone());

    match services
        .carrier
        .transfer(&context.call_id, &transfer_to, &transfer_from)
        .await
    {
        Ok(()) => {
            context.set_transferred();
            services.ledger.add_transfer(&context.call_id);
            metrics::counter!("outdial_transfers_total").increment(1);
            tracing::info!(call_id = %context.call_id, to = %transfer_to, "Lead transferred");

            if let Some(persistence) = &services.persistence {
                let record = TransferRecord {
                    call_id: context.call_id.clone(),
                    lead_id: context.lead.id,
                    lead_name: context.lead.full_name(),
                    lead_phone: context.to_phone.clone(),
                    from_did: context.from_did.clone(),
                    to_agent_number: transfer_to,
                    transferred_at: chrono::Utc::now(),
                };
                if let Err(e) = persistence.transfers.upsert(&record).await {
                    tracing::warn!(call_id = %context.call_id, "Failed to persist transfer: {}", e);
                }
                if let Err(e) = persistence
                    .leads
                    .set_outcome(context.lead.id, LeadStatus::Qualified, Some(AnswerType::Answered))
                    .await
                {
                    tracing::warn!(call_id = %context.call_id, "Failed to mark lead qualified: {}", e);
                }
            }
            // Our leg ends via the carrier's hangup webhook
        }
        Err(CarrierError::UnverifiedNumber(detail)) => {
            tracing::error!(call_id = %context.call_id, "Transfer refused, unverified number: {}", detail);
            initiate_hangup(services, context).await;
        }
        Err(CarrierError::CallEnded) => {
            tracing::warn!(call_id = %context.call_id, "Transfer raced call end");
            // Treated as "transfer not performed"; the hangup webhook
            // finalizes the call
        }
        Err(e) => {
            tracing::error!(call_id = %context.call_id, "Transfer failed: {}", e);
            initiate_hangup(services, context).await;
        }
    }
}

/// Decide hangup once, drain the goodbye, then hang up at the carrier.
pub async fn initiate_hangup(services: &Arc<CallServices>, context: &Arc<CallContext>) {
    if !context.mark_pending_hangup() {
        return;
    }
    if let Some(speaker) = context.speaker() {
        speaker.wait_idle(SPEAKER_DRAIN_TIMEOUT).await;
    }
    if let Err(e) = services.carrier.hangup(&context.call_id).await {
        tracing::warn!(call_id = %context.call_id, "Hangup failed: {}", e);
    }
}

/// Arm the no-response watchdog: one prompt, then hangup.
pub fn arm_no_response_timer(services: Arc<CallServices>, context: Arc<CallContext>) {
    tokio::spawn(async move {
        let timeout = services.no_response_timeout;
        let mut cancel = context.cancel_token();
        let mut prompted = false;
        loop {
            let seq_before = context.transcript_seq();
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return;
                    }
                    continue;
                }
            }
            if !context.is_active() {
                return;
            }
            if context.transcript_seq() > seq_before {
                prompted = false;
                continue;
            }
            if !prompted {
                prompted = true;
                tracing::info!(call_id = %context.call_id, "No response; prompting");
                services.recorder.add_message(
                    &context.call_id,
                    Speaker::Ai,
                    NO_RESPONSE_PROMPT,
                );
                if let Some(speaker) = context.speaker() {
                    speaker.speak(NO_RESPONSE_PROMPT);
                }
            } else {
                tracing::info!(call_id = %context.call_id, "Still no response; hanging up");
                initiate_hangup(&services, &context).await;
                return;
            }
        }
    });
}

/// Attach the carrier media socket: spawn the speaker, send the scripted
/// greeting, and arm the no-response watchdog. Called by the media
/// WebSocket handler once the `start` prelude identifies the call.
pub async fn attach_media(
    services: &Arc<CallServices>,
    context: &Arc<CallContext>,
    frame_tx: mpsc::Sender<Vec<u8>>,
) -> SpeakerHandle {
    let media_context = Arc::clone(context);
    let ledger = Arc::clone(&services.ledger);
    let cost_call_id = context.call_id.clone();

    let speaker = OutboundSpeaker::spawn(
        Arc::clone(&services.tts),
        frame_tx,
        Arc::new(move || media_context.media_active()),
        Arc::new(move |seconds| ledger.add_tts_seconds(&cost_call_id, seconds)),
        context.cancel_token(),
    );
    context.set_speaker(speaker.clone());

    {
        let mut engine = context.engine.lock().await;
        if let Some(text) = engine.greeting_text() {
            services
                .recorder
                .add_message(&context.call_id, Speaker::Ai, &text);
            speaker.speak(text);
        }
        if let Some(text) = engine.greeting_part_two_text() {
            services
                .recorder
                .add_message(&context.call_id, Speaker::Ai, &text);
            speaker.speak(text);
        }
    }

    arm_no_response_timer(Arc::clone(services), Arc::clone(context));
    speaker
}

/// Collapse the call into its canonical record and release everything.
async fn finalize_call(
    services: &Arc<CallServices>,
    context: &Arc<CallContext>,
    hangup_cause: Option<String>,
) {
    // Utterances already accepted should reach the transcript
    if let Some(speaker) = context.speaker() {
        speaker.wait_idle(SPEAKER_DRAIN_TIMEOUT).await;
    }

    services.ledger.mark_ended(&context.call_id);
    let summary = services
        .ledger
        .finalize(&context.call_id, context.is_transferred());

    let (history, stage) = {
        let engine = context.engine.lock().await;
        (engine.history().to_vec(), engine.stage())
    };

    // The attempt metadata is authoritative for the recipient number
    let attempt = context.attempt();
    let record = services.recorder.finalize(
        &context.call_id,
        FinalizeInputs {
            cost_total: summary.total,
            cost_breakdown: summary.breakdown.clone(),
            tts_seconds: summary.tts_seconds,
            llm_calls: summary.llm_calls,
            transferred: context.is_transferred(),
            hangup_cause: hangup_cause.clone(),
            engine_history: &history,
            expected_to_phone: Some(&attempt.to_phone),
        },
    );

    mark_webhook(services, &context.call_id, "hangup").await;

    let terminal = if let Some(record) = &record {
        use outdial_core::ConversationStatus;

        if let Some(persistence) = &services.persistence {
            if let Err(e) = persistence.conversations.upsert(record).await {
                tracing::warn!(call_id = %context.call_id, "Failed to persist conversation: {}", e);
            }
            let cost_row = outdial_persistence::CostRow {
                call_id: context.call_id.clone(),
                total: summary.total,
                breakdown: summary.breakdown.clone(),
                llm_calls: summary.llm_calls as i64,
                transferred: context.is_transferred(),
            };
            if let Err(e) = persistence.costs.upsert(&cost_row).await {
                tracing::warn!(call_id = %context.call_id, "Failed to persist costs: {}", e);
            }

            // Outcome reconciliation back onto the lead
            let (lead_status, answer) = match record.status {
                ConversationStatus::Transferred => (LeadStatus::Qualified, Some(AnswerType::Answered)),
                ConversationStatus::Completed => {
                    if stage == DialogueStage::Disqualified {
                        (LeadStatus::Disqualified, Some(AnswerType::Answered))
                    } else {
                        (LeadStatus::Called, Some(AnswerType::Answered))
                    }
                }
                ConversationStatus::Voicemail => (LeadStatus::Called, Some(AnswerType::Voicemail)),
                ConversationStatus::NoAnswer => (LeadStatus::Called, Some(AnswerType::NoAnswer)),
                ConversationStatus::NoResponse => (LeadStatus::Called, Some(AnswerType::Answered)),
                ConversationStatus::Active => (LeadStatus::Called, None),
            };
            if let Err(e) = persistence
                .leads
                .set_outcome(context.lead.id, lead_status, answer)
                .await
            {
                tracing::warn!(call_id = %context.call_id, "Failed to reconcile lead outcome: {}", e);
            }
        }

        match record.status {
            ConversationStatus::Transferred => TerminalReason::Transferred,
            ConversationStatus::Voicemail => TerminalReason::Voicemail,
            ConversationStatus::NoAnswer => {
                if hangup_cause.as_deref() == Some("user_busy") {
                    TerminalReason::Busy
                } else {
                    TerminalReason::NoAnswer
                }
            }
            _ => TerminalReason::Completed,
        }
    } else {
        // A concurrent path already finalized; nothing further to persist
        TerminalReason::Completed
    };

    context.mark_terminal(terminal);
    context.cancel();
    services.contexts.remove(&context.call_id);
    services.registry.release(&context.to_phone);
    services.recorder.remove(&context.call_id);
    context.complete(terminal);

    metrics::counter!("outdial_calls_finalized_total").increment(1);
}

async fn mark_webhook(services: &Arc<CallServices>, call_id: &str, status: &str) {
    if let Some(persistence) = &services.persistence {
        if let Err(e) = persistence.calls.mark_webhook(call_id, status).await {
            tracing::debug!(call_id = %call_id, "Failed to mark webhook: {}", e);
        }
    }
}
