//! Per-call context
//!
//! One [`CallContext`] exists per in-flight call. It is the call's root:
//! cancelling it stops every subordinate task (media pumps, timers, LLM
//! turns) at their next suspension point. Webhook events are funnelled
//! through a per-call inbox so they are processed serially, in arrival
//! order, regardless of which server task received them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};

use outdial_agent::DialogueEngine;
use outdial_core::{CallAttempt, Lead, TerminalReason};
use outdial_pipeline::{SpeakerHandle, SttHandle};

/// How long unmatched webhook events are buffered while the worker
/// finishes registering the context
const EVENT_BUFFER_GRACE: Duration = Duration::from_secs(10);

/// Normalized webhook event, routed through the per-call inbox
#[derive(Debug, Clone)]
pub enum CallEvent {
    Initiated,
    Answered,
    StreamingStarted,
    StreamingStopped,
    MachineDetection { result: String },
    /// Carrier-side STT fallback; mirrors the provider's `final` event
    Transcription { text: String, is_final: bool },
    Hangup { cause: Option<String> },
}

/// Root state of one in-flight call
pub struct CallContext {
    pub call_id: String,
    pub lead: Lead,
    pub from_did: String,
    /// E.164 recipient
    pub to_phone: String,

    cancel_tx: watch::Sender<bool>,
    active: AtomicBool,
    pending_hangup: AtomicBool,
    transferred: AtomicBool,
    completion_tx: Mutex<Option<oneshot::Sender<TerminalReason>>>,

    /// The dialling attempt this context owns; the webhook event loop
    /// stamps connect/end times and the terminal reason onto it
    attempt: Mutex<CallAttempt>,

    /// Per-call dialogue engine; single-threaded by construction
    pub engine: tokio::sync::Mutex<DialogueEngine>,

    stt: RwLock<Option<SttHandle>>,
    speaker: RwLock<Option<SpeakerHandle>>,

    event_tx: mpsc::UnboundedSender<CallEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<CallEvent>>>,

    /// Bumped on every final transcript; lets no-response timers detect
    /// whether anything arrived while they slept
    transcript_seq: AtomicU64,
}

impl CallContext {
    /// Create the context and the completion channel the dispatcher
    /// worker waits on.
    pub fn new(
        call_id: impl Into<String>,
        lead: Lead,
        from_did: &str,
        to_phone: &str,
        engine: DialogueEngine,
    ) -> (Arc<Self>, oneshot::Receiver<TerminalReason>) {
        let (cancel_tx, _) = watch::channel(false);
        let (completion_tx, completion_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let call_id = call_id.into();
        let attempt = CallAttempt::new(call_id.clone(), lead.id, from_did, to_phone);

        let context = Arc::new(Self {
            call_id,
            lead,
            from_did: from_did.to_string(),
            to_phone: to_phone.to_string(),
            cancel_tx,
            active: AtomicBool::new(false),
            pending_hangup: AtomicBool::new(false),
            transferred: AtomicBool::new(false),
            completion_tx: Mutex::new(Some(completion_tx)),
            attempt: Mutex::new(attempt),
            engine: tokio::sync::Mutex::new(engine),
            stt: RwLock::new(None),
            speaker: RwLock::new(None),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            transcript_seq: AtomicU64::new(0),
        });

        (context, completion_rx)
    }

    /// Cancellation token observed by every subordinate task
    pub fn cancel_token(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Trip the root context. One-shot; safe to call repeatedly.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Dialogue liveness: true from answer until any hangup decision.
    /// New transcripts and utterances are only accepted while this holds.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.pending_hangup.load(Ordering::SeqCst)
    }

    /// Media liveness: true from answer until the call actually ends.
    /// The outbound speaker keeps draining an already-accepted goodbye
    /// while a hangup is pending, but stops the moment the call is gone.
    pub fn media_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Flag the hangup decision. Returns true only for the first caller,
    /// so racing timers and webhooks issue at most one hangup.
    pub fn mark_pending_hangup(&self) -> bool {
        !self.pending_hangup.swap(true, Ordering::SeqCst)
    }

    pub fn is_pending_hangup(&self) -> bool {
        self.pending_hangup.load(Ordering::SeqCst)
    }

    pub fn set_transferred(&self) {
        self.transferred.store(true, Ordering::SeqCst);
        self.attempt.lock().transferred = true;
    }

    /// Stamp the answer time onto the attempt record
    pub fn mark_connected(&self) {
        let mut attempt = self.attempt.lock();
        if attempt.connected.is_none() {
            attempt.connected = Some(std::time::Instant::now());
        }
    }

    /// Stamp the end time and terminal reason onto the attempt record
    pub fn mark_terminal(&self, reason: TerminalReason) {
        let mut attempt = self.attempt.lock();
        attempt.ended.get_or_insert_with(std::time::Instant::now);
        attempt.terminal.get_or_insert(reason);
    }

    /// Snapshot of the owned dialling attempt
    pub fn attempt(&self) -> CallAttempt {
        self.attempt.lock().clone()
    }

    pub fn is_transferred(&self) -> bool {
        self.transferred.load(Ordering::SeqCst)
    }

    /// Resolve the dispatcher's completion wait. Idempotent.
    pub fn complete(&self, reason: TerminalReason) {
        if let Some(tx) = self.completion_tx.lock().take() {
            let _ = tx.send(reason);
        }
    }

    pub fn set_stt(&self, handle: SttHandle) {
        *self.stt.write() = Some(handle);
    }

    /// Forward audio towards the STT socket; frames before the client is
    /// ready are dropped silently.
    pub fn send_audio(&self, chunk: Vec<u8>) {
        if let Some(stt) = self.stt.read().as_ref() {
            stt.send_audio(chunk);
        }
    }

    pub fn stt_ready(&self) -> bool {
        self.stt.read().is_some()
    }

    pub fn set_speaker(&self, handle: SpeakerHandle) {
        *self.speaker.write() = Some(handle);
    }

    pub fn speaker(&self) -> Option<SpeakerHandle> {
        self.speaker.read().clone()
    }

    /// Enqueue a webhook event into the per-call inbox
    pub fn enqueue(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Take the inbox receiver; the runtime's event task owns it.
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
        self.event_rx.lock().take()
    }

    pub fn note_final_transcript(&self) -> u64 {
        self.transcript_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn transcript_seq(&self) -> u64 {
        self.transcript_seq.load(Ordering::SeqCst)
    }
}

/// Process-wide registry of in-flight call contexts.
///
/// Also buffers webhook events that arrive before the dispatcher worker
/// finished registering the context (carrier webhooks can beat the HTTP
/// response to the create-call request).
#[derive(Default)]
pub struct CallContextRegistry {
    contexts: DashMap<String, Arc<CallContext>>,
    buffered: DashMap<String, (Instant, Vec<CallEvent>)>,
}

impl CallContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context and drain any buffered events into its inbox.
    pub fn insert(&self, context: Arc<CallContext>) {
        if let Some((_, (_, events))) = self.buffered.remove(&context.call_id) {
            for event in events {
                context.enqueue(event);
            }
        }
        self.contexts.insert(context.call_id.clone(), context);
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<CallContext>> {
        self.contexts.get(call_id).map(|e| e.clone())
    }

    pub fn remove(&self, call_id: &str) -> Option<Arc<CallContext>> {
        self.contexts.remove(call_id).map(|(_, ctx)| ctx)
    }

    pub fn active_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.contexts.iter().map(|e| e.key().clone()).collect()
    }

    pub fn all(&self) -> Vec<Arc<CallContext>> {
        self.contexts.iter().map(|e| e.value().clone()).collect()
    }

    /// Buffer an event for a not-yet-registered call. Expired buffers are
    /// swept opportunistically.
    pub fn buffer_event(&self, call_id: &str, event: CallEvent) {
        self.buffered
            .retain(|_, (stored, _)| stored.elapsed() < EVENT_BUFFER_GRACE);
        self.buffered
            .entry(call_id.to_string())
            .or_insert_with(|| (Instant::now(), Vec::new()))
            .1
            .push(event);
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    struct NoopBackend;

    #[async_trait::async_trait]
    impl outdial_llm::ChatBackend for NoopBackend {
        async fn chat(
            &self,
            _request: outdial_llm::ChatRequest,
        ) -> Result<outdial_llm::ChatOutcome, outdial_llm::LlmError> {
            Err(outdial_llm::LlmError::Timeout)
        }

        fn model_name(&self) -> &str {
            "noop"
        }
    }

    fn test_context() -> (Arc<CallContext>, tokio::sync::oneshot::Receiver<TerminalReason>) {
        let lead = Lead {
            id: uuid::Uuid::new_v4(),
            first_name: "Terry".to_string(),
            last_name: "Hodges".to_string(),
            phone: Some("+15307748286".to_string()),
            email: None,
            address: None,
            status: Default::default(),
            answer_type: None,
            call_attempts: 0,
            last_call_at: None,
            from_number: None,
        };
        let engine = DialogueEngine::new(StdArc::new(NoopBackend), &lead);
        CallContext::new("cc-1", lead, "+16592389182", "+15307748286", engine)
    }

    #[tokio::test]
    async fn test_pending_hangup_races_resolve_to_one_winner() {
        let (ctx, _rx) = test_context();
        assert!(ctx.mark_pending_hangup());
        assert!(!ctx.mark_pending_hangup());
        assert!(ctx.is_pending_hangup());
    }

    #[tokio::test]
    async fn test_active_goes_false_once_hangup_pending() {
        let (ctx, _rx) = test_context();
        ctx.set_active(true);
        assert!(ctx.is_active());
        ctx.mark_pending_hangup();
        assert!(!ctx.is_active());
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let (ctx, rx) = test_context();
        ctx.complete(TerminalReason::Completed);
        ctx.complete(TerminalReason::Timeout);
        assert_eq!(rx.await.unwrap(), TerminalReason::Completed);
    }

    #[tokio::test]
    async fn test_attempt_records_lifecycle() {
        let (ctx, _rx) = test_context();
        assert!(ctx.attempt().connected.is_none());

        ctx.mark_connected();
        ctx.mark_connected();
        let connected = ctx.attempt().connected;
        assert!(connected.is_some());

        ctx.set_transferred();
        ctx.mark_terminal(TerminalReason::Transferred);
        // A second terminal write does not overwrite the first
        ctx.mark_terminal(TerminalReason::Timeout);

        let attempt = ctx.attempt();
        assert_eq!(attempt.terminal, Some(TerminalReason::Transferred));
        assert!(attempt.transferred);
        assert_eq!(attempt.connected, connected);
        assert!(attempt.ended.is_some());
    }

    #[tokio::test]
    async fn test_cancel_visible_on_token() {
        let (ctx, _rx) = test_context();
        let token = ctx.cancel_token();
        assert!(!*token.borrow());
        ctx.cancel();
        assert!(*token.borrow());
    }

    #[tokio::test]
    async fn test_buffered_events_drain_on_insert() {
        let registry = CallContextRegistry::new();
        registry.buffer_event("cc-1", CallEvent::Initiated);
        registry.buffer_event("cc-1", CallEvent::Answered);
        assert_eq!(registry.buffered_count(), 1);

        let (ctx, _rx) = test_context();
        registry.insert(ctx.clone());
        assert_eq!(registry.buffered_count(), 0);

        let mut inbox = ctx.take_event_rx().unwrap();
        assert!(matches!(inbox.try_recv(), Ok(CallEvent::Initiated)));
        assert!(matches!(inbox.try_recv(), Ok(CallEvent::Answered)));
    }
}
