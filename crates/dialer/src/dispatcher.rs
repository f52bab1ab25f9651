//! Dispatcher
//!
//! A bounded-concurrency queue drainer. One scheduler task pops leads,
//! reserves the per-phone slot and the concurrency slot, then spawns a
//! worker per call attempt. Workers surface terminal reasons as values;
//! retry policy is decided here by matching the carrier error tag, never
//! by parsing error text.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{oneshot, Notify};

use outdial_core::phone::normalize_phone;
use outdial_core::{Lead, TerminalReason};
use outdial_telephony::CarrierError;

use crate::did::{Did, DidPool};
use crate::registry::ActivePhoneRegistry;

/// Idle poll interval for the scheduler when it has nothing to dispatch
const SCHEDULER_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Backoff when a phone is already being dialled and the item re-queues
const BUSY_REQUEUE_DELAY: Duration = Duration::from_millis(50);

/// One queued dial attempt
#[derive(Debug, Clone)]
pub struct CallItem {
    pub lead: Lead,
    pub attempts: u32,
}

/// Overall agent state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Stopped,
    Running,
    Paused,
}

/// Dispatcher knobs, adjustable at runtime through the operator API
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent_calls: usize,
    pub delay_between_calls: Duration,
    pub max_origination_attempts: u32,
    pub call_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 10,
            delay_between_calls: Duration::from_millis(500),
            max_origination_attempts: 3,
            call_timeout: Duration::from_secs(300),
        }
    }
}

/// A successfully originated call and its completion signal
pub struct OriginatedCall {
    pub call_id: String,
    /// Resolved by the webhook router when the call reaches a terminal state
    pub completion: oneshot::Receiver<TerminalReason>,
}

/// Seam between the dispatcher and the per-call runtime.
///
/// The production driver originates through the carrier, registers the
/// call context and wires up recording; tests substitute a scripted fake.
#[async_trait]
pub trait CallDriver: Send + Sync {
    async fn originate(&self, lead: &Lead, did: &Did) -> Result<OriginatedCall, CarrierError>;
}

/// Monotonic counters exposed on the stats endpoint
#[derive(Default)]
pub struct DispatcherStats {
    pub total_calls: AtomicU64,
    pub failed_calls: AtomicU64,
    pub channel_limit_rejections: AtomicU64,
    pub completed: AtomicU64,
    pub transferred: AtomicU64,
    pub voicemails: AtomicU64,
    pub no_answers: AtomicU64,
    pub timeouts: AtomicU64,
}

/// Serializable view of [`DispatcherStats`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub channel_limit_rejections: u64,
    pub completed: u64,
    pub transferred: u64,
    pub voicemails: u64,
    pub no_answers: u64,
    pub timeouts: u64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            channel_limit_rejections: self.channel_limit_rejections.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            transferred: self.transferred.load(Ordering::Relaxed),
            voicemails: self.voicemails.load(Ordering::Relaxed),
            no_answers: self.no_answers.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    fn record_terminal(&self, reason: TerminalReason) {
        match reason {
            TerminalReason::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            TerminalReason::Transferred => self.transferred.fetch_add(1, Ordering::Relaxed),
            TerminalReason::Voicemail => self.voicemails.fetch_add(1, Ordering::Relaxed),
            TerminalReason::NoAnswer | TerminalReason::Busy => {
                self.no_answers.fetch_add(1, Ordering::Relaxed)
            }
            TerminalReason::Timeout => self.timeouts.fetch_add(1, Ordering::Relaxed),
            TerminalReason::OriginationFailed => self.failed_calls.fetch_add(1, Ordering::Relaxed),
        };
    }
}

enum AttemptResult {
    Done,
    Requeue(Lead),
}

/// The dispatcher
pub struct Dispatcher {
    config: RwLock<DispatcherConfig>,
    state: Mutex<AgentState>,
    queue: Mutex<VecDeque<CallItem>>,
    active_calls: AtomicUsize,
    registry: Arc<ActivePhoneRegistry>,
    did_pool: Arc<DidPool>,
    driver: Arc<dyn CallDriver>,
    stats: Arc<DispatcherStats>,
    wake: Notify,
    scheduler_running: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        did_pool: Arc<DidPool>,
        registry: Arc<ActivePhoneRegistry>,
        driver: Arc<dyn CallDriver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            state: Mutex::new(AgentState::Stopped),
            queue: Mutex::new(VecDeque::new()),
            active_calls: AtomicUsize::new(0),
            registry,
            did_pool,
            driver,
            stats: Arc::new(DispatcherStats::default()),
            wake: Notify::new(),
            scheduler_running: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    pub fn config(&self) -> DispatcherConfig {
        self.config.read().clone()
    }

    /// Adjust concurrency and pacing; takes effect on the next dispatch.
    pub fn set_config(&self, max_concurrent_calls: usize, delay_between_calls: Duration) {
        let mut config = self.config.write();
        config.max_concurrent_calls = max_concurrent_calls.clamp(1, 50);
        config.delay_between_calls = delay_between_calls;
    }

    /// Enqueue leads and start dialling.
    pub fn start(self: &Arc<Self>, leads: Vec<Lead>) {
        {
            let mut queue = self.queue.lock();
            for lead in leads {
                if lead.phone.is_none() {
                    tracing::warn!(lead_id = %lead.id, "Skipping lead without a phone number");
                    continue;
                }
                queue.push_back(CallItem { lead, attempts: 0 });
            }
            metrics::gauge!("outdial_queue_depth").set(queue.len() as f64);
        }
        *self.state.lock() = AgentState::Running;
        self.spawn_scheduler();
        self.wake.notify_one();
        tracing::info!(queued = self.queue_len(), "Dialler started");
    }

    /// Stop popping; in-flight workers continue.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if *state == AgentState::Running {
            *state = AgentState::Paused;
            tracing::info!("Dialler paused");
        }
    }

    pub fn resume(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != AgentState::Paused {
                return;
            }
            *state = AgentState::Running;
        }
        self.spawn_scheduler();
        self.wake.notify_one();
        tracing::info!("Dialler resumed");
    }

    /// Clear the queue and stop. In-flight workers run to completion.
    pub fn stop(&self) {
        let dropped = {
            let mut queue = self.queue.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        *self.state.lock() = AgentState::Stopped;
        metrics::gauge!("outdial_queue_depth").set(0.0);
        self.wake.notify_one();
        tracing::info!(dropped_queue_items = dropped, "Dialler stopped");
    }

    fn spawn_scheduler(self: &Arc<Self>) {
        if self.scheduler_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                this.run_scheduler().await;
                this.scheduler_running.store(false, Ordering::SeqCst);
                // A start() may have raced this scheduler's exit; pick its
                // work up instead of leaving the queue stranded
                if this.state() == AgentState::Running
                    && !this.queue.lock().is_empty()
                    && !this.scheduler_running.swap(true, Ordering::SeqCst)
                {
                    continue;
                }
                break;
            }
        });
    }

    async fn run_scheduler(self: &Arc<Self>) {
        tracing::debug!("Scheduler running");
        loop {
            let state = *self.state.lock();
            match state {
                AgentState::Stopped => {
                    if self.active_calls() == 0 {
                        break;
                    }
                    tokio::time::sleep(SCHEDULER_IDLE_WAIT).await;
                    continue;
                }
                AgentState::Paused => {
                    tokio::time::sleep(SCHEDULER_IDLE_WAIT).await;
                    continue;
                }
                AgentState::Running => {}
            }

            let max = self.config.read().max_concurrent_calls;
            if self.active_calls() >= max {
                self.wait_for_wake().await;
                continue;
            }

            let item = self.queue.lock().pop_front();
            let Some(item) = item else {
                if self.active_calls() == 0 {
                    *self.state.lock() = AgentState::Stopped;
                    tracing::info!("Queue drained; dialler stopped");
                    break;
                }
                self.wait_for_wake().await;
                continue;
            };
            metrics::gauge!("outdial_queue_depth").set(self.queue_len() as f64);

            let Some(raw_phone) = item.lead.phone.clone() else {
                continue;
            };
            let phone = normalize_phone(&raw_phone);

            // The concurrency slot is reserved here, in the scheduler and
            // before the phone reservation, so two workers can never
            // overshoot the limit together and the registry never grows
            // past active_calls.
            self.active_calls.fetch_add(1, Ordering::SeqCst);
            let reservation = format!("pending-{}", uuid::Uuid::new_v4());
            if self.registry.try_reserve(&phone, &reservation).is_err() {
                // Another call owns this phone; try again later
                self.active_calls.fetch_sub(1, Ordering::SeqCst);
                self.queue.lock().push_back(item);
                tokio::time::sleep(BUSY_REQUEUE_DELAY).await;
                continue;
            }
            metrics::gauge!("outdial_active_calls").set(self.active_calls() as f64);

            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_worker(item, phone).await;
            });

            let delay = self.config.read().delay_between_calls;
            tokio::time::sleep(delay).await;
        }
        tracing::debug!("Scheduler exited");
    }

    async fn wait_for_wake(&self) {
        let _ = tokio::time::timeout(SCHEDULER_IDLE_WAIT, self.wake.notified()).await;
    }

    async fn run_worker(self: Arc<Self>, item: CallItem, phone: String) {
        let attempts = item.attempts;
        let result = self.run_attempt(item, &phone).await;

        // Requeue before the slot is released so the drain check never
        // observes an empty queue with the retry still in hand.
        if let AttemptResult::Requeue(lead) = result {
            self.queue.lock().push_back(CallItem {
                lead,
                attempts: attempts + 1,
            });
        }

        self.registry.release(&phone);
        self.active_calls.fetch_sub(1, Ordering::SeqCst);
        metrics::gauge!("outdial_active_calls").set(self.active_calls() as f64);
        self.wake.notify_one();
    }

    async fn run_attempt(&self, item: CallItem, phone: &str) -> AttemptResult {
        let lead = item.lead;

        let did = match self.did_pool.select(phone) {
            Ok((did, matched)) => {
                tracing::debug!(lead_id = %lead.id, did = %did.number, matched = %matched, "Selected DID");
                did
            }
            Err(e) => {
                tracing::error!(lead_id = %lead.id, "DID selection failed: {}", e);
                self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                return AttemptResult::Done;
            }
        };

        match self.driver.originate(&lead, &did).await {
            Ok(originated) => {
                self.stats.total_calls.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("outdial_calls_initiated_total").increment(1);
                self.registry.associate(phone, &originated.call_id);

                let timeout = self.config.read().call_timeout;
                match tokio::time::timeout(timeout, originated.completion).await {
                    Ok(Ok(reason)) => {
                        tracing::info!(call_id = %originated.call_id, reason = reason.as_str(), "Call finished");
                        self.stats.record_terminal(reason);
                    }
                    Ok(Err(_)) => {
                        // Context dropped without signalling; count as completed
                        tracing::warn!(call_id = %originated.call_id, "Completion channel closed without a reason");
                        self.stats.record_terminal(TerminalReason::Completed);
                    }
                    Err(_) => {
                        // Slot is released but the call is NOT cancelled; it
                        // may still finalize via a late webhook
                        tracing::warn!(call_id = %originated.call_id, "Completion wait timed out");
                        self.stats.record_terminal(TerminalReason::Timeout);
                    }
                }
                AttemptResult::Done
            }
            Err(CarrierError::ChannelLimit) => {
                // Skip retry entirely; the lead's DB status stays untouched
                tracing::warn!(lead_id = %lead.id, "Origination refused: channel limit");
                self.stats
                    .channel_limit_rejections
                    .fetch_add(1, Ordering::Relaxed);
                self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("outdial_channel_limit_total").increment(1);
                AttemptResult::Done
            }
            Err(e) if !e.is_retryable() => {
                tracing::warn!(lead_id = %lead.id, "Origination refused, not retrying: {}", e);
                self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("outdial_originations_failed_total").increment(1);
                AttemptResult::Done
            }
            Err(e) => {
                let max_attempts = self.config.read().max_origination_attempts;
                if item.attempts + 1 < max_attempts {
                    tracing::warn!(
                        lead_id = %lead.id,
                        attempt = item.attempts + 1,
                        "Origination failed, re-queueing: {}",
                        e
                    );
                    AttemptResult::Requeue(lead)
                } else {
                    tracing::error!(lead_id = %lead.id, "Origination failed after {} attempts: {}", max_attempts, e);
                    self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("outdial_originations_failed_total").increment(1);
                    AttemptResult::Done
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use uuid::Uuid;

    fn lead(phone: &str) -> Lead {
        Lead {
            id: Uuid::new_v4(),
            first_name: "Test".to_string(),
            last_name: "Lead".to_string(),
            phone: Some(phone.to_string()),
            email: None,
            address: None,
            status: Default::default(),
            answer_type: None,
            call_attempts: 0,
            last_call_at: None,
            from_number: None,
        }
    }

    fn pool() -> Arc<DidPool> {
        Arc::new(DidPool::new(&["+15302220001".to_string()]))
    }

    /// Driver that answers every call after a short delay and tracks peak
    /// concurrency.
    struct TrackingDriver {
        current: Arc<AtomicI64>,
        peak: Arc<AtomicI64>,
        call_seq: AtomicU64,
        hold: Duration,
    }

    impl TrackingDriver {
        fn new(hold: Duration) -> Arc<Self> {
            Arc::new(Self {
                current: Arc::new(AtomicI64::new(0)),
                peak: Arc::new(AtomicI64::new(0)),
                call_seq: AtomicU64::new(0),
                hold,
            })
        }

        fn peak(&self) -> i64 {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CallDriver for TrackingDriver {
        async fn originate(&self, _lead: &Lead, _did: &Did) -> Result<OriginatedCall, CarrierError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let call_id = format!("cc-{}", self.call_seq.fetch_add(1, Ordering::SeqCst));
            let (tx, rx) = oneshot::channel();
            let hold = self.hold;
            let current = Arc::clone(&self.current);
            tokio::spawn(async move {
                tokio::time::sleep(hold).await;
                current.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(TerminalReason::Completed);
            });
            Ok(OriginatedCall {
                call_id,
                completion: rx,
            })
        }
    }

    /// Driver that always fails with a fixed error
    struct FailingDriver {
        error: fn() -> CarrierError,
        attempts: AtomicU64,
    }

    #[async_trait]
    impl CallDriver for FailingDriver {
        async fn originate(&self, _lead: &Lead, _did: &Did) -> Result<OriginatedCall, CarrierError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    async fn wait_until_stopped(dispatcher: &Arc<Dispatcher>) {
        for _ in 0..2000 {
            if dispatcher.state() == AgentState::Stopped && dispatcher.active_calls() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dispatcher did not stop");
    }

    fn test_config(max: usize) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrent_calls: max,
            delay_between_calls: Duration::from_millis(10),
            max_origination_attempts: 3,
            call_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_respected() {
        let driver = TrackingDriver::new(Duration::from_millis(200));
        let dispatcher = Dispatcher::new(
            test_config(2),
            pool(),
            Arc::new(ActivePhoneRegistry::new()),
            driver.clone(),
        );

        let leads: Vec<Lead> = (0..6)
            .map(|i| lead(&format!("+1530555{:04}", i)))
            .collect();
        dispatcher.start(leads);
        wait_until_stopped(&dispatcher).await;

        assert!(driver.peak() <= 2, "peak concurrency was {}", driver.peak());
        assert_eq!(dispatcher.stats().snapshot().total_calls, 6);
        assert_eq!(dispatcher.stats().snapshot().completed, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_when_limit_is_one() {
        let driver = TrackingDriver::new(Duration::from_millis(100));
        let dispatcher = Dispatcher::new(
            test_config(1),
            pool(),
            Arc::new(ActivePhoneRegistry::new()),
            driver.clone(),
        );

        dispatcher.start(vec![lead("+15305550001"), lead("+15305550002"), lead("+15305550003")]);
        wait_until_stopped(&dispatcher).await;

        assert_eq!(driver.peak(), 1);
        assert_eq!(dispatcher.stats().snapshot().completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_limit_skips_retry() {
        let driver = Arc::new(FailingDriver {
            error: || CarrierError::ChannelLimit,
            attempts: AtomicU64::new(0),
        });
        let dispatcher = Dispatcher::new(
            test_config(2),
            pool(),
            Arc::new(ActivePhoneRegistry::new()),
            driver.clone(),
        );

        dispatcher.start(vec![lead("+15305550001")]);
        wait_until_stopped(&dispatcher).await;

        // Exactly one attempt: channel-limit rejections are never re-queued
        assert_eq!(driver.attempts.load(Ordering::SeqCst), 1);
        let stats = dispatcher.stats().snapshot();
        assert_eq!(stats.channel_limit_rejections, 1);
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.total_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_retries_to_exhaustion() {
        let driver = Arc::new(FailingDriver {
            error: || CarrierError::Rejected {
                code: "500".to_string(),
                detail: "flaky".to_string(),
            },
            attempts: AtomicU64::new(0),
        });
        let dispatcher = Dispatcher::new(
            test_config(2),
            pool(),
            Arc::new(ActivePhoneRegistry::new()),
            driver.clone(),
        );

        dispatcher.start(vec![lead("+15305550001")]);
        wait_until_stopped(&dispatcher).await;

        assert_eq!(driver.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.stats().snapshot().failed_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_numbers_auto_stop() {
        let driver = Arc::new(FailingDriver {
            error: || CarrierError::InvalidNumber("bogus".to_string()),
            attempts: AtomicU64::new(0),
        });
        let dispatcher = Dispatcher::new(
            test_config(3),
            pool(),
            Arc::new(ActivePhoneRegistry::new()),
            driver.clone(),
        );

        dispatcher.start(vec![
            lead("+15305550001"),
            lead("+15305550002"),
            lead("+15305550003"),
        ]);
        wait_until_stopped(&dispatcher).await;

        // One attempt each, no retries, agent stopped on its own
        assert_eq!(driver.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.state(), AgentState::Stopped);
        assert_eq!(dispatcher.stats().snapshot().failed_calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_queue() {
        let driver = TrackingDriver::new(Duration::from_millis(50));
        let dispatcher = Dispatcher::new(
            test_config(1),
            pool(),
            Arc::new(ActivePhoneRegistry::new()),
            driver.clone(),
        );

        dispatcher.start(vec![lead("+15305550001"), lead("+15305550002")]);
        dispatcher.pause();
        assert_eq!(dispatcher.state(), AgentState::Paused);

        tokio::time::sleep(Duration::from_millis(500)).await;
        // Nothing new was dispatched while paused (at most the first call
        // that slipped in before pause)
        assert!(dispatcher.queue_len() >= 1);

        dispatcher.resume();
        wait_until_stopped(&dispatcher).await;
        assert_eq!(dispatcher.stats().snapshot().completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_queue() {
        let driver = TrackingDriver::new(Duration::from_millis(50));
        let dispatcher = Dispatcher::new(
            test_config(1),
            pool(),
            Arc::new(ActivePhoneRegistry::new()),
            driver.clone(),
        );

        dispatcher.start((0..20).map(|i| lead(&format!("+1530555{:04}", i))).collect());
        tokio::time::sleep(Duration::from_millis(30)).await;
        dispatcher.stop();

        assert_eq!(dispatcher.queue_len(), 0);
        wait_until_stopped(&dispatcher).await;
        // Far fewer than 20 calls were made
        assert!(dispatcher.stats().snapshot().total_calls < 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_never_exceeds_active_calls() {
        let registry = Arc::new(ActivePhoneRegistry::new());
        let driver = TrackingDriver::new(Duration::from_millis(100));
        let dispatcher = Dispatcher::new(test_config(3), pool(), registry.clone(), driver);

        dispatcher.start((0..9).map(|i| lead(&format!("+1530555{:04}", i))).collect());

        for _ in 0..200 {
            assert!(
                registry.len() <= dispatcher.active_calls(),
                "registry {} > active {}",
                registry.len(),
                dispatcher.active_calls()
            );
            if dispatcher.state() == AgentState::Stopped && dispatcher.active_calls() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        wait_until_stopped(&dispatcher).await;
        assert!(registry.is_empty());
    }
}
