//! Dispatch loop and outcome routing.
//!
//! All mutable sync state lives in [`Core`] behind one `parking_lot` mutex.
//! Claiming an operation, recording its outcome, arming timers and every
//! admin action happen under that lock, so breaker and budget decisions
//! never race. The lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use super::budget::RetryBudget;
use super::circuit_breaker::{Admission, BreakerTransition, CircuitBreaker, CircuitState};
use super::classifier::{classify, ErrorCategory};
use super::dead_letter::{DeadLetterStore, FinalError};
use super::error::Result;
use super::executor::{RawError, RemoteExecutor};
use super::metrics::{MetricsAggregator, SyncEvent, SyncObserver};
use super::operation::{OperationStatus, SyncOperation};
use super::queue::OperationQueue;
use super::scheduler::{DeadReason, RetryDecision, RetryScheduler};
use crate::common::{Clock, JitterSource};

pub(super) struct Core {
    pub(super) queue: OperationQueue,
    pub(super) dead_letters: DeadLetterStore,
    pub(super) breaker: CircuitBreaker,
    pub(super) budget: RetryBudget,
    pub(super) metrics: MetricsAggregator,
    pub(super) retry_timers: HashMap<String, AbortHandle>,
    pub(super) in_flight: HashMap<String, InFlight>,
    pub(super) breaker_timer: Option<AbortHandle>,
    pub(super) shutting_down: bool,
}

pub(super) struct InFlight {
    pub(super) handle: AbortHandle,
    pub(super) trial: bool,
}

impl Core {
    /// Fold `event` into the counters and queue it for observers.
    pub(super) fn note(&mut self, events: &mut Vec<SyncEvent>, event: SyncEvent) {
        self.metrics.record(&event);
        events.push(event);
    }

    /// Log and publish a breaker transition. `from` is the state read
    /// before the call that produced `transition`.
    pub(super) fn note_breaker(
        &mut self,
        events: &mut Vec<SyncEvent>,
        from: CircuitState,
        transition: Option<BreakerTransition>,
    ) {
        let Some(transition) = transition else {
            return;
        };
        match transition {
            BreakerTransition::Tripped if from == CircuitState::HalfOpen => {
                log::warn!("Circuit breaker trial failed, OPEN again")
            }
            BreakerTransition::Tripped => log::warn!(
                "Circuit breaker OPEN after {} consecutive failures",
                self.breaker.snapshot().consecutive_failures
            ),
            BreakerTransition::HalfOpened => {
                log::info!("Circuit breaker HALF_OPEN, admitting one trial")
            }
            BreakerTransition::Closed => log::info!("Circuit breaker CLOSED"),
        }
        let to = self.breaker.state();
        self.note(events, SyncEvent::CircuitStateChanged { from, to });
    }

    pub(super) fn cancel_retry_timers(&mut self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.retry_timers.len());
        for (id, handle) in self.retry_timers.drain() {
            handle.abort();
            ids.push(id);
        }
        ids
    }

    pub(super) fn cancel_breaker_timer(&mut self) {
        if let Some(handle) = self.breaker_timer.take() {
            handle.abort();
        }
    }

    /// Move `op` out of the queue into the dead-letter store. The entry is
    /// written before the queue row is deleted, so a crash in between
    /// leaves a duplicate that startup recovery drops, never a lost op.
    pub(super) fn dead_letter(
        &mut self,
        events: &mut Vec<SyncEvent>,
        op: &SyncOperation,
        category: Option<ErrorCategory>,
        message: String,
        reason: DeadReason,
        now_ms: u64,
    ) -> Result<()> {
        let mut dead = op.clone();
        dead.status = OperationStatus::Dead;
        dead.next_attempt_at = None;
        dead.updated_at = now_ms;

        self.dead_letters.add(
            dead,
            FinalError {
                category,
                message,
                reason,
            },
            now_ms,
        )?;
        self.queue.remove_dead(&op.id, now_ms)?;

        log::warn!(
            "Operation {} ({} {}/{}) dead-lettered: {reason}",
            op.id,
            op.op_type,
            op.table,
            op.record_id
        );
        if let Some(entry) = op.origin.as_deref() {
            log::debug!("Dead letter {entry} re-driven by {} failed again", op.id);
        }

        self.note(
            events,
            SyncEvent::DeadLettered {
                op_id: op.id.clone(),
                attempt: op.attempt,
                reason,
            },
        );
        Ok(())
    }
}

/// State shared between the engine handle, the dispatch loop and every
/// spawned dispatch or timer task.
pub(super) struct Shared {
    pub(super) core: Mutex<Core>,
    pub(super) executor: Arc<dyn RemoteExecutor>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) jitter: Arc<dyn JitterSource>,
    pub(super) scheduler: RetryScheduler,
    pub(super) observers: Vec<Arc<dyn SyncObserver>>,
    pub(super) notify: Notify,
    pub(super) permits: Arc<Semaphore>,
    pub(super) request_timeout: Duration,
}

impl Shared {
    /// Deliver events to observers. Must be called without the core lock.
    pub(super) fn emit(&self, events: Vec<SyncEvent>) {
        for event in &events {
            for observer in &self.observers {
                observer.on_event(event);
            }
        }
    }

    pub(super) fn wake(&self) {
        self.notify.notify_one();
    }

    /// Arm a deferred re-dispatch of `op_id` after `delay_ms`.
    pub(super) fn arm_retry_timer(self: &Arc<Self>, core: &mut Core, op_id: &str, delay_ms: u64) {
        let shared = Arc::clone(self);
        let id = op_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            shared.retry_due(&id);
        });
        if let Some(previous) = core.retry_timers.insert(op_id.to_string(), task.abort_handle()) {
            previous.abort();
        }
    }

    fn retry_due(&self, op_id: &str) {
        let ready = {
            let mut core = self.core.lock();
            core.retry_timers.remove(op_id);
            if core.shutting_down {
                return;
            }
            let now = self.clock.now_ms();
            match core.queue.make_ready(op_id, now) {
                Ok(ready) => ready,
                Err(e) => {
                    log::error!("Failed to re-queue operation {op_id} for retry: {e}");
                    false
                }
            }
        };
        if ready {
            log::debug!("Retry due for operation {op_id}");
            self.wake();
        }
    }

    /// Wake the loop once an OPEN breaker's cooldown has elapsed.
    fn arm_breaker_timer(self: &Arc<Self>, core: &mut Core, delay_ms: u64) {
        if core
            .breaker_timer
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
        {
            return;
        }
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            shared.wake();
        });
        core.breaker_timer = Some(task.abort_handle());
    }

    /// Claim the next eligible operation and spawn its dispatch. Returns
    /// false, dropping the permit, when nothing can be dispatched now.
    fn claim_next(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> bool {
        let mut events = Vec::new();
        let dispatched = {
            let mut core = self.core.lock();
            self.claim_locked(&mut core, &mut events, permit)
        };
        self.emit(events);
        dispatched
    }

    fn claim_locked(
        self: &Arc<Self>,
        core: &mut Core,
        events: &mut Vec<SyncEvent>,
        permit: OwnedSemaphorePermit,
    ) -> bool {
        if core.shutting_down {
            return false;
        }
        let now = self.clock.now_ms();
        let candidate = match core.queue.dequeue_next(now) {
            Some(op) => op,
            None => return false,
        };

        let before = core.breaker.state();
        let (admission, transition) = core.breaker.try_acquire(now);
        core.note_breaker(events, before, transition);

        let trial = match admission {
            Admission::Allowed => false,
            Admission::Trial => true,
            Admission::Rejected { retry_in_ms } => {
                if retry_in_ms > 0 {
                    self.arm_breaker_timer(core, retry_in_ms);
                }
                return false;
            }
        };

        let op = match core.queue.mark_syncing(&candidate.id, now) {
            Ok(op) => op,
            Err(e) => {
                log::error!("Failed to mark operation {} syncing: {e}", candidate.id);
                core.breaker.release(trial);
                return false;
            }
        };

        core.note(
            events,
            SyncEvent::Dispatched {
                op_id: op.id.clone(),
                attempt: op.attempt,
            },
        );

        let shared = Arc::clone(self);
        let op_id = op.id.clone();
        let span = tracing::debug_span!(
            "dispatch",
            op_id = %op.id,
            record_id = %op.record_id,
            attempt = op.attempt
        );
        let task = tokio::spawn(
            async move {
                let _permit = permit;
                let result = shared.execute_guarded(&op).await;
                shared.complete(&op, result);
                shared.wake();
            }
            .instrument(span),
        );
        core.in_flight.insert(
            op_id,
            InFlight {
                handle: task.abort_handle(),
                trial,
            },
        );
        true
    }

    /// Run the remote call on its own task under the request timeout. A
    /// panicking executor surfaces as an ordinary failed attempt.
    async fn execute_guarded(&self, op: &SyncOperation) -> std::result::Result<(), RawError> {
        let executor = Arc::clone(&self.executor);
        let owned = op.clone();
        let call = tokio::spawn(
            async move { executor.execute(&owned).await }.instrument(tracing::Span::current()),
        );
        // Aborting the dispatch task must not leave the remote call running.
        let _abort = AbortOnDrop(call.abort_handle());

        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => {
                log::error!("Remote executor panicked on operation {}", op.id);
                Err(RawError::Other("remote executor panicked".to_string()))
            }
            Ok(Err(e)) => Err(RawError::Other(format!("remote call cancelled: {e}"))),
            Err(_) => Err(RawError::Timeout),
        }
    }

    /// Route the outcome of one dispatch.
    fn complete(self: &Arc<Self>, op: &SyncOperation, result: std::result::Result<(), RawError>) {
        let mut events = Vec::new();
        {
            let mut core = self.core.lock();
            // Shutdown already settled the breaker for anything it drained.
            let Some(flight) = core.in_flight.remove(&op.id) else {
                return;
            };

            let still_syncing = core
                .queue
                .get(&op.id)
                .map_or(false, |current| current.status == OperationStatus::Syncing);
            if !still_syncing {
                core.breaker.release(flight.trial);
                return;
            }

            let now = self.clock.now_ms();
            let routed = match result {
                Ok(()) => self.on_success(&mut core, &mut events, op, flight.trial, now),
                Err(raw) => self.on_failure(&mut core, &mut events, op, raw, flight.trial, now),
            };
            if let Err(e) = routed {
                log::error!("Failed to record outcome of operation {}: {e}", op.id);
            }
        }
        self.emit(events);
    }

    fn on_success(
        &self,
        core: &mut Core,
        events: &mut Vec<SyncEvent>,
        op: &SyncOperation,
        trial: bool,
        now: u64,
    ) -> Result<()> {
        let done = match core.queue.mark_success(&op.id, now) {
            Ok(done) => done,
            Err(e) => {
                core.breaker.release(trial);
                return Err(e);
            }
        };

        let before = core.breaker.state();
        let transition = core.breaker.record_success(now, trial);
        core.note_breaker(events, before, transition);

        core.note(
            events,
            SyncEvent::Succeeded {
                op_id: done.id.clone(),
                attempt: done.attempt,
                at: now,
            },
        );

        if let Some(entry) = done.origin.as_deref() {
            if core.dead_letters.remove(entry)?.is_some() {
                log::info!("Dead letter {entry} resolved by operation {}", done.id);
                core.note(
                    events,
                    SyncEvent::DeadLetterResolved {
                        dead_letter_id: entry.to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    fn on_failure(
        self: &Arc<Self>,
        core: &mut Core,
        events: &mut Vec<SyncEvent>,
        op: &SyncOperation,
        raw: RawError,
        trial: bool,
        now: u64,
    ) -> Result<()> {
        let category = classify(&raw);
        let message = raw.to_string();
        let failed = match core.queue.mark_failed(&op.id, category, message.clone(), now) {
            Ok(failed) => failed,
            Err(e) => {
                core.breaker.release(trial);
                return Err(e);
            }
        };

        core.note(
            events,
            SyncEvent::AttemptFailed {
                op_id: failed.id.clone(),
                attempt: failed.attempt,
                category,
                message: message.clone(),
                at: now,
            },
        );

        let before = core.breaker.state();
        let transition = if category.counts_against_breaker() {
            core.breaker.record_failure(now, trial)
        } else {
            core.breaker.record_success(now, trial)
        };
        core.note_breaker(events, before, transition);

        let decision = self
            .scheduler
            .schedule(&failed, category, &mut core.budget, self.jitter.as_ref(), now);

        match decision {
            RetryDecision::Retry { delay_ms } => {
                core.queue.schedule_retry(&failed.id, delay_ms, now)?;
                log::debug!(
                    "Operation {} attempt {} failed ({category}); retrying in {delay_ms}ms",
                    failed.id,
                    failed.attempt
                );
                self.arm_retry_timer(core, &failed.id, delay_ms);
                core.note(
                    events,
                    SyncEvent::RetryScheduled {
                        op_id: failed.id.clone(),
                        attempt: failed.attempt,
                        delay_ms,
                    },
                );
            }
            RetryDecision::DeadLetter(reason) => {
                if reason == DeadReason::BudgetExhausted {
                    log::warn!(
                        "Retry budget exhausted ({} per {}ms); dead-lettering {}",
                        core.budget.limit(),
                        core.budget.snapshot(now).window_ms,
                        failed.id
                    );
                    core.note(
                        events,
                        SyncEvent::BudgetExhausted {
                            op_id: failed.id.clone(),
                        },
                    );
                }
                core.dead_letter(events, &failed, Some(category), message, reason, now)?;
            }
        }
        Ok(())
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The single logical dispatcher: fills free worker slots with eligible
/// operations and sleeps on the notifier when there is nothing to do.
pub(super) async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    log::info!(
        "Sync dispatcher started with {} workers",
        shared.permits.available_permits()
    );
    loop {
        if *shutdown.borrow() {
            break;
        }
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = Arc::clone(&shared.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        if !shared.claim_next(permit) {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = shared.notify.notified() => {}
            }
        }
    }
    log::info!("Sync dispatcher stopped");
}

/// Periodically drop `success` rows older than `retention_ms`.
pub(super) async fn sweep_completed(
    shared: Arc<Shared>,
    retention_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_millis(retention_ms.clamp(1, 60_000));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let Some(cutoff) = shared.clock.now_ms().checked_sub(retention_ms) else {
            continue;
        };
        let purged = shared.core.lock().queue.purge_completed_before(cutoff);
        match purged {
            Ok(0) => {}
            Ok(n) => log::debug!("Purged {n} completed operations older than {retention_ms}ms"),
            Err(e) => log::error!("Failed to purge completed operations: {e}"),
        }
    }
}
