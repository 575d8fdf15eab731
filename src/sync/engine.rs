use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;

use super::budget::RetryBudget;
use super::circuit_breaker::{BreakerTransition, CircuitBreaker, CircuitState};
use super::dead_letter::{DeadLetter, DeadLetterStore};
use super::dispatcher::{self, Core, InFlight, Shared};
use super::error::{Result, SyncError};
use super::executor::RemoteExecutor;
use super::health::{CircuitBreakerHealth, DeadLetterHealth, HealthReport};
use super::metrics::{ErrorRecoveryMetrics, MetricsAggregator, SyncEvent, SyncObserver};
use super::operation::{NewOperation, SyncOperation};
use super::queue::{OperationQueue, QueueStats};
use super::scheduler::RetryScheduler;
use crate::common::{Clock, JitterSource, RandomJitter, SystemClock};
use crate::config::SyncConfig;
use crate::storage::{KvStore, MemoryStore};

/// Builds a [`SyncEngine`] from its injected collaborators.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    store: Option<Arc<dyn KvStore>>,
    executor: Option<Arc<dyn RemoteExecutor>>,
    clock: Option<Arc<dyn Clock>>,
    jitter: Option<Arc<dyn JitterSource>>,
    observers: Vec<Arc<dyn SyncObserver>>,
}

impl SyncEngineBuilder {
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn RemoteExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Load persisted state and assemble the engine. Nothing is dispatched
    /// until [`SyncEngine::start`] is called.
    pub fn build(self) -> Result<SyncEngine> {
        let executor = self
            .executor
            .ok_or_else(|| SyncError::Validation("a remote executor is required".to_string()))?;
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let clock = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock::new()),
        };
        let jitter = match self.jitter {
            Some(jitter) => jitter,
            None => Arc::new(RandomJitter::new()),
        };

        let now = clock.now_ms();
        let mut queue = OperationQueue::open(Arc::clone(&store), self.config.max_queue_len)?;
        let dead_letters = DeadLetterStore::open(store)?;

        // Finish dead-letter moves interrupted by a crash.
        let dead_ids: HashSet<String> = dead_letters
            .list()
            .into_iter()
            .map(|letter| letter.operation.id)
            .collect();
        for op in queue.list() {
            if dead_ids.contains(&op.id) {
                log::info!("Dropping operation {} already held as a dead letter", op.id);
                queue.remove_dead(&op.id, now)?;
            }
        }

        let core = Core {
            queue,
            dead_letters,
            breaker: CircuitBreaker::new(self.config.breaker.clone(), now),
            budget: RetryBudget::new(&self.config.budget, now),
            metrics: MetricsAggregator::new(),
            retry_timers: HashMap::new(),
            in_flight: HashMap::new(),
            breaker_timer: None,
            shutting_down: false,
        };

        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            executor,
            clock,
            jitter,
            scheduler: RetryScheduler::new(self.config.retry.clone()),
            observers: self.observers,
            notify: Notify::new(),
            permits: Arc::new(Semaphore::new(self.config.max_concurrency.max(1))),
            request_timeout: Duration::from_millis(self.config.request_timeout_ms),
        });

        let (shutdown_tx, _) = watch::channel(false);
        Ok(SyncEngine {
            shared,
            shutdown_tx,
            completed_retention_ms: self.config.completed_retention_ms,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// The sync service: operation queue, dispatcher, recovery machinery and
/// the admin surface over them.
pub struct SyncEngine {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    completed_retention_ms: u64,
    /// Dispatch loop and, when retention is on, the completed-row sweeper.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            store: None,
            executor: None,
            clock: None,
            jitter: None,
            observers: Vec::new(),
        }
    }

    /// Spawn the dispatch loop and re-arm retry timers persisted by a
    /// previous run. Also valid after [`shutdown`](Self::shutdown) on the
    /// same engine. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        {
            let mut core = self.shared.core.lock();
            core.shutting_down = false;
            let now = self.shared.clock.now_ms();
            let waiting = core.queue.awaiting_retry();
            if !waiting.is_empty() {
                log::info!("Re-arming {} retry timers", waiting.len());
            }
            for (id, due_at) in waiting {
                self.shared
                    .arm_retry_timer(&mut core, &id, due_at.saturating_sub(now));
            }
        }

        self.shutdown_tx.send_replace(false);
        tasks.push(tokio::spawn(dispatcher::run(
            Arc::clone(&self.shared),
            self.shutdown_tx.subscribe(),
        )));
        if self.completed_retention_ms > 0 {
            tasks.push(tokio::spawn(dispatcher::sweep_completed(
                Arc::clone(&self.shared),
                self.completed_retention_ms,
                self.shutdown_tx.subscribe(),
            )));
        }
        self.shared.wake();
    }

    /// Stop dispatching. Cancels retry timers and in-flight dispatches and
    /// puts interrupted operations back to `pending`. Enqueue is refused
    /// until the next [`start`](Self::start), which resumes from there.
    pub async fn shutdown(&self) {
        {
            let mut core = self.shared.core.lock();
            core.shutting_down = true;
            core.cancel_retry_timers();
            core.cancel_breaker_timer();
            let drained: Vec<InFlight> = core.in_flight.drain().map(|(_, f)| f).collect();
            for flight in drained {
                flight.handle.abort();
                core.breaker.release(flight.trial);
            }
            match core.queue.revert_in_flight() {
                Ok(ids) if !ids.is_empty() => {
                    log::info!("Returned {} in-flight operations to pending", ids.len())
                }
                Ok(_) => {}
                Err(e) => log::error!("Failed to revert in-flight operations: {e}"),
            }
        }

        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for handle in tasks {
            if let Err(e) = handle.await {
                log::error!("Sync background task failed: {e}");
            }
        }
    }

    /// Durably append a new operation. Never waits on the network.
    pub fn enqueue(&self, new: NewOperation) -> Result<SyncOperation> {
        let mut events = Vec::new();
        let op = {
            let mut core = self.shared.core.lock();
            if core.shutting_down {
                return Err(SyncError::ShuttingDown);
            }
            let op = core.queue.enqueue(new, self.shared.clock.now_ms())?;
            core.note(
                &mut events,
                SyncEvent::Enqueued {
                    op_id: op.id.clone(),
                    record_id: op.record_id.clone(),
                },
            );
            op
        };
        self.shared.emit(events);
        self.shared.wake();
        Ok(op)
    }

    pub fn get_operation(&self, id: &str) -> Option<SyncOperation> {
        self.shared.core.lock().queue.get(id).cloned()
    }

    pub fn get_stats(&self) -> QueueStats {
        self.shared.core.lock().queue.stats()
    }

    pub fn metrics(&self) -> ErrorRecoveryMetrics {
        self.shared.core.lock().metrics.metrics().clone()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.shared.core.lock().breaker.state()
    }

    /// Consistent snapshot of every component. Mutates nothing.
    pub fn get_health(&self) -> HealthReport {
        let core = self.shared.core.lock();
        let now = self.shared.clock.now_ms();

        let items = core.dead_letters.list();
        let mut sync = core.metrics.status().clone();
        sync.in_flight = core.in_flight.len();

        HealthReport {
            circuit_breaker: CircuitBreakerHealth {
                state: core.breaker.snapshot(),
                is_healthy: core.breaker.is_healthy(),
                cooldown_remaining_ms: core.breaker.remaining_cooldown(now),
            },
            retry_budget: core.budget.snapshot(now),
            dead_letters: DeadLetterHealth {
                count: items.len(),
                items,
            },
            queue: core.queue.stats(),
            metrics: core.metrics.metrics().clone(),
            sync,
            generated_at: now,
        }
    }

    /// Force the breaker CLOSED. A no-op on an already healthy breaker.
    pub fn reset_circuit_breaker(&self) {
        let mut events = Vec::new();
        {
            let mut core = self.shared.core.lock();
            let now = self.shared.clock.now_ms();
            let before = core.breaker.state();
            if core.breaker.reset(now) {
                core.cancel_breaker_timer();
                log::info!("Circuit breaker manually reset");
                core.note_breaker(&mut events, before, closed_from(before));
                core.note(&mut events, SyncEvent::CircuitReset);
            }
        }
        self.shared.emit(events);
        self.shared.wake();
    }

    /// Reset breaker, retry budget and metrics. Operations waiting on a
    /// retry timer become due immediately.
    pub fn reset_error_recovery(&self) -> Result<()> {
        let mut events = Vec::new();
        let outcome = {
            let mut core = self.shared.core.lock();
            let now = self.shared.clock.now_ms();

            let before = core.breaker.state();
            core.breaker.reset(now);
            core.cancel_breaker_timer();
            core.note_breaker(&mut events, before, closed_from(before));
            core.budget.reset(now);

            let mut outcome = Ok(());
            for id in core.cancel_retry_timers() {
                if let Err(e) = core.queue.make_ready(&id, now) {
                    log::error!("Failed to release operation {id} after reset: {e}");
                    outcome = Err(e);
                }
            }
            core.note(&mut events, SyncEvent::ErrorRecoveryReset);
            log::info!("Error recovery state reset");
            outcome
        };
        self.shared.emit(events);
        self.shared.wake();
        outcome
    }

    pub fn get_dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.core.lock().dead_letters.list()
    }

    /// Re-drive a dead letter as a fresh operation carrying its history.
    /// The entry stays until that operation succeeds. Returns false if no
    /// entry exists or a re-drive is already queued.
    pub fn retry_dead_letter(&self, id: &str) -> Result<bool> {
        let mut events = Vec::new();
        let retried = {
            let mut core = self.shared.core.lock();
            if core.shutting_down {
                return Err(SyncError::ShuttingDown);
            }
            let letter = match core.dead_letters.get(id) {
                Some(letter) => letter.clone(),
                None => return Ok(false),
            };
            if let Some(op_id) = letter.retrying.as_deref() {
                if core.queue.get(op_id).map_or(false, |op| !op.is_terminal()) {
                    return Ok(false);
                }
            }

            let source = &letter.operation;
            let new = NewOperation {
                table: source.table.clone(),
                record_id: source.record_id.clone(),
                op_type: Some(source.op_type),
                payload: source.payload.clone(),
            };
            let now = self.shared.clock.now_ms();
            let op = core.queue.enqueue_with(
                new,
                Some(id.to_string()),
                letter.attempt_history.clone(),
                now,
            )?;
            core.dead_letters.mark_retrying(id, &op.id)?;

            log::info!("Dead letter {id} re-queued as operation {}", op.id);
            core.note(
                &mut events,
                SyncEvent::Enqueued {
                    op_id: op.id.clone(),
                    record_id: op.record_id.clone(),
                },
            );
            core.note(
                &mut events,
                SyncEvent::DeadLetterRetried {
                    dead_letter_id: id.to_string(),
                    op_id: op.id,
                },
            );
            true
        };
        self.shared.emit(events);
        self.shared.wake();
        Ok(retried)
    }

    /// Drop every dead letter. Returns how many were removed.
    pub fn clear_dead_letters(&self) -> Result<usize> {
        let mut events = Vec::new();
        let count = {
            let mut core = self.shared.core.lock();
            let count = core.dead_letters.clear()?;
            log::info!("Cleared {count} dead letters");
            core.note(&mut events, SyncEvent::DeadLettersCleared { count });
            count
        };
        self.shared.emit(events);
        Ok(count)
    }

    /// Delete queued operations whose record is not in `valid_record_ids`.
    /// In-flight operations are left to finish.
    pub fn remove_orphaned_operations(&self, valid_record_ids: &HashSet<String>) -> Result<usize> {
        let mut events = Vec::new();
        let count = {
            let mut core = self.shared.core.lock();
            let removed = core.queue.remove_orphaned(valid_record_ids)?;
            for op in &removed {
                if let Some(timer) = core.retry_timers.remove(&op.id) {
                    timer.abort();
                }
            }
            if !removed.is_empty() {
                log::info!("Removed {} orphaned operations", removed.len());
            }
            core.note(
                &mut events,
                SyncEvent::OrphansRemoved {
                    count: removed.len(),
                },
            );
            removed.len()
        };
        self.shared.emit(events);
        self.shared.wake();
        Ok(count)
    }

    /// Delete operations that reached `success`.
    pub fn purge_completed(&self) -> Result<usize> {
        let purged = self.shared.core.lock().queue.purge_completed()?;
        if purged > 0 {
            log::debug!("Purged {purged} completed operations");
        }
        Ok(purged)
    }
}

fn closed_from(before: CircuitState) -> Option<BreakerTransition> {
    (before != CircuitState::Closed).then_some(BreakerTransition::Closed)
}
