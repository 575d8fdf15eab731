//! Sync events, the observer seam, and the counters derived from them.

use std::collections::BTreeMap;

use serde::Serialize;

use super::circuit_breaker::CircuitState;
use super::classifier::ErrorCategory;
use super::scheduler::DeadReason;

/// Everything observable that happens to an operation or to the recovery
/// machinery. Emitted in the order the transitions happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Enqueued {
        op_id: String,
        record_id: String,
    },
    Dispatched {
        op_id: String,
        attempt: u32,
    },
    Succeeded {
        op_id: String,
        attempt: u32,
        at: u64,
    },
    AttemptFailed {
        op_id: String,
        attempt: u32,
        category: ErrorCategory,
        message: String,
        at: u64,
    },
    RetryScheduled {
        op_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    BudgetExhausted {
        op_id: String,
    },
    DeadLettered {
        op_id: String,
        attempt: u32,
        reason: DeadReason,
    },
    DeadLetterRetried {
        dead_letter_id: String,
        op_id: String,
    },
    DeadLetterResolved {
        dead_letter_id: String,
    },
    DeadLettersCleared {
        count: usize,
    },
    CircuitStateChanged {
        from: CircuitState,
        to: CircuitState,
    },
    CircuitReset,
    ErrorRecoveryReset,
    OrphansRemoved {
        count: usize,
    },
}

/// Receives every [`SyncEvent`]. Called outside the engine's lock, so an
/// observer may call back into the engine.
pub trait SyncObserver: Send + Sync {
    fn on_event(&self, event: &SyncEvent);
}

/// Forwards events to the `log` facade at debug level.
pub struct LogObserver;

impl SyncObserver for LogObserver {
    fn on_event(&self, event: &SyncEvent) {
        log::debug!("sync event: {event:?}");
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecoveryMetrics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub retried_operations: u64,
    pub errors_by_category: BTreeMap<ErrorCategory, u64>,
    pub average_retry_count: f64,
    pub average_retry_delay: f64,
    pub circuit_breaker_trips: u64,
    pub retry_budget_exhaustion: u64,
    pub dead_letter_count: u64,
}

/// Last-outcome view of the sync pipeline on this node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub last_success_at: Option<u64>,
    pub last_failure_at: Option<u64>,
    pub last_error: Option<String>,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    metrics: ErrorRecoveryMetrics,
    status: SyncStatus,
    terminal_ops: u64,
    retry_count_sum: u64,
    retry_delay_sum: u64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &SyncEvent) {
        let m = &mut self.metrics;
        match event {
            SyncEvent::Enqueued { .. } => m.total_operations += 1,
            SyncEvent::Succeeded { attempt, at, .. } => {
                m.successful_operations += 1;
                self.status.last_success_at = Some(*at);
                self.status.last_error = None;
                self.record_terminal(*attempt);
            }
            SyncEvent::AttemptFailed {
                category,
                message,
                at,
                ..
            } => {
                m.failed_operations += 1;
                *m.errors_by_category.entry(*category).or_insert(0) += 1;
                self.status.last_failure_at = Some(*at);
                self.status.last_error = Some(message.clone());
            }
            SyncEvent::RetryScheduled { delay_ms, .. } => {
                m.retried_operations += 1;
                self.retry_delay_sum += delay_ms;
                m.average_retry_delay = self.retry_delay_sum as f64 / m.retried_operations as f64;
            }
            SyncEvent::BudgetExhausted { .. } => m.retry_budget_exhaustion += 1,
            SyncEvent::DeadLettered { attempt, .. } => {
                m.dead_letter_count += 1;
                self.record_terminal(*attempt);
            }
            SyncEvent::CircuitStateChanged {
                to: CircuitState::Open,
                ..
            } => m.circuit_breaker_trips += 1,
            SyncEvent::ErrorRecoveryReset => self.reset(),
            _ => {}
        }
    }

    fn record_terminal(&mut self, attempt: u32) {
        self.terminal_ops += 1;
        self.retry_count_sum += u64::from(attempt.saturating_sub(1));
        self.metrics.average_retry_count = self.retry_count_sum as f64 / self.terminal_ops as f64;
    }

    /// Zero every counter. The last-outcome status is kept.
    pub fn reset(&mut self) {
        self.metrics = ErrorRecoveryMetrics::default();
        self.terminal_ops = 0;
        self.retry_count_sum = 0;
        self.retry_delay_sum = 0;
    }

    pub fn metrics(&self) -> &ErrorRecoveryMetrics {
        &self.metrics
    }

    pub fn status(&self) -> &SyncStatus {
        &self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(category: ErrorCategory, at: u64) -> SyncEvent {
        SyncEvent::AttemptFailed {
            op_id: "op".into(),
            attempt: 1,
            category,
            message: format!("{category} failure"),
            at,
        }
    }

    #[test]
    fn counts_follow_events() {
        let mut agg = MetricsAggregator::new();
        agg.record(&SyncEvent::Enqueued {
            op_id: "op".into(),
            record_id: "r".into(),
        });
        agg.record(&failed(ErrorCategory::Network, 10));
        agg.record(&SyncEvent::RetryScheduled {
            op_id: "op".into(),
            attempt: 1,
            delay_ms: 800,
        });
        agg.record(&failed(ErrorCategory::Network, 20));
        agg.record(&SyncEvent::RetryScheduled {
            op_id: "op".into(),
            attempt: 2,
            delay_ms: 1_600,
        });
        agg.record(&SyncEvent::Succeeded {
            op_id: "op".into(),
            attempt: 3,
            at: 30,
        });

        let m = agg.metrics();
        assert_eq!(m.total_operations, 1);
        assert_eq!(m.successful_operations, 1);
        assert_eq!(m.failed_operations, 2);
        assert_eq!(m.retried_operations, 2);
        assert_eq!(m.errors_by_category.get(&ErrorCategory::Network), Some(&2));
        assert_eq!(m.average_retry_count, 2.0);
        assert_eq!(m.average_retry_delay, 1_200.0);

        let status = agg.status();
        assert_eq!(status.last_success_at, Some(30));
        assert_eq!(status.last_failure_at, Some(20));
        assert!(status.last_error.is_none());
    }

    #[test]
    fn trips_count_only_transitions_into_open() {
        let mut agg = MetricsAggregator::new();
        agg.record(&SyncEvent::CircuitStateChanged {
            from: CircuitState::Closed,
            to: CircuitState::Open,
        });
        agg.record(&SyncEvent::CircuitStateChanged {
            from: CircuitState::Open,
            to: CircuitState::HalfOpen,
        });
        agg.record(&SyncEvent::CircuitStateChanged {
            from: CircuitState::HalfOpen,
            to: CircuitState::Open,
        });
        assert_eq!(agg.metrics().circuit_breaker_trips, 2);
    }

    #[test]
    fn error_recovery_reset_zeroes_counters() {
        let mut agg = MetricsAggregator::new();
        agg.record(&failed(ErrorCategory::Authentication, 5));
        agg.record(&SyncEvent::DeadLettered {
            op_id: "op".into(),
            attempt: 1,
            reason: DeadReason::AttemptsExhausted { attempts: 1 },
        });
        agg.record(&SyncEvent::BudgetExhausted { op_id: "x".into() });
        agg.record(&SyncEvent::ErrorRecoveryReset);

        assert_eq!(agg.metrics(), &ErrorRecoveryMetrics::default());
        assert_eq!(agg.status().last_failure_at, Some(5));
    }
}
