use std::fmt::Write as _;

use serde::Serialize;

use super::budget::BudgetSnapshot;
use super::circuit_breaker::{CircuitBreakerState, CircuitState};
use super::classifier::ErrorCategory;
use super::dead_letter::DeadLetter;
use super::metrics::{ErrorRecoveryMetrics, SyncStatus};
use super::queue::QueueStats;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerHealth {
    #[serde(flatten)]
    pub state: CircuitBreakerState,
    pub is_healthy: bool,
    /// Milliseconds left before an OPEN breaker admits a trial.
    pub cooldown_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterHealth {
    pub count: usize,
    pub items: Vec<DeadLetter>,
}

/// Point-in-time snapshot of the sync pipeline, assembled under one lock.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub circuit_breaker: CircuitBreakerHealth,
    pub retry_budget: BudgetSnapshot,
    pub dead_letters: DeadLetterHealth,
    pub queue: QueueStats,
    pub metrics: ErrorRecoveryMetrics,
    pub sync: SyncStatus,
    pub generated_at: u64,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.circuit_breaker.is_healthy
    }

    /// Prometheus text exposition (format 0.0.4).
    pub fn render_prometheus(&self) -> String {
        let m = &self.metrics;
        let mut out = String::with_capacity(2048);

        let _ = writeln!(out, "# TYPE syncline_operations_total counter");
        for (outcome, value) in [
            ("enqueued", m.total_operations),
            ("success", m.successful_operations),
            ("failed", m.failed_operations),
            ("retried", m.retried_operations),
            ("dead", m.dead_letter_count),
        ] {
            let _ = writeln!(out, "syncline_operations_total{{outcome=\"{outcome}\"}} {value}");
        }

        let _ = writeln!(out, "# TYPE syncline_errors_total counter");
        for category in ErrorCategory::ALL {
            let value = m.errors_by_category.get(&category).copied().unwrap_or(0);
            let _ = writeln!(out, "syncline_errors_total{{category=\"{category}\"}} {value}");
        }

        let circuit = match self.circuit_breaker.state.state {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        };
        let _ = writeln!(out, "# TYPE syncline_circuit_state gauge");
        let _ = writeln!(out, "syncline_circuit_state {circuit}");
        let _ = writeln!(out, "# TYPE syncline_circuit_breaker_trips_total counter");
        let _ = writeln!(out, "syncline_circuit_breaker_trips_total {}", m.circuit_breaker_trips);

        let _ = writeln!(out, "# TYPE syncline_retry_budget_used gauge");
        let _ = writeln!(out, "syncline_retry_budget_used {}", self.retry_budget.retries);
        let _ = writeln!(out, "# TYPE syncline_retry_budget_exhausted_total counter");
        let _ = writeln!(
            out,
            "syncline_retry_budget_exhausted_total {}",
            m.retry_budget_exhaustion
        );

        let _ = writeln!(out, "# TYPE syncline_dead_letters gauge");
        let _ = writeln!(out, "syncline_dead_letters {}", self.dead_letters.count);

        let q = &self.queue;
        let _ = writeln!(out, "# TYPE syncline_queue_operations gauge");
        for (status, value) in [
            ("pending", q.pending),
            ("syncing", q.syncing),
            ("success", q.success),
            ("failed", q.failed),
        ] {
            let _ = writeln!(out, "syncline_queue_operations{{status=\"{status}\"}} {value}");
        }

        out
    }
}
