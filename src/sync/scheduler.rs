use std::fmt;

use serde::{Deserialize, Serialize};

use super::budget::RetryBudget;
use super::classifier::ErrorCategory;
use super::operation::SyncOperation;
use crate::common::JitterSource;
use crate::config::RetryConfig;

/// Why an operation left the automatic retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DeadReason {
    NonRetryable,
    AttemptsExhausted { attempts: u32 },
    BudgetExhausted,
}

impl fmt::Display for DeadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadReason::NonRetryable => write!(f, "non-retryable error"),
            DeadReason::AttemptsExhausted { attempts } => {
                write!(f, "retries exhausted after {attempts} attempts")
            }
            DeadReason::BudgetExhausted => write!(f, "budget exhaustion"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay_ms: u64 },
    DeadLetter(DeadReason),
}

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self, category: ErrorCategory) -> Option<u32> {
        if !category.is_retryable() {
            return None;
        }
        self.config.max_attempts.for_category(category)
    }

    /// `base * 2^(attempt-1) * jitter`, capped at `max_delay_ms`.
    /// `attempt` is the ordinal of the attempt that just failed.
    pub fn backoff_delay(&self, attempt: u32, jitter: f64) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.config.base_delay_ms as f64 * 2f64.powi(exponent) * jitter;
        let capped = raw.min(self.config.max_delay_ms as f64).max(0.0);
        capped.round() as u64
    }

    /// Decide what happens to `op` after its latest attempt failed with
    /// `category`. Consumes from `budget` only when a retry is admitted.
    pub fn schedule(
        &self,
        op: &SyncOperation,
        category: ErrorCategory,
        budget: &mut RetryBudget,
        jitter: &dyn JitterSource,
        now_ms: u64,
    ) -> RetryDecision {
        let max_attempts = match self.max_attempts(category) {
            Some(max) => max,
            None => return RetryDecision::DeadLetter(DeadReason::NonRetryable),
        };

        if op.attempt >= max_attempts {
            return RetryDecision::DeadLetter(DeadReason::AttemptsExhausted {
                attempts: op.attempt,
            });
        }

        let factor = jitter.sample(self.config.jitter_min, self.config.jitter_max);
        let delay_ms = self.backoff_delay(op.attempt, factor);

        if !budget.consume(now_ms) {
            return RetryDecision::DeadLetter(DeadReason::BudgetExhausted);
        }

        RetryDecision::Retry { delay_ms }
    }
}
