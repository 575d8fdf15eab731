use serde::Serialize;

use crate::config::BudgetConfig;

/// System-wide cap on retries per fixed time window.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    window_start: u64,
    retries: u32,
    limit: u32,
    window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSnapshot {
    pub retries: u32,
    pub limit: u32,
    pub percent_used: f64,
    pub window_ms: u64,
    /// Milliseconds until the current window rolls over.
    pub window_reset_in: u64,
}

impl RetryBudget {
    pub fn new(config: &BudgetConfig, now_ms: u64) -> Self {
        Self {
            window_start: now_ms,
            retries: 0,
            limit: config.limit,
            window_ms: config.window_ms,
        }
    }

    fn window_elapsed(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.window_start) >= self.window_ms
    }

    /// Take one retry from the budget. Returns false when the window's
    /// allowance is used up.
    pub fn consume(&mut self, now_ms: u64) -> bool {
        if self.window_elapsed(now_ms) {
            self.reset(now_ms);
        }
        if self.retries < self.limit {
            self.retries += 1;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self, now_ms: u64) {
        self.retries = 0;
        self.window_start = now_ms;
    }

    /// Read-only view; an elapsed window reads as empty without being reset.
    pub fn snapshot(&self, now_ms: u64) -> BudgetSnapshot {
        let (retries, reset_in) = if self.window_elapsed(now_ms) {
            (0, self.window_ms)
        } else {
            let elapsed = now_ms.saturating_sub(self.window_start);
            (self.retries, self.window_ms - elapsed)
        };
        let percent_used = if self.limit == 0 {
            100.0
        } else {
            retries as f64 * 100.0 / self.limit as f64
        };
        BudgetSnapshot {
            retries,
            limit: self.limit,
            percent_used,
            window_ms: self.window_ms,
            window_reset_in: reset_in,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(limit: u32, window_ms: u64) -> RetryBudget {
        RetryBudget::new(&BudgetConfig { limit, window_ms }, 0)
    }

    #[test]
    fn hundred_and_first_retry_in_window_is_denied() {
        let mut b = budget(100, 60_000);
        for i in 0..100 {
            assert!(b.consume(i), "retry {i} should be allowed");
        }
        assert!(!b.consume(100));
        assert_eq!(b.retries(), 100);
    }

    #[test]
    fn window_rollover_restores_allowance() {
        let mut b = budget(2, 1_000);
        assert!(b.consume(0));
        assert!(b.consume(10));
        assert!(!b.consume(999));
        assert!(b.consume(1_000));
        assert_eq!(b.retries(), 1);
    }

    #[test]
    fn snapshot_reports_usage_and_reset_time() {
        let mut b = budget(4, 60_000);
        b.consume(0);
        let snap = b.snapshot(15_000);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.limit, 4);
        assert_eq!(snap.percent_used, 25.0);
        assert_eq!(snap.window_reset_in, 45_000);
    }

    #[test]
    fn snapshot_does_not_mutate_elapsed_window() {
        let mut b = budget(1, 100);
        b.consume(0);
        let snap = b.snapshot(500);
        assert_eq!(snap.retries, 0);
        assert_eq!(snap.window_reset_in, 100);
        // The stored counter is untouched until the next consume.
        assert_eq!(b.retries(), 1);
    }

    #[test]
    fn reset_clears_usage() {
        let mut b = budget(1, 60_000);
        assert!(b.consume(0));
        assert!(!b.consume(1));
        b.reset(2);
        assert!(b.consume(3));
    }
}
