use proptest::prelude::*;

use syncline::common::{FixedJitter, RandomJitter};
use syncline::config::{BreakerConfig, BudgetConfig, RetryConfig};
use syncline::sync::{
    classify, Admission, CircuitBreaker, CircuitState, ErrorCategory, OperationStatus,
    OperationType, RawError, RetryBudget, RetryDecision, RetryScheduler, SyncOperation,
};

fn failed_op(attempt: u32) -> SyncOperation {
    SyncOperation {
        id: "op".into(),
        seq: 1,
        table: "notes".into(),
        record_id: "note-1".into(),
        op_type: OperationType::Update,
        payload: serde_json::Value::Null,
        created_at: 0,
        attempt,
        status: OperationStatus::Failed,
        history: Vec::new(),
        next_attempt_at: None,
        pending_delay: 0,
        last_error: None,
        updated_at: 0,
        origin: None,
    }
}

proptest! {
    #[test]
    fn budget_never_admits_more_than_limit_per_window(
        limit in 0u32..50,
        window_ms in 1u64..10_000,
        steps in proptest::collection::vec(0u64..500, 1..300),
    ) {
        let mut budget = RetryBudget::new(&BudgetConfig { limit, window_ms }, 0);
        let mut now = 0u64;
        let mut window_start = 0u64;
        let mut admitted_in_window = 0u32;

        for step in steps {
            now += step;
            if now - window_start >= window_ms {
                window_start = now;
                admitted_in_window = 0;
            }
            if budget.consume(now) {
                admitted_in_window += 1;
            }
            prop_assert!(admitted_in_window <= limit);
            prop_assert!(budget.retries() <= budget.limit());
        }
    }

    #[test]
    fn backoff_stays_inside_jitter_envelope_and_cap(
        base in 1u64..5_000,
        max in 1u64..120_000,
        attempt in 1u32..40,
        seed in any::<u64>(),
    ) {
        let config = RetryConfig {
            base_delay_ms: base,
            max_delay_ms: max,
            ..RetryConfig::default()
        };
        let jitter_min = config.jitter_min;
        let jitter_max = config.jitter_max;
        let scheduler = RetryScheduler::new(config);

        let low = scheduler.backoff_delay(attempt, jitter_min);
        let high = scheduler.backoff_delay(attempt, jitter_max);
        let sampled = {
            use syncline::common::JitterSource;
            let factor = RandomJitter::seeded(seed).sample(jitter_min, jitter_max);
            scheduler.backoff_delay(attempt, factor)
        };

        prop_assert!(low <= sampled && sampled <= high);
        prop_assert!(sampled <= max);
        // Neutral jitter doubles per attempt until the cap.
        let neutral = scheduler.backoff_delay(attempt, 1.0);
        let next = scheduler.backoff_delay(attempt + 1, 1.0);
        prop_assert!(next == max || next == neutral * 2 || neutral == max);
    }

    #[test]
    fn scheduler_retries_only_retryable_categories(
        status in 100u16..600,
        attempt in 1u32..10,
    ) {
        let category = classify(&RawError::http(status, "x"));
        let scheduler = RetryScheduler::new(RetryConfig::default());
        let mut budget = RetryBudget::new(&BudgetConfig::default(), 0);

        let decision = scheduler.schedule(
            &failed_op(attempt),
            category,
            &mut budget,
            &FixedJitter(1.0),
            0,
        );
        if let RetryDecision::Retry { .. } = decision {
            prop_assert!(category.is_retryable());
            let max = scheduler.max_attempts(category).unwrap_or(0);
            prop_assert!(attempt < max);
        }
        if matches!(category, ErrorCategory::ClientError | ErrorCategory::Conflict) {
            prop_assert!(matches!(decision, RetryDecision::DeadLetter(_)));
        }
    }

    #[test]
    fn breaker_opens_only_after_threshold_consecutive_failures(
        threshold in 1u32..10,
        outcomes in proptest::collection::vec(any::<bool>(), 1..60),
    ) {
        let config = BreakerConfig {
            failure_threshold: threshold,
            failure_window_ms: 1_000_000,
            cooldown_ms: 1_000_000,
        };
        let mut breaker = CircuitBreaker::new(config, 0);
        let mut consecutive = 0u32;

        for (i, success) in outcomes.into_iter().enumerate() {
            let now = i as u64;
            if breaker.state() == CircuitState::Open {
                break;
            }
            if success {
                breaker.record_success(now, false);
                consecutive = 0;
            } else {
                breaker.record_failure(now, false);
                consecutive += 1;
            }
            let expect_open = consecutive >= threshold;
            prop_assert_eq!(breaker.state() == CircuitState::Open, expect_open);
        }
    }

    #[test]
    fn closed_breaker_never_admits_past_threshold(
        threshold in 1u32..10,
        steps in proptest::collection::vec(0u8..3, 1..80),
    ) {
        let config = BreakerConfig {
            failure_threshold: threshold,
            failure_window_ms: 1_000_000,
            cooldown_ms: 1_000_000,
        };
        let mut breaker = CircuitBreaker::new(config, 0);
        let mut outstanding = 0u32;

        for (i, step) in steps.into_iter().enumerate() {
            let now = i as u64;
            if breaker.state() != CircuitState::Closed {
                break;
            }
            match step {
                0 => {
                    if breaker.try_acquire(now).0 == Admission::Allowed {
                        outstanding += 1;
                    }
                }
                1 if outstanding > 0 => {
                    outstanding -= 1;
                    breaker.record_failure(now, false);
                }
                2 if outstanding > 0 => {
                    outstanding -= 1;
                    breaker.record_success(now, false);
                }
                _ => {}
            }
            if breaker.state() == CircuitState::Closed {
                let failures = breaker.snapshot().consecutive_failures;
                prop_assert!(failures + outstanding <= threshold);
            }
        }
    }
}
