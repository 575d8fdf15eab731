//! Circuit breaker gating dispatch to the remote store.
//!
//! ```text
//! CLOSED    -> OPEN       consecutive failures reach the threshold
//! OPEN      -> HALF_OPEN  cooldown elapsed since the trip
//! HALF_OPEN -> CLOSED     the single trial dispatch succeeds
//! HALF_OPEN -> OPEN       the trial fails, cooldown restarts
//! any       -> CLOSED     manual reset
//! ```
//!
//! Results of dispatches admitted before a trip never decide HALF_OPEN;
//! only the trial does.
//!
//! The breaker holds no lock of its own: the engine mutates it under the
//! same mutex as the retry budget and the queue.

use serde::{Deserialize, Serialize};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<u64>,
    pub last_transition_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    /// CLOSED or HALF_OPEN to OPEN.
    Tripped,
    HalfOpened,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Allowed as the single HALF_OPEN trial.
    Trial,
    Rejected {
        retry_in_ms: u64,
    },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitBreakerState,
    trial_in_flight: bool,
    /// Non-trial dispatches admitted and not yet settled.
    in_flight: u32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, now_ms: u64) -> Self {
        Self {
            config,
            state: CircuitBreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                last_transition_at: now_ms,
            },
            trial_in_flight: false,
            in_flight: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.state.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.state.state == CircuitState::Closed
    }

    fn transition(&mut self, to: CircuitState, now_ms: u64) {
        self.state.state = to;
        self.state.last_transition_at = now_ms;
    }

    fn failure_is_recent(&self, now_ms: u64) -> bool {
        self.state
            .last_failure_at
            .map(|at| now_ms.saturating_sub(at) <= self.config.failure_window_ms)
            .unwrap_or(false)
    }

    fn settle(&mut self, trial: bool) {
        if trial {
            self.trial_in_flight = false;
        } else {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
    }

    /// Milliseconds left before an OPEN breaker will admit a trial.
    pub fn remaining_cooldown(&self, now_ms: u64) -> Option<u64> {
        if self.state.state != CircuitState::Open {
            return None;
        }
        let ready_at = self.state.last_transition_at + self.config.cooldown_ms;
        Some(ready_at.saturating_sub(now_ms))
    }

    /// Ask to dispatch one operation. Moves OPEN to HALF_OPEN once the
    /// cooldown has elapsed and hands out the single trial slot.
    ///
    /// While CLOSED, recent consecutive failures plus unsettled dispatches
    /// may not exceed the failure threshold, so a failing remote never sees
    /// more calls than it takes to trip.
    pub fn try_acquire(&mut self, now_ms: u64) -> (Admission, Option<BreakerTransition>) {
        match self.state.state {
            CircuitState::Closed => {
                let failures = if self.failure_is_recent(now_ms) {
                    self.state.consecutive_failures
                } else {
                    0
                };
                if failures.saturating_add(self.in_flight) >= self.config.failure_threshold {
                    (Admission::Rejected { retry_in_ms: 0 }, None)
                } else {
                    self.in_flight += 1;
                    (Admission::Allowed, None)
                }
            }
            CircuitState::Open => match self.remaining_cooldown(now_ms) {
                Some(0) => {
                    self.transition(CircuitState::HalfOpen, now_ms);
                    self.trial_in_flight = true;
                    (Admission::Trial, Some(BreakerTransition::HalfOpened))
                }
                Some(retry_in_ms) => (Admission::Rejected { retry_in_ms }, None),
                None => (Admission::Rejected { retry_in_ms: 0 }, None),
            },
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    (Admission::Rejected { retry_in_ms: 0 }, None)
                } else {
                    self.trial_in_flight = true;
                    (Admission::Trial, None)
                }
            }
        }
    }

    /// Settle a dispatch that reached the remote. `trial` is the flag its
    /// admission carried; only the trial decides a HALF_OPEN breaker.
    pub fn record_success(&mut self, now_ms: u64, trial: bool) -> Option<BreakerTransition> {
        self.settle(trial);
        match self.state.state {
            CircuitState::Closed => {
                self.state.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen if trial => {
                self.state.consecutive_failures = 0;
                self.transition(CircuitState::Closed, now_ms);
                Some(BreakerTransition::Closed)
            }
            // Late result of a dispatch admitted before the trip.
            CircuitState::HalfOpen | CircuitState::Open => None,
        }
    }

    pub fn record_failure(&mut self, now_ms: u64, trial: bool) -> Option<BreakerTransition> {
        self.settle(trial);
        if self.state.state == CircuitState::HalfOpen && !trial {
            return None;
        }

        if !self.failure_is_recent(now_ms) && self.state.state == CircuitState::Closed {
            self.state.consecutive_failures = 0;
        }
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        self.state.last_failure_at = Some(now_ms);

        match self.state.state {
            CircuitState::Closed
                if self.state.consecutive_failures >= self.config.failure_threshold =>
            {
                self.transition(CircuitState::Open, now_ms);
                Some(BreakerTransition::Tripped)
            }
            CircuitState::HalfOpen => {
                self.transition(CircuitState::Open, now_ms);
                Some(BreakerTransition::Tripped)
            }
            _ => None,
        }
    }

    /// Give back an admission whose dispatch was cancelled before an outcome.
    pub fn release(&mut self, trial: bool) {
        self.settle(trial);
    }

    /// Force CLOSED. Returns false when nothing changed.
    pub fn reset(&mut self, now_ms: u64) -> bool {
        let was_closed = self.state.state == CircuitState::Closed;
        let had_failures = self.state.consecutive_failures > 0;
        self.state.consecutive_failures = 0;
        self.trial_in_flight = false;
        if !was_closed {
            self.transition(CircuitState::Closed, now_ms);
        }
        !was_closed || had_failures
    }
}
