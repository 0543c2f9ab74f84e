//! Per-key circuit breaker over error recovery attempts.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::lock;

/// What recording a failure did to the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// The reset window elapsed since the previous failure; counting restarted at 1.
    Reset,
    /// Failure counted, circuit still closed.
    Recording {
        /// Failures inside the current window.
        failures: u32,
    },
    /// Threshold reached; recovery is blocked until the window passes.
    Open {
        /// Failures inside the current window.
        failures: u32,
    },
}

#[derive(Debug, Clone, Copy)]
struct BreakerState {
    failures: u32,
    last_failure: DateTime<Utc>,
}

/// Snapshot of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    /// `service:type` key.
    pub key: String,
    /// Failures inside the current window.
    pub failures: u32,
    /// Time of the most recent failure.
    pub last_failure: DateTime<Utc>,
    /// Whether the breaker currently blocks recovery.
    pub open: bool,
}

/// Failure counters keyed by `service:type`.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_window: Duration,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreaker {
    /// Breaker that opens at `threshold` failures within `reset_window`.
    pub fn new(threshold: u32, reset_window: Duration) -> Self {
        Self {
            threshold,
            reset_window,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Quiet period after which a key resets.
    pub fn reset_window(&self) -> Duration {
        self.reset_window
    }

    /// Record a failure for `key` at `now`.
    pub fn record_failure(&self, key: &str, now: DateTime<Utc>) -> CircuitDecision {
        let mut states = lock(&self.states);
        let state = states.entry(key.to_owned()).or_insert(BreakerState {
            failures: 0,
            last_failure: now,
        });

        if state.failures > 0 && now.signed_duration_since(state.last_failure) > self.reset_window
        {
            state.failures = 1;
            state.last_failure = now;
            return CircuitDecision::Reset;
        }

        state.failures = state.failures.saturating_add(1);
        state.last_failure = now;
        if state.failures >= self.threshold {
            CircuitDecision::Open {
                failures: state.failures,
            }
        } else {
            CircuitDecision::Recording {
                failures: state.failures,
            }
        }
    }

    /// Whether `key` is open at `now`.
    pub fn is_open(&self, key: &str, now: DateTime<Utc>) -> bool {
        lock(&self.states)
            .get(key)
            .is_some_and(|s| self.is_open_state(s, now))
    }

    /// Every tracked key.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> = lock(&self.states)
            .iter()
            .map(|(key, s)| BreakerSnapshot {
                key: key.clone(),
                failures: s.failures,
                last_failure: s.last_failure,
                open: self.is_open_state(s, now),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Forget all keys.
    pub fn reset(&self) {
        lock(&self.states).clear();
    }

    fn is_open_state(&self, state: &BreakerState, now: DateTime<Utc>) -> bool {
        state.failures >= self.threshold
            && now.signed_duration_since(state.last_failure) <= self.reset_window
    }
}
