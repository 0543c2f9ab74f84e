//! Process-wide trio counters.
//!
//! Each counter is an independent atomic; only the per-error-type map sits
//! behind its own mutex. Nothing here is persisted.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::lock;
use crate::recovery::classify::ErrorType;

/// Counters shared by every coordinator in the process.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rollbacks: AtomicU64,
    total_latency_ms: AtomicU64,
    errors_by_type: Mutex<HashMap<ErrorType, u64>>,
}

/// Point-in-time copy of [`MetricsRegistry`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Attempts started.
    pub total_attempts: u64,
    /// Attempts that committed.
    pub successes: u64,
    /// Attempts that failed.
    pub failures: u64,
    /// Failed attempts that were rolled back.
    pub rollbacks: u64,
    /// Mean attempt duration in milliseconds.
    pub average_latency_ms: f64,
    /// Successes over attempts, 0 when nothing ran.
    pub success_rate: f64,
    /// Failures per error type.
    pub errors_by_type: BTreeMap<String, u64>,
}

impl MetricsRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a committed attempt.
    pub fn record_success(&self, duration: Duration) {
        self.record_attempt(duration);
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed attempt.
    pub fn record_failure(&self, duration: Duration, error_type: ErrorType, rolled_back: bool) {
        self.record_attempt(duration);
        self.failures.fetch_add(1, Ordering::Relaxed);
        if rolled_back {
            self.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
        let mut errors = lock(&self.errors_by_type);
        let count = errors.entry(error_type).or_insert(0);
        *count = count.saturating_add(1);
    }

    fn record_attempt(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.total.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Copy the current values.
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let latency = self.total_latency_ms.load(Ordering::Relaxed);
        let (average_latency_ms, success_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            (latency as f64 / total as f64, successes as f64 / total as f64)
        };

        MetricsSnapshot {
            total_attempts: total,
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            average_latency_ms,
            success_rate,
            errors_by_type: lock(&self.errors_by_type)
                .iter()
                .map(|(t, n)| (t.as_str().to_owned(), *n))
                .collect(),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
        self.total_latency_ms.store(0, Ordering::Relaxed);
        lock(&self.errors_by_type).clear();
    }
}
