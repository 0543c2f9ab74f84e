//! Error counters and the bounded recovery history.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::debug;

use super::classify::TrioError;
use super::{RecoveryContext, RecoveryResult};
use crate::lock;

/// Failure counts per `service:type` key.
///
/// Every recorded error has a small chance of clearing all counters, which
/// bounds how long old failures keep influencing strategy selection.
#[derive(Debug)]
pub struct ErrorStatistics {
    counts: Mutex<HashMap<String, u64>>,
    reset_probability: f64,
}

impl ErrorStatistics {
    /// Counters that clear with `reset_probability` on each record.
    pub fn new(reset_probability: f64) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            reset_probability: reset_probability.clamp(0.0, 1.0),
        }
    }

    /// Count one failure for `key` and return the updated count.
    ///
    /// The returned count is the value before any probabilistic clear.
    pub fn record(&self, key: &str) -> u64 {
        let mut counts = lock(&self.counts);
        let count = counts.entry(key.to_owned()).or_insert(0);
        *count = count.saturating_add(1);
        let value = *count;

        if self.reset_probability > 0.0 && rand::thread_rng().gen_bool(self.reset_probability) {
            debug!("error statistics cleared");
            counts.clear();
        }
        value
    }

    /// Current count for `key`.
    pub fn count(&self, key: &str) -> u64 {
        lock(&self.counts).get(key).copied().unwrap_or(0)
    }

    /// All counts, sorted by key.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        lock(&self.counts)
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Clear all counts.
    pub fn reset(&self) {
        lock(&self.counts).clear();
    }
}

/// One recovery decision.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRecord {
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// The classified error.
    pub error: TrioError,
    /// What the strategy decided.
    pub recovery: RecoveryResult,
    /// Attempt context.
    pub context: RecoveryContext,
}

/// Most recent recovery decisions.
///
/// Once the history grows past `limit` entries it is trimmed to the newest
/// `trim_to`.
#[derive(Debug)]
pub struct RecoveryHistory {
    entries: Mutex<VecDeque<RecoveryRecord>>,
    limit: usize,
    trim_to: usize,
}

impl RecoveryHistory {
    /// History trimmed to `trim_to` entries whenever it exceeds `limit`.
    pub fn new(limit: usize, trim_to: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            limit,
            trim_to: trim_to.min(limit),
        }
    }

    /// Append a record.
    pub fn push(&self, record: RecoveryRecord) {
        let mut entries = lock(&self.entries);
        entries.push_back(record);
        if entries.len() > self.limit {
            let excess = entries.len().saturating_sub(self.trim_to);
            entries.drain(..excess);
        }
    }

    /// Up to `limit` most recent records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<RecoveryRecord> {
        let entries = lock(&self.entries);
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether no record is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record.
    pub fn reset(&self) {
        lock(&self.entries).clear();
    }
}
