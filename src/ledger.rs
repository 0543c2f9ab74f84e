//! Transaction ledger for one trio attempt.
//!
//! A [`Ledger`] records every side effect already performed during an
//! attempt together with the compensating action that undoes it. The
//! ledger ends in exactly one terminal state: committed, rolled back or
//! failed. Rollback runs compensations newest-first and keeps going when
//! one of them fails.
//!
//! [`LedgerManager`] tracks ledgers that are still in flight and keeps a
//! bounded history of finished ones for introspection.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::lock;

/// Boxed future returned by a compensating action.
pub type CompensationFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// A one-shot compensating action that undoes or neutralises an operation.
pub type Compensation = Box<dyn FnOnce() -> CompensationFuture + Send>;

/// Number of finished ledgers kept by [`LedgerManager`].
const HISTORY_CAPACITY: usize = 100;

// ── Errors ──────────────────────────────────────────────────────

/// Ledger lifecycle violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// The ledger already reached a terminal state.
    #[error("transaction {id} is already {status}")]
    AlreadyTerminal {
        /// Ledger identifier.
        id: Uuid,
        /// The terminal status it is in.
        status: TransactionStatus,
    },
}

// ── Types ───────────────────────────────────────────────────────

/// The channel an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Outbound email.
    Email,
    /// Persisted in-app message.
    Message,
    /// Real-time push.
    Socket,
}

impl Channel {
    /// Lowercase tag used in logs and serialized state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Message => "message",
            Self::Socket => "socket",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a ledger. Every status but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Operations may still be added.
    Pending,
    /// All operations succeeded and were kept.
    Committed,
    /// Operations were compensated.
    RolledBack,
    /// The attempt failed without compensation.
    Failed,
}

impl TransactionStatus {
    /// Snake-case tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A side effect that was performed, as seen from the outside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Channel that produced the effect.
    pub channel: Channel,
    /// Identifier of the produced artefact (email id, message id, ...).
    pub id: String,
    /// Free-form details.
    pub metadata: Option<serde_json::Value>,
    /// When the operation was registered.
    pub performed_at: DateTime<Utc>,
}

/// An operation about to be registered on a ledger.
pub struct NewOperation {
    id: String,
    metadata: Option<serde_json::Value>,
    rollback: Compensation,
}

impl NewOperation {
    /// Operation with an async compensating action.
    pub fn new<F, Fut>(id: impl Into<String>, rollback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            id: id.into(),
            metadata: None,
            rollback: Box::new(move || Box::pin(rollback())),
        }
    }

    /// Operation whose effect cannot be undone; rollback only logs it.
    pub fn irreversible(id: impl Into<String>) -> Self {
        Self::new(id, || async { Ok(()) })
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl std::fmt::Debug for NewOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewOperation")
            .field("id", &self.id)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a ledger's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionState {
    /// Ledger identifier.
    pub id: Uuid,
    /// Current status.
    pub status: TransactionStatus,
    /// Performed operations in execution order.
    pub operations: Vec<OperationRecord>,
    /// When the ledger was opened.
    pub started_at: DateTime<Utc>,
    /// When the ledger reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Failure summary, if any.
    pub error: Option<String>,
}

/// A compensation that returned an error during rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationFailure {
    /// Channel of the operation.
    pub channel: Channel,
    /// Operation identifier.
    pub id: String,
    /// Error returned by the compensation.
    pub error: String,
}

/// What a rollback did.
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    /// Compensations that completed.
    pub compensated: usize,
    /// Compensations that failed.
    pub failures: Vec<CompensationFailure>,
}

impl RollbackReport {
    /// True when every compensation succeeded.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

// ── Ledger ──────────────────────────────────────────────────────

/// Per-attempt record of performed operations and their compensations.
pub struct Ledger {
    state: TransactionState,
    compensations: Vec<Compensation>,
}

impl Ledger {
    /// Open a pending ledger with a fresh id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Open a pending ledger with a known id.
    pub fn with_id(id: Uuid) -> Self {
        Self {
            state: TransactionState {
                id,
                status: TransactionStatus::Pending,
                operations: Vec::new(),
                started_at: Utc::now(),
                ended_at: None,
                error: None,
            },
            compensations: Vec::new(),
        }
    }

    /// Ledger identifier.
    pub fn id(&self) -> Uuid {
        self.state.id
    }

    /// Current status.
    pub fn status(&self) -> TransactionStatus {
        self.state.status
    }

    /// Register a performed operation.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AlreadyTerminal`] once the ledger left `pending`.
    pub fn add_operation(&mut self, channel: Channel, op: NewOperation) -> Result<(), LedgerError> {
        self.ensure_pending()?;
        debug!(trio_id = %self.state.id, %channel, op_id = %op.id, "operation registered");
        self.state.operations.push(OperationRecord {
            channel,
            id: op.id,
            metadata: op.metadata,
            performed_at: Utc::now(),
        });
        self.compensations.push(op.rollback);
        Ok(())
    }

    /// Keep every operation and close the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AlreadyTerminal`] if the ledger is not pending.
    pub fn commit(&mut self) -> Result<(), LedgerError> {
        self.ensure_pending()?;
        self.compensations.clear();
        self.finish(TransactionStatus::Committed);
        info!(
            trio_id = %self.state.id,
            operations = self.state.operations.len(),
            "transaction committed"
        );
        Ok(())
    }

    /// Close the ledger as failed without compensating anything.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AlreadyTerminal`] if the ledger is not pending.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), LedgerError> {
        self.ensure_pending()?;
        self.compensations.clear();
        self.state.error = Some(reason.into());
        self.finish(TransactionStatus::Failed);
        Ok(())
    }

    /// Compensate every operation newest-first and close the ledger.
    ///
    /// A failing compensation is logged and the remaining ones still run.
    /// Calling this again after a rollback is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AlreadyTerminal`] if the ledger was committed or failed.
    pub async fn rollback(&mut self) -> Result<RollbackReport, LedgerError> {
        match self.state.status {
            TransactionStatus::Pending => {}
            TransactionStatus::RolledBack => return Ok(RollbackReport::default()),
            status => {
                return Err(LedgerError::AlreadyTerminal {
                    id: self.state.id,
                    status,
                })
            }
        }

        let id = self.state.id;
        info!(trio_id = %id, operations = self.compensations.len(), "rolling back transaction");

        let mut report = RollbackReport::default();
        let compensations = std::mem::take(&mut self.compensations);
        for (record, compensate) in self
            .state
            .operations
            .iter()
            .zip(compensations)
            .rev()
        {
            match compensate().await {
                Ok(()) => {
                    debug!(trio_id = %id, channel = %record.channel, op_id = %record.id, "operation compensated");
                    report.compensated = report.compensated.saturating_add(1);
                }
                Err(e) => {
                    warn!(trio_id = %id, channel = %record.channel, op_id = %record.id, error = %e, "compensation failed");
                    report.failures.push(CompensationFailure {
                        channel: record.channel,
                        id: record.id.clone(),
                        error: e,
                    });
                }
            }
        }

        if !report.is_complete() {
            let total = report.failures.len().saturating_add(report.compensated);
            self.state.error = Some(format!(
                "partial rollback failure: {} of {total} compensations failed",
                report.failures.len()
            ));
        }
        self.finish(TransactionStatus::RolledBack);
        Ok(report)
    }

    /// Snapshot of the ledger state.
    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    /// Whether a terminal state was reached.
    pub fn is_completed(&self) -> bool {
        self.state.status.is_terminal()
    }

    /// True iff the ledger was committed.
    pub fn is_successful(&self) -> bool {
        self.state.status == TransactionStatus::Committed
    }

    /// Time from opening to the terminal state, or until now while pending.
    pub fn duration(&self) -> std::time::Duration {
        let end = self.state.ended_at.unwrap_or_else(Utc::now);
        end.signed_duration_since(self.state.started_at)
            .to_std()
            .unwrap_or_default()
    }

    fn ensure_pending(&self) -> Result<(), LedgerError> {
        if self.state.status.is_terminal() {
            return Err(LedgerError::AlreadyTerminal {
                id: self.state.id,
                status: self.state.status,
            });
        }
        Ok(())
    }

    fn finish(&mut self, status: TransactionStatus) {
        self.state.status = status;
        self.state.ended_at = Some(Utc::now());
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("state", &self.state)
            .field("pending_compensations", &self.compensations.len())
            .finish()
    }
}

// ── Manager ─────────────────────────────────────────────────────

/// Compact record of a finished ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSummary {
    /// Ledger identifier.
    pub id: Uuid,
    /// Terminal status.
    pub status: TransactionStatus,
    /// Channels of the operations, in execution order.
    pub channels: Vec<Channel>,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Failure summary, if any.
    pub error: Option<String>,
    /// When the ledger finished.
    pub finished_at: DateTime<Utc>,
}

/// Counters over every ledger seen by a [`LedgerManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Ledgers still in flight.
    pub active: usize,
    /// Ledgers finished as committed.
    pub committed: u64,
    /// Ledgers finished as rolled back.
    pub rolled_back: u64,
    /// Ledgers finished as failed.
    pub failed: u64,
}

/// Tracks in-flight ledgers and a bounded history of finished ones.
#[derive(Debug, Default)]
pub struct LedgerManager {
    active: Mutex<HashMap<Uuid, DateTime<Utc>>>,
    history: Mutex<VecDeque<TransactionSummary>>,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    failed: AtomicU64,
}

impl LedgerManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new ledger and mark it active.
    pub fn begin(&self) -> Ledger {
        let ledger = Ledger::new();
        lock(&self.active).insert(ledger.id(), ledger.state().started_at);
        ledger
    }

    /// Move a ledger from the active set into history.
    ///
    /// Ledgers that are still pending are left active.
    pub fn finish(&self, ledger: &Ledger) {
        let state = ledger.state();
        let counter = match state.status {
            TransactionStatus::Pending => return,
            TransactionStatus::Committed => &self.committed,
            TransactionStatus::RolledBack => &self.rolled_back,
            TransactionStatus::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        lock(&self.active).remove(&state.id);

        let summary = TransactionSummary {
            id: state.id,
            status: state.status,
            channels: state.operations.iter().map(|op| op.channel).collect(),
            duration_ms: u64::try_from(ledger.duration().as_millis()).unwrap_or(u64::MAX),
            error: state.error.clone(),
            finished_at: state.ended_at.unwrap_or_else(Utc::now),
        };
        let mut history = lock(&self.history);
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(summary);
    }

    /// Number of ledgers in flight.
    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Most recent finished ledgers, newest last.
    pub fn history(&self, limit: usize) -> Vec<TransactionSummary> {
        let history = lock(&self.history);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Counters by terminal status.
    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            active: self.active_count(),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Forget active ledgers opened more than `max_age` before `now`.
    ///
    /// Returns how many were dropped.
    pub fn prune_stale(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> usize {
        let mut active = lock(&self.active);
        let before = active.len();
        active.retain(|_, started| now.signed_duration_since(*started) <= max_age);
        let pruned = before.saturating_sub(active.len());
        if pruned > 0 {
            warn!(pruned, "dropped stale in-flight transactions");
        }
        pruned
    }

    /// Clear everything.
    pub fn reset(&self) {
        lock(&self.active).clear();
        lock(&self.history).clear();
        self.committed.store(0, Ordering::Relaxed);
        self.rolled_back.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }
}
