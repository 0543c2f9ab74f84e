//! Error classification and recovery strategy selection.
//!
//! After a failed trio attempt the [`ErrorHandler`] classifies the error,
//! counts it per `service:type` key, picks a [`RecoveryStrategy`] and runs
//! it. The result is advisory: it describes how a later retry of the same
//! notification should be scheduled or suppressed, it never turns a failed
//! attempt into a successful one.

pub mod circuit;
pub mod classify;
pub mod stats;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use self::circuit::{BreakerSnapshot, CircuitBreaker, CircuitDecision};
use self::classify::{classify_error, ErrorType, Severity, TrioError};
use self::stats::{ErrorStatistics, RecoveryHistory, RecoveryRecord};
use crate::config::RecoveryConfig;

// ── Results ─────────────────────────────────────────────────────

/// What a recovery strategy did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// A retry with backoff should follow.
    RetryScheduled,
    /// Handed to the follow-up queue.
    Queued,
    /// A background retry was scheduled far out.
    DeferredRetryScheduled,
    /// Nothing attempted; the error was only logged.
    Logged,
    /// The breaker blocks recovery for this key.
    CircuitOpen,
    /// The breaker reset after a quiet period.
    CircuitReset,
    /// The breaker counted the failure and stays closed.
    CircuitRecording,
}

impl RecoveryAction {
    /// Snake-case tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryScheduled => "retry_scheduled",
            Self::Queued => "queued",
            Self::DeferredRetryScheduled => "deferred_retry_scheduled",
            Self::Logged => "logged",
            Self::CircuitOpen => "circuit_open",
            Self::CircuitReset => "circuit_reset",
            Self::CircuitRecording => "circuit_recording",
        }
    }
}

/// Outcome of applying a recovery strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    /// Whether recovery may proceed.
    pub success: bool,
    /// What was done.
    pub action: RecoveryAction,
    /// Human-readable summary.
    pub message: String,
    /// Suggested wait before the next attempt, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Strategy-specific details (queue position, attempt budget, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl RecoveryResult {
    fn new(success: bool, action: RecoveryAction, message: impl Into<String>) -> Self {
        Self {
            success,
            action,
            message: message.into(),
            retry_after_ms: None,
            metadata: None,
        }
    }

    fn retry_after(mut self, delay: Duration) -> Self {
        self.retry_after_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Facts about the failed attempt that recovery decisions are logged with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryContext {
    /// Ledger of the attempt.
    pub trio_id: Option<Uuid>,
    /// Email template, when the attempt included an email.
    pub template: Option<String>,
    /// Number of recipients.
    pub recipients: usize,
    /// Operations performed before the failure.
    pub operations: usize,
}

// ── Strategies ──────────────────────────────────────────────────

/// Recovery behaviours the selector can choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Retry with exponential backoff.
    Retry {
        /// Attempts a follow-up may make.
        max_attempts: u32,
        /// Delay before the first follow-up attempt.
        base_delay: Duration,
    },
    /// Hand to the follow-up queue.
    Queue,
    /// Schedule one background retry after `delay`.
    DeferredRetry {
        /// How far out the retry runs.
        delay: Duration,
    },
    /// Log and do nothing.
    LogOnly,
    /// Consult the per-key circuit breaker.
    CircuitBreaker,
}

impl RecoveryStrategy {
    /// Strategy name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Retry { .. } => "retry",
            Self::Queue => "queue",
            Self::DeferredRetry { .. } => "deferred_retry",
            Self::LogOnly => "log_only",
            Self::CircuitBreaker => "circuit_breaker",
        }
    }
}

// ── Handler ─────────────────────────────────────────────────────

/// Classification plus the recovery decided for it.
#[derive(Debug, Clone)]
pub struct HandledError {
    /// The classified error.
    pub error: TrioError,
    /// The strategy that ran.
    pub strategy: RecoveryStrategy,
    /// Its result.
    pub recovery: RecoveryResult,
}

/// Read-only view of the handler's state.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatisticsSnapshot {
    /// Failure counts per `service:type` key.
    pub error_counts: std::collections::BTreeMap<String, u64>,
    /// Breaker state per key.
    pub circuit_breakers: Vec<BreakerSnapshot>,
    /// Recovery history length.
    pub recovery_history_size: usize,
    /// Jobs handed to the follow-up queue.
    pub queued: u64,
}

/// Classifies failures and selects and runs recovery strategies.
///
/// Holds the shared error counters, circuit breaker state and recovery
/// history; one instance is shared by every coordinator in the process.
#[derive(Debug)]
pub struct ErrorHandler {
    config: RecoveryConfig,
    stats: ErrorStatistics,
    breaker: CircuitBreaker,
    history: RecoveryHistory,
    queued: AtomicU64,
}

impl ErrorHandler {
    /// Handler tuned by `config`.
    pub fn new(config: RecoveryConfig) -> Self {
        let reset_window =
            chrono::Duration::from_std(Duration::from_secs(config.circuit_reset_secs))
                .unwrap_or_else(|_| chrono::Duration::weeks(52));
        Self {
            stats: ErrorStatistics::new(config.stats_reset_probability),
            breaker: CircuitBreaker::new(config.circuit_threshold, reset_window),
            history: RecoveryHistory::new(config.history_limit, config.history_trim_to),
            queued: AtomicU64::new(0),
            config,
        }
    }

    /// Classify `err`, choose a strategy, run it and log the decision.
    pub fn handle(
        &self,
        err: &(dyn std::error::Error + 'static),
        context: RecoveryContext,
    ) -> HandledError {
        self.handle_classified(classify_error(err), context, Utc::now())
    }

    /// Same as [`ErrorHandler::handle`] for an already classified error at `now`.
    pub fn handle_classified(
        &self,
        error: TrioError,
        context: RecoveryContext,
        now: DateTime<Utc>,
    ) -> HandledError {
        let count = self.stats.record(&error.key());
        let strategy = self.select_strategy(&error, count);
        let recovery = self.execute(strategy, &error, now);

        info!(
            error_type = %error.error_type,
            service = error.service.as_str(),
            strategy = strategy.name(),
            action = recovery.action.as_str(),
            success = recovery.success,
            count,
            "recovery decided"
        );

        self.history.push(RecoveryRecord {
            timestamp: now,
            error: error.clone(),
            recovery: recovery.clone(),
            context,
        });

        HandledError {
            error,
            strategy,
            recovery,
        }
    }

    /// Pick a strategy for `error` whose key has failed `count` times.
    pub fn select_strategy(&self, error: &TrioError, count: u64) -> RecoveryStrategy {
        if count >= self.config.escalation_threshold {
            return RecoveryStrategy::CircuitBreaker;
        }

        match error.error_type {
            ErrorType::EmailService if error.severity == Severity::High => RecoveryStrategy::Queue,
            ErrorType::EmailService => RecoveryStrategy::Retry {
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
            },
            ErrorType::Database if error.severity == Severity::Critical => {
                RecoveryStrategy::Queue
            }
            ErrorType::Database => RecoveryStrategy::Retry {
                max_attempts: 2,
                base_delay: Duration::from_secs(1),
            },
            ErrorType::Websocket => RecoveryStrategy::DeferredRetry {
                delay: Duration::from_secs(self.config.deferred_retry_secs),
            },
            ErrorType::Validation | ErrorType::Auth => RecoveryStrategy::LogOnly,
            ErrorType::System if error.recoverable => RecoveryStrategy::Retry {
                max_attempts: 2,
                base_delay: Duration::from_secs(5),
            },
            ErrorType::System => RecoveryStrategy::LogOnly,
        }
    }

    /// Run `strategy` for `error` at `now`.
    pub fn execute(
        &self,
        strategy: RecoveryStrategy,
        error: &TrioError,
        now: DateTime<Utc>,
    ) -> RecoveryResult {
        match strategy {
            RecoveryStrategy::Retry {
                max_attempts,
                base_delay,
            } => {
                info!(error_type = %error.error_type, max_attempts, "retry scheduled");
                RecoveryResult::new(
                    true,
                    RecoveryAction::RetryScheduled,
                    format!("retry scheduled with up to {max_attempts} attempts"),
                )
                .retry_after(base_delay)
                .with_metadata(json!({
                    "maxAttempts": max_attempts,
                    "backoff": "exponential",
                }))
            }
            RecoveryStrategy::Queue => {
                // No durable queue behind this yet; the job id is for correlation only.
                let position = self.queued.fetch_add(1, Ordering::Relaxed).saturating_add(1);
                let job_id = Uuid::new_v4();
                info!(error_type = %error.error_type, %job_id, position, "queued for follow-up");
                RecoveryResult::new(true, RecoveryAction::Queued, "queued for follow-up")
                    .with_metadata(json!({
                        "jobId": job_id,
                        "queuePosition": position,
                    }))
            }
            RecoveryStrategy::DeferredRetry { delay } => {
                let scheduled_for = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(now);
                info!(error_type = %error.error_type, %scheduled_for, "deferred retry scheduled");
                RecoveryResult::new(
                    true,
                    RecoveryAction::DeferredRetryScheduled,
                    "background retry scheduled",
                )
                .retry_after(delay)
                .with_metadata(json!({ "scheduledFor": scheduled_for }))
            }
            RecoveryStrategy::LogOnly => {
                error!(
                    error_type = %error.error_type,
                    message = %error.message,
                    "non-recoverable error, no recovery attempted"
                );
                RecoveryResult::new(
                    false,
                    RecoveryAction::Logged,
                    "non-recoverable error logged",
                )
            }
            RecoveryStrategy::CircuitBreaker => self.consult_breaker(error, now),
        }
    }

    fn consult_breaker(&self, error: &TrioError, now: DateTime<Utc>) -> RecoveryResult {
        let key = error.key();
        match self.breaker.record_failure(&key, now) {
            CircuitDecision::Reset => {
                info!(key = %key, "circuit reset");
                RecoveryResult::new(true, RecoveryAction::CircuitReset, "circuit breaker reset")
                    .with_metadata(json!({ "failures": 1 }))
            }
            CircuitDecision::Recording { failures } => {
                RecoveryResult::new(
                    true,
                    RecoveryAction::CircuitRecording,
                    format!(
                        "failure {failures} of {} recorded",
                        self.config.circuit_threshold
                    ),
                )
                .with_metadata(json!({ "failures": failures }))
            }
            CircuitDecision::Open { failures } => {
                warn!(key = %key, failures, "circuit open, recovery blocked");
                let window = self.breaker.reset_window().to_std().unwrap_or_default();
                RecoveryResult::new(
                    false,
                    RecoveryAction::CircuitOpen,
                    format!("circuit open after {failures} failures"),
                )
                .retry_after(window)
                .with_metadata(json!({ "failures": failures }))
            }
        }
    }

    /// Counters, breakers and history size.
    pub fn error_statistics(&self) -> ErrorStatisticsSnapshot {
        ErrorStatisticsSnapshot {
            error_counts: self.stats.snapshot(),
            circuit_breakers: self.breaker.snapshot(Utc::now()),
            recovery_history_size: self.history.len(),
            queued: self.queued.load(Ordering::Relaxed),
        }
    }

    /// Up to `limit` most recent recovery decisions, oldest first.
    pub fn recovery_history(&self, limit: usize) -> Vec<RecoveryRecord> {
        self.history.recent(limit)
    }

    /// The circuit breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Clear counters, breakers and history.
    pub fn reset(&self) {
        self.stats.reset();
        self.breaker.reset();
        self.history.reset();
        self.queued.store(0, Ordering::Relaxed);
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}
