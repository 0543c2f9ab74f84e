//! Channel executors: email send, message persistence and socket fan-out.
//!
//! Each executor wraps its collaborator call in [`with_timeout_and_retry`]
//! and, once the effect happened, registers an operation with a
//! channel-appropriate compensating action on the attempt's ledger.

pub mod email;
pub mod message;
pub mod socket;

use std::fmt::Display;
use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ChannelPolicy;
use crate::ledger::LedgerError;

pub use email::{EmailDirective, EmailExecutor, EmailSender, EmailTemplate};
pub use message::{MessageExecutor, MessageStore, NewMessage, StoredMessage};
pub use socket::{PushChannel, SocketExecutor, SocketOutcome};

/// Delivery priority shared by the email and message directives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background information.
    Low,
    /// Regular notifications.
    #[default]
    Medium,
    /// Needs attention soon.
    High,
}

impl Priority {
    /// Lowercase tag stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Failures raised by a channel step.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The email template identifier or its data was rejected. Never retried.
    #[error(transparent)]
    InvalidTemplate(#[from] email::TemplateError),

    /// Every email attempt failed or timed out.
    #[error("Email failed after {attempts} attempts: {last_error}")]
    EmailExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },

    /// Every message write failed or timed out.
    #[error("Message database write failed after {attempts} attempts: {last_error}")]
    MessageExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },

    /// No recipient received the socket push.
    #[error("Socket emit failed for all {recipients} recipients: {last_error}")]
    SocketAllFailed {
        /// Number of recipients attempted.
        recipients: usize,
        /// Error from the last failing recipient.
        last_error: String,
    },

    /// The ledger refused the operation.
    #[error("transaction error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Retries were exhausted without a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted {
    /// Attempts made.
    pub attempts: u32,
    /// Error from the final attempt.
    pub last_error: String,
}

/// Run `op` with a hard per-attempt timeout and exponential backoff.
///
/// Attempt `n` (1-based) that fails or times out is followed by a sleep of
/// `base_delay * 2^(n-1)` unless it was the last one. A timeout counts as a
/// failed attempt.
///
/// # Errors
///
/// Returns [`Exhausted`] with the last error once `policy.retries` attempts failed.
pub async fn with_timeout_and_retry<T, E, F, Fut>(
    channel: &'static str,
    policy: ChannelPolicy,
    mut op: F,
) -> Result<T, Exhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match tokio::time::timeout(policy.timeout(), op(attempt)).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(channel, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("{channel} timeout after {}ms", policy.timeout_ms),
        }

        warn!(channel, attempt, max_attempts, error = %last_error, "attempt failed");
        if attempt < max_attempts {
            tokio::time::sleep(policy.backoff(attempt)).await;
        }
    }

    Err(Exhausted {
        attempts: max_attempts,
        last_error,
    })
}
