//! Socket channel: real-time push fan-out to connected recipients.
//!
//! Every recipient gets its own timeout and retry loop, and all recipients
//! are pushed concurrently. Individual failures are collected; the step
//! only fails when recipients were given and none of them was reached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::{with_timeout_and_retry, ChannelError};
use crate::config::ChannelPolicy;
use crate::ledger::{Channel, Ledger, NewOperation};
use crate::lock;

/// Event name used for message pushes.
pub const MESSAGE_CREATED_EVENT: &str = "message_created";

/// Buffered events per connected recipient in [`BroadcastPushChannel`].
const HUB_CAPACITY: usize = 64;

/// Push errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The recipient has no live connection.
    #[error("socket recipient {0} is not connected")]
    NotConnected(String),

    /// The transport rejected the push.
    #[error("socket push failed: {0}")]
    Failed(String),
}

/// Real-time push collaborator.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Push `payload` as `event` to one recipient.
    async fn push(
        &self,
        recipient: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), PushError>;
}

/// A recipient the push never reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientFailure {
    /// Recipient id.
    pub recipient: String,
    /// Last error seen for this recipient.
    pub error: String,
}

/// Per-recipient outcome of the socket step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketOutcome {
    /// Recipients that received the push, in request order.
    pub sent: Vec<String>,
    /// Recipients that did not.
    pub failed: Vec<RecipientFailure>,
}

// ── Executor ────────────────────────────────────────────────────

/// Runs the socket step of a trio.
pub struct SocketExecutor {
    channel: Arc<dyn PushChannel>,
}

impl SocketExecutor {
    /// Wrap a push channel.
    pub fn new(channel: Arc<dyn PushChannel>) -> Self {
        Self { channel }
    }

    /// Push `payload` to every recipient and register the fan-out.
    ///
    /// The push is ephemeral, so the registered compensation does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SocketAllFailed`] when `recipients` is
    /// non-empty and no push succeeded.
    #[instrument(skip_all, fields(trio_id = %ledger.id(), recipients = recipients.len()))]
    pub async fn execute(
        &self,
        recipients: &[String],
        event: &'static str,
        payload: serde_json::Value,
        policy: ChannelPolicy,
        ledger: &mut Ledger,
    ) -> Result<SocketOutcome, ChannelError> {
        let payload = Arc::new(payload);
        let mut tasks = JoinSet::new();
        for (index, recipient) in recipients.iter().cloned().enumerate() {
            let channel = Arc::clone(&self.channel);
            let payload = Arc::clone(&payload);
            tasks.spawn(async move {
                let push = channel.as_ref();
                let to = recipient.as_str();
                let body = payload.as_ref();
                let result =
                    with_timeout_and_retry("socket", policy, move |_| push.push(to, event, body))
                        .await;
                (index, recipient, result)
            });
        }

        let mut results = Vec::with_capacity(recipients.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => warn!(error = %e, "socket push task aborted"),
            }
        }
        results.sort_by_key(|(index, _, _)| *index);

        let mut outcome = SocketOutcome::default();
        let mut reached = vec![false; recipients.len()];
        for (index, recipient, result) in results {
            match result {
                Ok(()) => {
                    if let Some(slot) = reached.get_mut(index) {
                        *slot = true;
                    }
                    outcome.sent.push(recipient);
                }
                Err(e) => outcome.failed.push(RecipientFailure {
                    recipient,
                    error: e.last_error,
                }),
            }
        }
        // Recipients whose task panicked never reported back.
        for (recipient, _) in recipients.iter().zip(&reached).filter(|(_, hit)| !**hit) {
            if !outcome.failed.iter().any(|f| &f.recipient == recipient) {
                outcome.failed.push(RecipientFailure {
                    recipient: recipient.clone(),
                    error: "push task aborted".to_owned(),
                });
            }
        }

        if !recipients.is_empty() && outcome.sent.is_empty() {
            let last_error = outcome
                .failed
                .last()
                .map(|f| f.error.clone())
                .unwrap_or_default();
            return Err(ChannelError::SocketAllFailed {
                recipients: recipients.len(),
                last_error,
            });
        }

        if !outcome.failed.is_empty() {
            warn!(
                sent = outcome.sent.len(),
                failed = outcome.failed.len(),
                "socket push partially failed"
            );
        }

        ledger.add_operation(
            Channel::Socket,
            NewOperation::irreversible(format!("{event}:{}", ledger.id())).with_metadata(
                serde_json::json!({
                    "sent": outcome.sent.len(),
                    "failed": outcome.failed.len(),
                }),
            ),
        )?;
        info!(sent = outcome.sent.len(), "socket push complete");
        Ok(outcome)
    }
}

// ── In-process hub ──────────────────────────────────────────────

/// An event delivered through [`BroadcastPushChannel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: serde_json::Value,
}

/// In-process push hub: one broadcast channel per connected recipient.
///
/// A recipient is connected while at least one receiver returned by
/// [`BroadcastPushChannel::subscribe`] is alive.
#[derive(Debug, Default)]
pub struct BroadcastPushChannel {
    senders: Mutex<HashMap<String, broadcast::Sender<PushEvent>>>,
}

impl BroadcastPushChannel {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a recipient and return its event stream.
    pub fn subscribe(&self, recipient: &str) -> broadcast::Receiver<PushEvent> {
        let mut senders = lock(&self.senders);
        senders.retain(|_, tx| tx.receiver_count() > 0);
        match senders.get(recipient) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(HUB_CAPACITY);
                senders.insert(recipient.to_owned(), tx);
                rx
            }
        }
    }

    /// Number of recipients with at least one live receiver.
    pub fn connected(&self) -> usize {
        lock(&self.senders)
            .values()
            .filter(|tx| tx.receiver_count() > 0)
            .count()
    }

    /// Drop `recipient`'s sender once its last receiver is gone.
    fn forget(&self, recipient: &str) {
        let mut senders = lock(&self.senders);
        if senders
            .get(recipient)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            senders.remove(recipient);
            debug!(recipient, "disconnected recipient forgotten");
        }
    }
}

#[async_trait]
impl PushChannel for BroadcastPushChannel {
    async fn push(
        &self,
        recipient: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), PushError> {
        let tx = lock(&self.senders).get(recipient).cloned();
        let Some(tx) = tx else {
            return Err(PushError::NotConnected(recipient.to_owned()));
        };

        tx.send(PushEvent {
            event: event.to_owned(),
            payload: payload.clone(),
        })
        .map_err(|_| {
            self.forget(recipient);
            PushError::NotConnected(recipient.to_owned())
        })?;
        debug!(recipient, event, "pushed");
        Ok(())
    }
}
