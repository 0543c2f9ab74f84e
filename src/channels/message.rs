//! Message channel: the persisted in-app message that anchors a trio.
//!
//! The message and its recipient rows are written in one atomic operation.
//! Rollback flips the record to inactive instead of deleting it so the
//! audit trail survives.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, instrument, trace};
use uuid::Uuid;

use super::{with_timeout_and_retry, ChannelError, Priority};
use crate::config::ChannelPolicy;
use crate::ledger::{Channel, Ledger, NewOperation};

/// Schema applied by [`SqliteMessageStore::init`].
const SCHEMA: &str = include_str!("../../migrations/001_messages.sql");

// ── Types ───────────────────────────────────────────────────────

/// Kind of in-app message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// General announcement.
    #[default]
    Announcement,
    /// Upcoming event reminder.
    Reminder,
    /// Something changed.
    Update,
    /// Requires attention.
    Warning,
    /// Platform-generated notice.
    System,
}

impl MessageType {
    /// Returns the SQLite-stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Announcement => "announcement",
            Self::Reminder => "reminder",
            Self::Update => "update",
            Self::Warning => "warning",
            Self::System => "system",
        }
    }
}

/// Who a persisted message is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creator {
    /// User identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Role shown next to the name.
    #[serde(default)]
    pub role: Option<String>,
}

/// Everything the store needs to persist one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Headline.
    pub title: String,
    /// Body text.
    pub content: String,
    /// Message kind.
    pub message_type: MessageType,
    /// Priority.
    pub priority: Priority,
    /// Hide the creator from recipients.
    pub hide_creator: bool,
    /// Recipient user ids.
    pub recipients: Vec<String>,
    /// Attribution.
    pub creator: Option<Creator>,
}

/// Handle to a persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Message identifier.
    pub id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Message store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Creator attribution could not be encoded.
    #[error("database encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// No message with this id exists.
    #[error("message not found: {0}")]
    NotFound(String),
}

/// Durable message collaborator.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist the message and its recipients atomically.
    async fn create(&self, message: &NewMessage) -> Result<StoredMessage, StoreError>;

    /// Mark a message inactive.
    async fn deactivate(&self, id: &str) -> Result<(), StoreError>;
}

// ── Executor ────────────────────────────────────────────────────

/// Runs the message step of a trio.
pub struct MessageExecutor {
    store: Arc<dyn MessageStore>,
}

impl MessageExecutor {
    /// Wrap a message store.
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Persist the message with timeout and retry and register its deactivation.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::MessageExhausted`] once retries run out.
    #[instrument(skip_all, fields(trio_id = %ledger.id(), recipients = message.recipients.len()))]
    pub async fn execute(
        &self,
        message: &NewMessage,
        policy: ChannelPolicy,
        ledger: &mut Ledger,
    ) -> Result<StoredMessage, ChannelError> {
        let store = self.store.as_ref();
        let stored = with_timeout_and_retry("message", policy, move |_| store.create(message))
            .await
            .map_err(|e| ChannelError::MessageExhausted {
                attempts: e.attempts,
                last_error: e.last_error,
            })?;

        let store = Arc::clone(&self.store);
        let id = stored.id.clone();
        ledger.add_operation(
            Channel::Message,
            NewOperation::new(stored.id.clone(), move || async move {
                store.deactivate(&id).await.map_err(|e| e.to_string())
            })
            .with_metadata(serde_json::json!({
                "title": message.title,
                "recipients": message.recipients.len(),
            })),
        )?;
        info!(message_id = %stored.id, "message persisted");
        Ok(stored)
    }
}

// ── SQLite store ────────────────────────────────────────────────

/// A persisted message row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Message identifier.
    pub id: String,
    /// Headline.
    pub title: String,
    /// Whether the message is still visible.
    pub is_active: bool,
    /// Recipient user ids, sorted.
    pub recipients: Vec<String>,
}

/// [`MessageStore`] backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the file cannot be opened or migrated.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// Apply the schema to an existing pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the schema cannot be applied.
    pub async fn init(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Load a message with its recipients.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn get(&self, id: &str) -> Result<Option<MessageRecord>, StoreError> {
        let row: Option<(String, String, i64)> =
            sqlx::query_as("SELECT id, title, is_active FROM system_messages WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        let Some((id, title, is_active)) = row else {
            return Ok(None);
        };

        let recipients: Vec<(String,)> = sqlx::query_as(
            "SELECT user_id FROM message_recipients WHERE message_id = ?1 ORDER BY user_id",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(MessageRecord {
            id,
            title,
            is_active: is_active != 0,
            recipients: recipients.into_iter().map(|(user,)| user).collect(),
        }))
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn create(&self, message: &NewMessage) -> Result<StoredMessage, StoreError> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let creator_json = message
            .creator
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO system_messages \
             (id, title, content, message_type, priority, hide_creator, creator_id, creator_json, is_active, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)",
        )
        .bind(&id)
        .bind(&message.title)
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .bind(message.priority.as_str())
        .bind(message.hide_creator)
        .bind(message.creator.as_ref().map(|c| c.id.as_str()))
        .bind(creator_json)
        .bind(created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for user in &message.recipients {
            sqlx::query(
                "INSERT OR IGNORE INTO message_recipients (message_id, user_id) VALUES (?1, ?2)",
            )
            .bind(&id)
            .bind(user)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        trace!(message_id = %id, recipients = message.recipients.len(), "message row written");
        Ok(StoredMessage { id, created_at })
    }

    async fn deactivate(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE system_messages SET is_active = 0, deactivated_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_owned()));
        }
        Ok(())
    }
}
