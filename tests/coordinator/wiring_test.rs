//! Trio attempts against the collaborators the `trio` binary wires up:
//! SQLite message store, in-process broadcast hub and the log-only sender.

use std::path::PathBuf;
use std::sync::Arc;

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;

use trio::channels::email::LogEmailSender;
use trio::channels::message::SqliteMessageStore;
use trio::channels::socket::{BroadcastPushChannel, MESSAGE_CREATED_EVENT};
use trio::coordinator::TrioOptions;
use trio::{TrioCoordinator, TrioDeps, TrioRequest};

use super::fakes::config;

struct Wired {
    _tmp: tempfile::TempDir,
    db_path: PathBuf,
    store: Arc<SqliteMessageStore>,
    hub: Arc<BroadcastPushChannel>,
    coordinator: TrioCoordinator,
}

async fn wired() -> Wired {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let db_path = tmp.path().join("messages.db");
    let store = Arc::new(
        SqliteMessageStore::connect(&db_path)
            .await
            .expect("should open database"),
    );
    let hub = Arc::new(BroadcastPushChannel::new());
    let coordinator = TrioCoordinator::new(
        TrioDeps {
            email: Arc::new(LogEmailSender),
            messages: store.clone(),
            push: hub.clone(),
        },
        &config(),
    );
    Wired {
        _tmp: tmp,
        db_path,
        store,
        hub,
        coordinator,
    }
}

#[tokio::test]
async fn welcome_trio_persists_and_pushes() {
    let w = wired().await;
    let mut rx = w.hub.subscribe("u1");

    let result = w
        .coordinator
        .create_welcome_trio("ada@x.com", "u1", "Ada")
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.notifications_sent, 1);
    assert!(result
        .email_id
        .as_deref()
        .is_some_and(|id| id.starts_with("log-")));
    let message_id = result.message_id.expect("message persisted");

    let record = w
        .store
        .get(&message_id)
        .await
        .expect("query")
        .expect("row exists");
    assert!(record.is_active);
    assert_eq!(record.recipients, vec!["u1"]);

    let event = rx.recv().await.expect("push delivered");
    assert_eq!(event.event, MESSAGE_CREATED_EVENT);
    assert_eq!(event.payload["messageId"], message_id.as_str());
}

#[tokio::test]
async fn nobody_connected_deactivates_the_row() {
    let w = wired().await;
    let request = TrioRequest::welcome("ada@x.com", "u1", "Ada").with_options(TrioOptions {
        retries: Some(1),
        ..TrioOptions::default()
    });

    let result = w.coordinator.create_trio(request).await;

    assert!(!result.success);
    assert!(result.rollback_completed);
    assert!(result.message_id.is_none());

    let pool = SqlitePool::connect_with(SqliteConnectOptions::new().filename(&w.db_path))
        .await
        .expect("second connection");
    let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM system_messages")
        .fetch_all(&pool)
        .await
        .expect("list messages");
    assert_eq!(ids.len(), 1, "row kept for audit");
    let record = w
        .store
        .get(&ids[0].0)
        .await
        .expect("query")
        .expect("row exists");
    assert!(!record.is_active);
}
