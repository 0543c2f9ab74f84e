//! End-to-end trio attempts against scripted collaborators.

use serde_json::json;
use trio::channels::EmailDirective;
use trio::coordinator::{MessageDirective, TrioOptions};
use trio::ledger::TransactionStatus;
use trio::recovery::RecoveryAction;
use trio::TrioRequest;

use super::fakes::{harness, healthy, FakeEmail, FakePush, FakeStore};

fn welcome_request(recipients: &[&str]) -> TrioRequest {
    TrioRequest::new(
        MessageDirective::new("Welcome", "Hi"),
        recipients.iter().map(|r| (*r).to_owned()).collect(),
    )
    .with_email(EmailDirective {
        to: "a@x.com".to_owned(),
        template: "welcome".to_owned(),
        data: json!({ "name": "A" }),
        priority: Default::default(),
    })
}

#[tokio::test(start_paused = true)]
async fn all_channels_succeed() {
    let h = healthy();

    let result = h.coordinator.create_trio(welcome_request(&["u1"])).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.notifications_sent, 1);
    assert_eq!(result.email_id.as_deref(), Some("email-1"));
    assert_eq!(result.message_id.as_deref(), Some("msg-1"));
    assert!(result.error.is_none());
    assert!(result.recovery.is_none());
    assert!(result.metrics.email_ms.is_some());
    assert!(result.metrics.message_ms.is_some());
    assert!(result.metrics.socket_ms.is_some());

    assert_eq!(h.email.sent(), vec![("a@x.com".to_owned(), "welcome")]);
    assert!(h.store.saved()[0].active);

    let metrics = h.coordinator.metrics();
    assert_eq!(metrics.total_attempts, 1);
    assert_eq!(metrics.successes, 1);
    assert_eq!(
        h.coordinator.ledgers().history(1)[0].status,
        TransactionStatus::Committed
    );
}

#[tokio::test(start_paused = true)]
async fn email_exhaustion_fails_the_attempt() {
    let h = harness(FakeEmail::failing(), FakeStore::default(), FakePush::default());

    let result = h.coordinator.create_trio(welcome_request(&["u1"])).await;

    assert!(!result.success);
    let error = result.error.as_deref().expect("error text");
    assert!(error.contains("Email failed after"), "{error}");
    assert!(result.rollback_completed);
    assert_eq!(h.email.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    assert!(h.store.saved().is_empty());
    assert!(h.push.pushed().is_empty());
    assert!(result.metrics.message_ms.is_none());

    let recovery = result.recovery.expect("recovery decided");
    assert_eq!(recovery.action, RecoveryAction::RetryScheduled);

    let metrics = h.coordinator.metrics();
    assert_eq!(metrics.failures, 1);
    assert_eq!(metrics.rollbacks, 1);
    assert_eq!(metrics.errors_by_type.get("EMAIL_SERVICE_ERROR"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn one_offline_recipient_is_partial_success() {
    let h = harness(
        FakeEmail::default(),
        FakeStore::default(),
        FakePush::with_offline(&["u2"]),
    );

    let result = h
        .coordinator
        .create_trio(welcome_request(&["u1", "u2", "u3"]))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.notifications_sent, 2);
    let reached: Vec<String> = h.push.pushed().into_iter().map(|(r, _)| r).collect();
    assert_eq!(reached.len(), 2);
    assert!(!reached.contains(&"u2".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn socket_total_failure_rolls_back_the_message() {
    let h = harness(
        FakeEmail::default(),
        FakeStore::default(),
        FakePush::with_offline(&["u1", "u2"]),
    );

    let result = h.coordinator.create_trio(welcome_request(&["u1", "u2"])).await;

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|e| e.contains("Socket emit failed")));
    assert!(result.rollback_completed);
    assert!(result.message_id.is_none());
    let saved = h.store.saved();
    assert_eq!(saved.len(), 1);
    assert!(!saved[0].active, "message should be deactivated");
    assert_eq!(
        result.recovery.map(|r| r.action),
        Some(RecoveryAction::DeferredRetryScheduled)
    );
}

#[tokio::test(start_paused = true)]
async fn message_failure_stops_before_push() {
    let store = FakeStore {
        failing_create: true,
        ..FakeStore::default()
    };
    let h = harness(FakeEmail::default(), store, FakePush::default());

    let result = h.coordinator.create_trio(welcome_request(&["u1"])).await;

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|e| e.contains("database")));
    assert_eq!(h.store.creates.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert!(h.push.pushed().is_empty());
    assert!(result.metrics.socket_ms.is_none());
    // The sent email is only marked, never recalled.
    assert_eq!(h.email.sent().len(), 1);
    assert!(result.rollback_completed);
    assert_eq!(
        h.coordinator.metrics().errors_by_type.get("DATABASE_ERROR"),
        Some(&1)
    );
}

#[tokio::test(start_paused = true)]
async fn failing_compensation_reports_incomplete_rollback() {
    let store = FakeStore {
        failing_deactivate: true,
        ..FakeStore::default()
    };
    let h = harness(
        FakeEmail::default(),
        store,
        FakePush::with_offline(&["u1"]),
    );

    let result = h.coordinator.create_trio(welcome_request(&["u1"])).await;

    assert!(!result.success);
    assert!(!result.rollback_completed);
    assert_eq!(result.message_id.as_deref(), Some("msg-1"));
    let summary = &h.coordinator.ledgers().history(1)[0];
    assert_eq!(summary.status, TransactionStatus::RolledBack);
    assert!(summary
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("partial rollback failure")));
}

#[tokio::test(start_paused = true)]
async fn rollback_can_be_disabled_per_call() {
    let h = harness(
        FakeEmail::default(),
        FakeStore::default(),
        FakePush::with_offline(&["u1"]),
    );
    let request = welcome_request(&["u1"]).with_options(TrioOptions {
        enable_rollback: Some(false),
        ..TrioOptions::default()
    });

    let result = h.coordinator.create_trio(request).await;

    assert!(!result.success);
    assert!(!result.rollback_completed);
    assert!(h.store.saved()[0].active, "message must stay active");
    assert_eq!(result.message_id.as_deref(), Some("msg-1"));
    assert_eq!(h.coordinator.metrics().rollbacks, 0);
    assert_eq!(
        h.coordinator.ledgers().history(1)[0].status,
        TransactionStatus::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn retries_override_applies_to_every_channel() {
    let h = harness(FakeEmail::failing(), FakeStore::default(), FakePush::default());
    let request = welcome_request(&["u1"]).with_options(TrioOptions {
        retries: Some(1),
        ..TrioOptions::default()
    });

    let result = h.coordinator.create_trio(request).await;

    assert!(result
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("Email failed after 1 attempts")));
    assert_eq!(h.email.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_template_is_logged_not_retried() {
    let h = healthy();
    let mut request = welcome_request(&["u1"]);
    if let Some(email) = request.email.as_mut() {
        email.template = "farewell".to_owned();
    }

    let result = h.coordinator.create_trio(request).await;

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|e| e.contains("unknown template identifier 'farewell'")));
    assert_eq!(h.email.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(h.store.saved().is_empty());
    let recovery = result.recovery.expect("recovery decided");
    assert_eq!(recovery.action, RecoveryAction::Logged);
    assert!(!recovery.success);
}

#[tokio::test]
async fn unknown_template_with_channel_words_is_still_a_caller_error() {
    let h = healthy();
    let mut request = welcome_request(&["u1"]);
    if let Some(email) = request.email.as_mut() {
        email.template = "email-verification".to_owned();
    }

    let result = h.coordinator.create_trio(request).await;

    assert!(!result.success);
    let recovery = result.recovery.expect("recovery decided");
    assert_eq!(recovery.action, RecoveryAction::Logged);
    assert!(!recovery.success);
    assert_eq!(h.email.calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    let metrics = h.coordinator.metrics();
    assert_eq!(metrics.errors_by_type.get("VALIDATION_ERROR"), Some(&1));
    assert!(!metrics.errors_by_type.contains_key("EMAIL_SERVICE_ERROR"));
    let stats = h.coordinator.error_handler().error_statistics();
    assert_eq!(stats.error_counts.get("system:VALIDATION_ERROR"), Some(&1));
    assert!(!stats.error_counts.contains_key("email:EMAIL_SERVICE_ERROR"));
}

#[tokio::test]
async fn request_without_email_skips_the_email_step() {
    let h = healthy();
    let request = TrioRequest::new(MessageDirective::new("Notice", "Body"), vec!["u1".to_owned()]);

    let result = h.coordinator.create_trio(request).await;

    assert!(result.success);
    assert!(result.email_id.is_none());
    assert!(result.metrics.email_ms.is_none());
    assert_eq!(h.email.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn push_payload_describes_the_message() {
    let h = healthy();
    let mut request = welcome_request(&["u1"]).with_creator(trio::channels::message::Creator {
        id: "admin-1".to_owned(),
        name: Some("Admin".to_owned()),
        role: None,
    });
    request.message.hide_creator = true;

    let result = h.coordinator.create_trio(request).await;
    assert!(result.success);

    let pushed = h.push.pushed();
    let payload = &pushed[0].1;
    assert_eq!(payload["messageId"], "msg-1");
    assert_eq!(payload["title"], "Welcome");
    assert_eq!(payload["type"], "announcement");
    assert_eq!(payload["priority"], "medium");
    assert_eq!(payload["hideCreator"], true);
    assert!(payload["creator"].is_null());
    assert!(payload["createdAt"].is_string());
}
