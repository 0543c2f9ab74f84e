//! Request parsing, convenience builders and the result's JSON shape.

use serde_json::json;
use trio::channels::email::{EventReminderEmail, NewLeaderSignupEmail};
use trio::channels::message::{Creator, MessageType};
use trio::channels::{EmailTemplate, Priority};
use trio::coordinator::TrioOptions;
use trio::TrioRequest;

use super::fakes::healthy;

#[test]
fn parses_camel_case_request() {
    let request: TrioRequest = serde_json::from_value(json!({
        "email": { "to": "a@x.com", "template": "welcome", "data": { "name": "A" } },
        "systemMessage": { "title": "Welcome", "content": "Hi", "type": "reminder", "hideCreator": true },
        "recipients": ["u1"],
        "options": { "enableRollback": false, "timeoutMs": 250 }
    }))
    .expect("request should parse");

    assert_eq!(request.message.message_type, MessageType::Reminder);
    assert_eq!(request.message.priority, Priority::Medium);
    assert!(request.message.hide_creator);
    assert_eq!(
        request.options,
        TrioOptions {
            enable_rollback: Some(false),
            timeout_ms: Some(250),
            retries: None,
        }
    );
    let email = request.email.expect("email directive");
    assert_eq!(email.template, "welcome");
}

#[test]
fn message_key_is_accepted_as_alias() {
    let request: TrioRequest = serde_json::from_value(json!({
        "message": { "title": "T", "content": "C" },
        "recipients": []
    }))
    .expect("alias should parse");
    assert!(request.email.is_none());
    assert_eq!(request.message.title, "T");
    assert_eq!(request.options, TrioOptions::default());
}

#[test]
fn welcome_builder_targets_the_new_user() {
    let request = TrioRequest::welcome("a@x.com", "u1", "Ada");
    assert_eq!(request.recipients, vec!["u1"]);
    assert_eq!(request.message.message_type, MessageType::System);
    let email = request.email.expect("welcome sends email");
    assert_eq!(email.to, "a@x.com");
    let template = EmailTemplate::from_parts(&email.template, email.data).expect("valid data");
    assert_eq!(template.id(), "welcome");
}

#[test]
fn reminder_builder_is_high_priority() {
    let request = TrioRequest::event_reminder(
        "a@x.com",
        "u1",
        EventReminderEmail {
            name: "Ada".to_owned(),
            event_title: "Cleanup".to_owned(),
            event_date: "Saturday".to_owned(),
            event_location: None,
            hours_until: Some(24),
        },
    );
    assert_eq!(request.message.priority, Priority::High);
    assert_eq!(request.message.message_type, MessageType::Reminder);
    assert!(request.message.content.contains("Cleanup"));
    let email = request.email.expect("reminder sends email");
    assert_eq!(email.data["hoursUntil"], 24);
}

#[test]
fn leader_signup_builder_notifies_every_organizer() {
    let request = TrioRequest::new_leader_signup(
        "org@x.com",
        vec!["o1".to_owned(), "o2".to_owned()],
        NewLeaderSignupEmail {
            leader_name: "Lee".to_owned(),
            event_title: "Cleanup".to_owned(),
            role_name: "Captain".to_owned(),
        },
    );
    assert_eq!(request.recipients.len(), 2);
    assert!(request.message.content.contains("Lee"));
}

#[test]
fn co_organizer_builder_attributes_the_assigner() {
    let assigner = Creator {
        id: "u9".to_owned(),
        name: Some("Sam".to_owned()),
        role: Some("organizer".to_owned()),
    };
    let request = TrioRequest::co_organizer_assigned(
        "a@x.com",
        "u1",
        trio::channels::email::CoOrganizerAssignedEmail {
            name: "Ada".to_owned(),
            event_title: "Cleanup".to_owned(),
            assigned_by: "Sam".to_owned(),
        },
        Some(assigner.clone()),
    );
    assert_eq!(request.creator, Some(assigner));
}

#[tokio::test]
async fn result_serializes_in_camel_case() {
    let h = healthy();
    let result = h
        .coordinator
        .create_password_reset_success_trio("a@x.com", "u1", "Ada")
        .await;
    assert!(result.success);

    let value = serde_json::to_value(&result).expect("serialize");
    assert_eq!(value["success"], true);
    assert_eq!(value["notificationsSent"], 1);
    assert_eq!(value["rollbackCompleted"], false);
    assert!(value["metrics"]["totalDurationMs"].is_u64());
    assert_eq!(
        h.email.sent(),
        vec![("a@x.com".to_owned(), "password-reset-success")]
    );
}
