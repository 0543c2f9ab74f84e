//! Tests for keyword classification of channel failures.

use trio::channels::email::TemplateError;
use trio::channels::ChannelError;
use trio::recovery::classify::{classify, classify_error, ErrorService, ErrorType, Severity};

#[test]
fn email_exhaustion_is_an_email_service_error() {
    let err = ChannelError::EmailExhausted {
        attempts: 3,
        last_error: "provider returned 503".to_owned(),
    };
    let classified = classify_error(&err);
    assert_eq!(classified.error_type, ErrorType::EmailService);
    assert_eq!(classified.service, ErrorService::Email);
    assert!(classified.recoverable);
    assert_eq!(classified.key(), "email:EMAIL_SERVICE_ERROR");
}

#[test]
fn message_exhaustion_is_a_database_error() {
    let err = ChannelError::MessageExhausted {
        attempts: 2,
        last_error: "disk I/O error".to_owned(),
    };
    let classified = classify_error(&err);
    assert_eq!(classified.error_type, ErrorType::Database);
    assert_eq!(classified.severity, Severity::High);
}

#[test]
fn socket_failure_is_a_websocket_error() {
    let err = ChannelError::SocketAllFailed {
        recipients: 2,
        last_error: "socket recipient u2 is not connected".to_owned(),
    };
    let classified = classify_error(&err);
    assert_eq!(classified.error_type, ErrorType::Websocket);
    assert_eq!(classified.severity, Severity::Low);
}

#[test]
fn unknown_template_is_a_validation_error() {
    let err = ChannelError::from(TemplateError::Unknown("farewell".to_owned()));
    let classified = classify_error(&err);
    assert_eq!(classified.error_type, ErrorType::Validation);
    assert!(!classified.recoverable);
}

#[test]
fn timeout_keyword_wins_before_database() {
    // "timeout" belongs to the email rule, which is checked first.
    let classified = classify("Message database write failed after 2 attempts: message timeout after 5000ms");
    assert_eq!(classified.error_type, ErrorType::EmailService);
}

#[test]
fn matching_ignores_case() {
    assert_eq!(classify("UNAUTHORIZED").error_type, ErrorType::Auth);
    assert_eq!(classify("WebSocket closed").error_type, ErrorType::Websocket);
}

#[test]
fn unmatched_text_falls_back_to_system() {
    let classified = classify("stack overflow");
    assert_eq!(classified.error_type, ErrorType::System);
    assert_eq!(classified.service, ErrorService::System);
    assert!(!classified.recoverable);
}

#[test]
fn serializes_with_type_tag() {
    let classified = classify("smtp relay down").with_code("421");
    let json = serde_json::to_value(&classified).expect("serialize");
    assert_eq!(json["type"], "EMAIL_SERVICE_ERROR");
    assert_eq!(json["service"], "email");
    assert_eq!(json["code"], "421");
    assert!(json.get("metadata").is_none());
}
