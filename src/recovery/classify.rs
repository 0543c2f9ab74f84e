//! Keyword-based error classification.
//!
//! Rules are checked in order and the first match wins: email, database,
//! websocket, validation, auth, then the generic system fallback. Matching
//! is case-insensitive over the error's display text. Failures whose kind
//! is already known, such as a rejected template, skip the keyword scan
//! through [`validation_error`].

use serde::{Deserialize, Serialize};

/// Error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorType {
    /// Email provider or transport failure.
    #[serde(rename = "EMAIL_SERVICE_ERROR")]
    EmailService,
    /// Persistence failure.
    #[serde(rename = "DATABASE_ERROR")]
    Database,
    /// Real-time push failure.
    #[serde(rename = "WEBSOCKET_ERROR")]
    Websocket,
    /// Caller sent invalid input.
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    /// Caller lacks permission.
    #[serde(rename = "AUTH_ERROR")]
    Auth,
    /// Anything else.
    #[serde(rename = "SYSTEM_ERROR")]
    System,
}

impl ErrorType {
    /// Upper-case tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailService => "EMAIL_SERVICE_ERROR",
            Self::Database => "DATABASE_ERROR",
            Self::Websocket => "WEBSOCKET_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::Auth => "AUTH_ERROR",
            Self::System => "SYSTEM_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service the error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorService {
    /// Outbound email.
    Email,
    /// Message store.
    Database,
    /// Real-time push.
    Websocket,
    /// The engine or its caller.
    System,
}

impl ErrorService {
    /// Lowercase tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Database => "database",
            Self::Websocket => "websocket",
            Self::System => "system",
        }
    }
}

/// How bad an error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Cosmetic.
    Low,
    /// Degraded.
    Medium,
    /// Broken.
    High,
    /// Broken and spreading.
    Critical,
}

/// A classified failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrioError {
    /// Category.
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    /// Human-readable message.
    pub message: String,
    /// Originating service.
    pub service: ErrorService,
    /// Severity.
    pub severity: Severity,
    /// Whether a later retry can succeed.
    pub recoverable: bool,
    /// Provider error code, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Extra details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl TrioError {
    /// Counter key shared by error statistics and the circuit breaker.
    pub fn key(&self) -> String {
        format!("{}:{}", self.service.as_str(), self.error_type.as_str())
    }

    /// Attach a provider error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

struct Rule {
    keywords: &'static [&'static str],
    error_type: ErrorType,
    service: ErrorService,
    severity: Severity,
    recoverable: bool,
}

const RULES: [Rule; 5] = [
    Rule {
        keywords: &["email", "smtp", "timeout"],
        error_type: ErrorType::EmailService,
        service: ErrorService::Email,
        severity: Severity::Medium,
        recoverable: true,
    },
    Rule {
        keywords: &["database", "mongodb", "connection"],
        error_type: ErrorType::Database,
        service: ErrorService::Database,
        severity: Severity::High,
        recoverable: true,
    },
    Rule {
        keywords: &["websocket", "socket", "emit"],
        error_type: ErrorType::Websocket,
        service: ErrorService::Websocket,
        severity: Severity::Low,
        recoverable: true,
    },
    Rule {
        keywords: &["validation", "invalid"],
        error_type: ErrorType::Validation,
        service: ErrorService::System,
        severity: Severity::Medium,
        recoverable: false,
    },
    Rule {
        keywords: &["auth", "permission", "unauthorized"],
        error_type: ErrorType::Auth,
        service: ErrorService::System,
        severity: Severity::High,
        recoverable: false,
    },
];

/// Classify an error message.
pub fn classify(message: &str) -> TrioError {
    let lowered = message.to_lowercase();
    let rule = RULES
        .iter()
        .find(|rule| rule.keywords.iter().any(|k| lowered.contains(k)));
    from_rule(rule, message)
}

/// A caller error, whatever words its message contains.
pub fn validation_error(message: &str) -> TrioError {
    let rule = RULES
        .iter()
        .find(|rule| rule.error_type == ErrorType::Validation);
    from_rule(rule, message)
}

fn from_rule(rule: Option<&Rule>, message: &str) -> TrioError {
    let (error_type, service, severity, recoverable) = match rule {
        Some(r) => (r.error_type, r.service, r.severity, r.recoverable),
        None => (
            ErrorType::System,
            ErrorService::System,
            Severity::High,
            false,
        ),
    };

    TrioError {
        error_type,
        message: message.to_owned(),
        service,
        severity,
        recoverable,
        code: None,
        metadata: None,
    }
}

/// Classify any error by its display text.
pub fn classify_error(error: &(dyn std::error::Error + 'static)) -> TrioError {
    classify(&error.to_string())
}
