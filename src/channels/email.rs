//! Email channel: typed templates, the sender collaborator and its executor.
//!
//! Template identifiers form a closed set. Each identifier maps to one data
//! shape, and [`EmailTemplate::from_parts`] rejects anything else before a
//! single send is attempted.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{with_timeout_and_retry, ChannelError, Priority};
use crate::config::{ChannelPolicy, EmailConfig};
use crate::ledger::{Channel, Ledger, NewOperation};

// ── Templates ───────────────────────────────────────────────────

/// Data for the `welcome` template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeEmail {
    /// Recipient display name.
    pub name: String,
}

/// Data for the `password-reset-success` template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordResetSuccessEmail {
    /// Recipient display name.
    pub name: String,
}

/// Data for the `event-created` template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCreatedEmail {
    /// Event title.
    pub event_title: String,
    /// Human-readable event date.
    pub event_date: String,
    /// Venue, if known.
    #[serde(default)]
    pub event_location: Option<String>,
    /// Organizer display name.
    pub organizer_name: String,
}

/// Data for the `co-organizer-assigned` template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoOrganizerAssignedEmail {
    /// Name of the newly assigned co-organizer.
    pub name: String,
    /// Event title.
    pub event_title: String,
    /// Name of whoever made the assignment.
    pub assigned_by: String,
}

/// Data for the `event-reminder` template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventReminderEmail {
    /// Recipient display name.
    pub name: String,
    /// Event title.
    pub event_title: String,
    /// Human-readable event date.
    pub event_date: String,
    /// Venue, if known.
    #[serde(default)]
    pub event_location: Option<String>,
    /// Hours left until the event starts.
    #[serde(default)]
    pub hours_until: Option<u32>,
}

/// Data for the `new-leader-signup` template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLeaderSignupEmail {
    /// Name of the leader who signed up.
    pub leader_name: String,
    /// Event title.
    pub event_title: String,
    /// Role the leader signed up for.
    pub role_name: String,
}

/// The closed set of outbound email templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailTemplate {
    /// New account greeting.
    Welcome(WelcomeEmail),
    /// Password was changed through the reset flow.
    PasswordResetSuccess(PasswordResetSuccessEmail),
    /// An event was published.
    EventCreated(EventCreatedEmail),
    /// Someone became co-organizer of an event.
    CoOrganizerAssigned(CoOrganizerAssignedEmail),
    /// An upcoming event reminder.
    EventReminder(EventReminderEmail),
    /// A leader signed up for an event role.
    NewLeaderSignup(NewLeaderSignupEmail),
}

/// Rejected template identifier or data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// The identifier is not one of the known templates.
    #[error("validation failed: unknown template identifier '{0}'")]
    Unknown(String),

    /// The data does not match the template's shape.
    #[error("validation failed: invalid data for template '{template}': {reason}")]
    InvalidData {
        /// Template identifier.
        template: &'static str,
        /// Deserializer message.
        reason: String,
    },
}

impl EmailTemplate {
    /// Every accepted identifier.
    pub const IDS: [&'static str; 6] = [
        "welcome",
        "password-reset-success",
        "event-created",
        "co-organizer-assigned",
        "event-reminder",
        "new-leader-signup",
    ];

    /// Parse an identifier plus loosely-typed data into a template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] for unknown identifiers or mismatched data.
    pub fn from_parts(id: &str, data: serde_json::Value) -> Result<Self, TemplateError> {
        fn parse<T: serde::de::DeserializeOwned>(
            template: &'static str,
            data: serde_json::Value,
        ) -> Result<T, TemplateError> {
            serde_json::from_value(data).map_err(|e| TemplateError::InvalidData {
                template,
                reason: e.to_string(),
            })
        }

        match id {
            "welcome" => parse(id_of::WELCOME, data).map(Self::Welcome),
            "password-reset-success" => {
                parse(id_of::PASSWORD_RESET_SUCCESS, data).map(Self::PasswordResetSuccess)
            }
            "event-created" => parse(id_of::EVENT_CREATED, data).map(Self::EventCreated),
            "co-organizer-assigned" => {
                parse(id_of::CO_ORGANIZER_ASSIGNED, data).map(Self::CoOrganizerAssigned)
            }
            "event-reminder" => parse(id_of::EVENT_REMINDER, data).map(Self::EventReminder),
            "new-leader-signup" => {
                parse(id_of::NEW_LEADER_SIGNUP, data).map(Self::NewLeaderSignup)
            }
            other => Err(TemplateError::Unknown(other.to_owned())),
        }
    }

    /// Template identifier.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Welcome(_) => id_of::WELCOME,
            Self::PasswordResetSuccess(_) => id_of::PASSWORD_RESET_SUCCESS,
            Self::EventCreated(_) => id_of::EVENT_CREATED,
            Self::CoOrganizerAssigned(_) => id_of::CO_ORGANIZER_ASSIGNED,
            Self::EventReminder(_) => id_of::EVENT_REMINDER,
            Self::NewLeaderSignup(_) => id_of::NEW_LEADER_SIGNUP,
        }
    }

    /// Template data as JSON.
    pub fn data(&self) -> serde_json::Value {
        let value = match self {
            Self::Welcome(d) => serde_json::to_value(d),
            Self::PasswordResetSuccess(d) => serde_json::to_value(d),
            Self::EventCreated(d) => serde_json::to_value(d),
            Self::CoOrganizerAssigned(d) => serde_json::to_value(d),
            Self::EventReminder(d) => serde_json::to_value(d),
            Self::NewLeaderSignup(d) => serde_json::to_value(d),
        };
        // Plain string/option structs always serialize.
        value.unwrap_or_default()
    }

    /// Build a directive that sends this template to `to`.
    pub fn to_directive(&self, to: impl Into<String>) -> EmailDirective {
        EmailDirective {
            to: to.into(),
            template: self.id().to_owned(),
            data: self.data(),
            priority: Priority::default(),
        }
    }
}

mod id_of {
    pub(super) const WELCOME: &str = "welcome";
    pub(super) const PASSWORD_RESET_SUCCESS: &str = "password-reset-success";
    pub(super) const EVENT_CREATED: &str = "event-created";
    pub(super) const CO_ORGANIZER_ASSIGNED: &str = "co-organizer-assigned";
    pub(super) const EVENT_REMINDER: &str = "event-reminder";
    pub(super) const NEW_LEADER_SIGNUP: &str = "new-leader-signup";
}

/// Email part of a trio request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailDirective {
    /// Recipient address.
    pub to: String,
    /// Template identifier, one of [`EmailTemplate::IDS`].
    pub template: String,
    /// Template data.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Delivery priority.
    #[serde(default)]
    pub priority: Priority,
}

// ── Sender ──────────────────────────────────────────────────────

/// Errors raised by an email sender.
#[derive(Debug, Error)]
pub enum EmailError {
    /// Transport-level failure.
    #[error("email transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with a non-success status.
    #[error("email provider returned {status}: {body}")]
    Provider {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The provider accepted the request but the response was unusable.
    #[error("email provider response invalid: {0}")]
    InvalidResponse(String),
}

/// Outbound email collaborator: one send operation per template.
///
/// Each call returns the provider's message identifier.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Send the `welcome` email.
    async fn send_welcome(&self, to: &str, data: &WelcomeEmail) -> Result<String, EmailError>;

    /// Send the `password-reset-success` email.
    async fn send_password_reset_success(
        &self,
        to: &str,
        data: &PasswordResetSuccessEmail,
    ) -> Result<String, EmailError>;

    /// Send the `event-created` email.
    async fn send_event_created(
        &self,
        to: &str,
        data: &EventCreatedEmail,
    ) -> Result<String, EmailError>;

    /// Send the `co-organizer-assigned` email.
    async fn send_co_organizer_assigned(
        &self,
        to: &str,
        data: &CoOrganizerAssignedEmail,
    ) -> Result<String, EmailError>;

    /// Send the `event-reminder` email.
    async fn send_event_reminder(
        &self,
        to: &str,
        data: &EventReminderEmail,
    ) -> Result<String, EmailError>;

    /// Send the `new-leader-signup` email.
    async fn send_new_leader_signup(
        &self,
        to: &str,
        data: &NewLeaderSignupEmail,
    ) -> Result<String, EmailError>;
}

/// Route a parsed template to the matching sender operation.
pub async fn dispatch(
    sender: &dyn EmailSender,
    to: &str,
    template: &EmailTemplate,
) -> Result<String, EmailError> {
    match template {
        EmailTemplate::Welcome(d) => sender.send_welcome(to, d).await,
        EmailTemplate::PasswordResetSuccess(d) => sender.send_password_reset_success(to, d).await,
        EmailTemplate::EventCreated(d) => sender.send_event_created(to, d).await,
        EmailTemplate::CoOrganizerAssigned(d) => sender.send_co_organizer_assigned(to, d).await,
        EmailTemplate::EventReminder(d) => sender.send_event_reminder(to, d).await,
        EmailTemplate::NewLeaderSignup(d) => sender.send_new_leader_signup(to, d).await,
    }
}

// ── Executor ────────────────────────────────────────────────────

/// Runs the email step of a trio.
pub struct EmailExecutor {
    sender: Arc<dyn EmailSender>,
}

impl EmailExecutor {
    /// Wrap an email sender.
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }

    /// Validate the directive, send with timeout and retry, and register the send.
    ///
    /// Sent mail cannot be recalled, so the registered compensation only
    /// marks the operation in the rollback log.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidTemplate`] without sending for a bad
    /// directive, or [`ChannelError::EmailExhausted`] once retries run out.
    #[instrument(skip_all, fields(trio_id = %ledger.id(), template = %directive.template))]
    pub async fn execute(
        &self,
        directive: &EmailDirective,
        policy: ChannelPolicy,
        ledger: &mut Ledger,
    ) -> Result<String, ChannelError> {
        let template = EmailTemplate::from_parts(&directive.template, directive.data.clone())?;

        let sender = self.sender.as_ref();
        let to = directive.to.as_str();
        let parsed = &template;
        let email_id = with_timeout_and_retry("email", policy, move |_| dispatch(sender, to, parsed))
            .await
            .map_err(|e| ChannelError::EmailExhausted {
                attempts: e.attempts,
                last_error: e.last_error,
            })?;

        ledger.add_operation(
            Channel::Email,
            NewOperation::irreversible(email_id.clone()).with_metadata(json!({
                "to": directive.to,
                "template": template.id(),
                "priority": directive.priority.as_str(),
            })),
        )?;
        info!(email_id = %email_id, "email sent");
        Ok(email_id)
    }
}

// ── Senders ─────────────────────────────────────────────────────

/// Sends through a transactional email provider's HTTP API.
///
/// Posts `{from, to, template, data}` as JSON with bearer authentication and
/// reads the message id from `id` or `messageId` in the response.
#[derive(Debug, Clone)]
pub struct HttpEmailSender {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    from: String,
}

impl HttpEmailSender {
    /// Create a sender for `endpoint`.
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, from: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
            from: from.into(),
        }
    }

    /// Build from config, reading the API key from the configured env var.
    pub fn from_config(endpoint: &str, config: &EmailConfig) -> Self {
        Self::new(
            endpoint,
            std::env::var(&config.api_key_env).ok(),
            config.from.clone(),
        )
    }

    async fn deliver<T: Serialize + Sync>(
        &self,
        template: &str,
        to: &str,
        data: &T,
    ) -> Result<String, EmailError> {
        let body = json!({
            "from": self.from,
            "to": to,
            "template": template,
            "data": data,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(EmailError::Provider {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| EmailError::InvalidResponse(e.to_string()))?;
        parsed
            .get("id")
            .or_else(|| parsed.get("messageId"))
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| EmailError::InvalidResponse("missing message id".to_owned()))
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send_welcome(&self, to: &str, data: &WelcomeEmail) -> Result<String, EmailError> {
        self.deliver(id_of::WELCOME, to, data).await
    }

    async fn send_password_reset_success(
        &self,
        to: &str,
        data: &PasswordResetSuccessEmail,
    ) -> Result<String, EmailError> {
        self.deliver(id_of::PASSWORD_RESET_SUCCESS, to, data).await
    }

    async fn send_event_created(
        &self,
        to: &str,
        data: &EventCreatedEmail,
    ) -> Result<String, EmailError> {
        self.deliver(id_of::EVENT_CREATED, to, data).await
    }

    async fn send_co_organizer_assigned(
        &self,
        to: &str,
        data: &CoOrganizerAssignedEmail,
    ) -> Result<String, EmailError> {
        self.deliver(id_of::CO_ORGANIZER_ASSIGNED, to, data).await
    }

    async fn send_event_reminder(
        &self,
        to: &str,
        data: &EventReminderEmail,
    ) -> Result<String, EmailError> {
        self.deliver(id_of::EVENT_REMINDER, to, data).await
    }

    async fn send_new_leader_signup(
        &self,
        to: &str,
        data: &NewLeaderSignupEmail,
    ) -> Result<String, EmailError> {
        self.deliver(id_of::NEW_LEADER_SIGNUP, to, data).await
    }
}

/// Dry-run sender that only logs what would have been sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEmailSender;

impl LogEmailSender {
    fn log(template: &str, to: &str) -> String {
        let id = format!("log-{}", Uuid::new_v4());
        info!(template, to, email_id = %id, "email not sent (log-only sender)");
        id
    }
}

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_welcome(&self, to: &str, _data: &WelcomeEmail) -> Result<String, EmailError> {
        Ok(Self::log(id_of::WELCOME, to))
    }

    async fn send_password_reset_success(
        &self,
        to: &str,
        _data: &PasswordResetSuccessEmail,
    ) -> Result<String, EmailError> {
        Ok(Self::log(id_of::PASSWORD_RESET_SUCCESS, to))
    }

    async fn send_event_created(
        &self,
        to: &str,
        _data: &EventCreatedEmail,
    ) -> Result<String, EmailError> {
        Ok(Self::log(id_of::EVENT_CREATED, to))
    }

    async fn send_co_organizer_assigned(
        &self,
        to: &str,
        _data: &CoOrganizerAssignedEmail,
    ) -> Result<String, EmailError> {
        Ok(Self::log(id_of::CO_ORGANIZER_ASSIGNED, to))
    }

    async fn send_event_reminder(
        &self,
        to: &str,
        _data: &EventReminderEmail,
    ) -> Result<String, EmailError> {
        Ok(Self::log(id_of::EVENT_REMINDER, to))
    }

    async fn send_new_leader_signup(
        &self,
        to: &str,
        _data: &NewLeaderSignupEmail,
    ) -> Result<String, EmailError> {
        Ok(Self::log(id_of::NEW_LEADER_SIGNUP, to))
    }
}
