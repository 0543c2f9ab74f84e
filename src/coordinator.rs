//! Trio coordinator: runs email, message and socket steps as one unit.
//!
//! Steps run sequentially (email, then message, then socket) because the
//! push references the persisted message id. Any step raising aborts the
//! rest, rolls back what already happened (when enabled) and hands the
//! error to the [`ErrorHandler`] for advisory recovery scheduling.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::channels::email::{
    CoOrganizerAssignedEmail, EventCreatedEmail, EventReminderEmail, NewLeaderSignupEmail,
    PasswordResetSuccessEmail, WelcomeEmail,
};
use crate::channels::message::{Creator, MessageType};
use crate::channels::socket::MESSAGE_CREATED_EVENT;
use crate::channels::{
    ChannelError, EmailDirective, EmailExecutor, EmailSender, EmailTemplate, MessageExecutor,
    MessageStore, NewMessage, Priority, PushChannel, SocketExecutor,
};
use crate::config::{ChannelsConfig, TrioConfig};
use crate::ledger::{Channel, Ledger, LedgerManager};
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::recovery::classify::{classify_error, validation_error, TrioError};
use crate::recovery::{ErrorHandler, RecoveryContext, RecoveryResult};

// ── Request ─────────────────────────────────────────────────────

/// The persisted message part of a trio request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDirective {
    /// Headline.
    pub title: String,
    /// Body text.
    pub content: String,
    /// Message kind.
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    /// Priority.
    #[serde(default)]
    pub priority: Priority,
    /// Hide the creator from recipients.
    #[serde(default)]
    pub hide_creator: bool,
}

impl MessageDirective {
    /// Announcement with medium priority.
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            message_type: MessageType::default(),
            priority: Priority::default(),
            hide_creator: false,
        }
    }

    /// Set the message kind.
    pub fn of_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Per-call overrides of configured behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrioOptions {
    /// Overrides the global rollback flag.
    #[serde(default)]
    pub enable_rollback: Option<bool>,
    /// Overrides every channel's per-attempt timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Overrides every channel's attempt count.
    #[serde(default)]
    pub retries: Option<u32>,
}

/// Input to one orchestration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrioRequest {
    /// Optional email step.
    #[serde(default)]
    pub email: Option<EmailDirective>,
    /// Persisted message.
    #[serde(rename = "systemMessage", alias = "message")]
    pub message: MessageDirective,
    /// Recipient user ids for the message and the push.
    pub recipients: Vec<String>,
    /// Attribution for the persisted message.
    #[serde(default)]
    pub creator: Option<Creator>,
    /// Per-call overrides.
    #[serde(default)]
    pub options: TrioOptions,
}

impl TrioRequest {
    /// Request without email, creator or overrides.
    pub fn new(message: MessageDirective, recipients: Vec<String>) -> Self {
        Self {
            email: None,
            message,
            recipients,
            creator: None,
            options: TrioOptions::default(),
        }
    }

    /// Add the email step.
    pub fn with_email(mut self, email: EmailDirective) -> Self {
        self.email = Some(email);
        self
    }

    /// Attribute the message.
    pub fn with_creator(mut self, creator: Creator) -> Self {
        self.creator = Some(creator);
        self
    }

    /// Apply per-call overrides.
    pub fn with_options(mut self, options: TrioOptions) -> Self {
        self.options = options;
        self
    }

    /// Welcome email plus greeting message for a new user.
    pub fn welcome(email: &str, user_id: &str, name: &str) -> Self {
        let template = EmailTemplate::Welcome(WelcomeEmail {
            name: name.to_owned(),
        });
        Self::new(
            MessageDirective::new(
                "Welcome!",
                format!("Welcome aboard, {name}. Your account is ready."),
            )
            .of_type(MessageType::System),
            vec![user_id.to_owned()],
        )
        .with_email(template.to_directive(email))
    }

    /// Confirmation that a password reset completed.
    pub fn password_reset_success(email: &str, user_id: &str, name: &str) -> Self {
        let template = EmailTemplate::PasswordResetSuccess(PasswordResetSuccessEmail {
            name: name.to_owned(),
        });
        Self::new(
            MessageDirective::new(
                "Password changed",
                "Your password was reset successfully.",
            )
            .of_type(MessageType::System)
            .with_priority(Priority::High),
            vec![user_id.to_owned()],
        )
        .with_email(template.to_directive(email))
    }

    /// Notice to the organizer that their event was published.
    pub fn event_created(organizer_email: &str, organizer_id: &str, data: EventCreatedEmail) -> Self {
        let content = format!("\"{}\" is scheduled for {}.", data.event_title, data.event_date);
        let template = EmailTemplate::EventCreated(data);
        Self::new(
            MessageDirective::new("Event created", content).of_type(MessageType::Update),
            vec![organizer_id.to_owned()],
        )
        .with_email(template.to_directive(organizer_email))
    }

    /// Notice to a user that they became co-organizer.
    pub fn co_organizer_assigned(
        email: &str,
        user_id: &str,
        data: CoOrganizerAssignedEmail,
        assigned_by: Option<Creator>,
    ) -> Self {
        let content = format!(
            "{} made you a co-organizer of \"{}\".",
            data.assigned_by, data.event_title
        );
        let template = EmailTemplate::CoOrganizerAssigned(data);
        let request = Self::new(
            MessageDirective::new("You are a co-organizer", content).of_type(MessageType::Update),
            vec![user_id.to_owned()],
        )
        .with_email(template.to_directive(email));
        match assigned_by {
            Some(creator) => request.with_creator(creator),
            None => request,
        }
    }

    /// Reminder for an upcoming event.
    pub fn event_reminder(email: &str, user_id: &str, data: EventReminderEmail) -> Self {
        let content = format!("\"{}\" starts {}.", data.event_title, data.event_date);
        let template = EmailTemplate::EventReminder(data);
        Self::new(
            MessageDirective::new("Event reminder", content)
                .of_type(MessageType::Reminder)
                .with_priority(Priority::High),
            vec![user_id.to_owned()],
        )
        .with_email(template.to_directive(email))
    }

    /// Notice to organizers that a leader signed up for a role.
    pub fn new_leader_signup(
        organizer_email: &str,
        organizer_ids: Vec<String>,
        data: NewLeaderSignupEmail,
    ) -> Self {
        let content = format!(
            "{} signed up as {} for \"{}\".",
            data.leader_name, data.role_name, data.event_title
        );
        let template = EmailTemplate::NewLeaderSignup(data);
        Self::new(
            MessageDirective::new("New leader signup", content).of_type(MessageType::Update),
            organizer_ids,
        )
        .with_email(template.to_directive(organizer_email))
    }

    fn to_new_message(&self) -> NewMessage {
        NewMessage {
            title: self.message.title.clone(),
            content: self.message.content.clone(),
            message_type: self.message.message_type,
            priority: self.message.priority,
            hide_creator: self.message.hide_creator,
            recipients: self.recipients.clone(),
            creator: self.creator.clone(),
        }
    }
}

// ── Result ──────────────────────────────────────────────────────

/// Timing of one attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrioMetrics {
    /// Whole attempt, including rollback and recovery.
    pub total_duration_ms: u64,
    /// Email step, if it ran.
    pub email_ms: Option<u64>,
    /// Message step, if it ran.
    pub message_ms: Option<u64>,
    /// Socket step, if it ran.
    pub socket_ms: Option<u64>,
}

/// Caller-visible outcome of [`TrioCoordinator::create_trio`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrioResult {
    /// Every step completed and the ledger committed.
    pub success: bool,
    /// Provider id of the sent email.
    pub email_id: Option<String>,
    /// Id of the persisted message. On failure, set only while that
    /// message is still active because it was not rolled back.
    pub message_id: Option<String>,
    /// Recipients reached by the push.
    pub notifications_sent: usize,
    /// Failure description.
    pub error: Option<String>,
    /// Every compensation ran without error.
    pub rollback_completed: bool,
    /// Advisory recovery decision for a failed attempt.
    pub recovery: Option<RecoveryResult>,
    /// Timing.
    pub metrics: TrioMetrics,
}

#[derive(Debug, Default)]
struct Delivered {
    email_id: Option<String>,
    message_id: Option<String>,
    notifications_sent: usize,
}

// ── Coordinator ─────────────────────────────────────────────────

/// Collaborators a coordinator drives.
#[derive(Clone)]
pub struct TrioDeps {
    /// Outbound email.
    pub email: Arc<dyn EmailSender>,
    /// Message persistence.
    pub messages: Arc<dyn MessageStore>,
    /// Real-time push.
    pub push: Arc<dyn PushChannel>,
}

/// Orchestrates one trio per call.
pub struct TrioCoordinator {
    email: EmailExecutor,
    message: MessageExecutor,
    socket: SocketExecutor,
    channels: ChannelsConfig,
    enable_rollback: bool,
    metrics: Arc<MetricsRegistry>,
    errors: Arc<ErrorHandler>,
    ledgers: Arc<LedgerManager>,
}

impl TrioCoordinator {
    /// Coordinator with fresh metrics, error handler and ledger manager.
    pub fn new(deps: TrioDeps, config: &TrioConfig) -> Self {
        Self {
            email: EmailExecutor::new(deps.email),
            message: MessageExecutor::new(deps.messages),
            socket: SocketExecutor::new(deps.push),
            channels: config.channels.clone(),
            enable_rollback: config.features.enable_rollback,
            metrics: Arc::new(MetricsRegistry::new()),
            errors: Arc::new(ErrorHandler::new(config.recovery.clone())),
            ledgers: Arc::new(LedgerManager::new()),
        }
    }

    /// Share an existing metrics registry.
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Share an existing error handler.
    pub fn with_error_handler(mut self, errors: Arc<ErrorHandler>) -> Self {
        self.errors = errors;
        self
    }

    /// Share an existing ledger manager.
    pub fn with_ledger_manager(mut self, ledgers: Arc<LedgerManager>) -> Self {
        self.ledgers = ledgers;
        self
    }

    /// Run one trio attempt.
    ///
    /// Never returns an error: failures are reported through
    /// [`TrioResult::success`] and [`TrioResult::error`].
    #[instrument(skip_all, fields(recipients = request.recipients.len()))]
    pub async fn create_trio(&self, request: TrioRequest) -> TrioResult {
        let started = Instant::now();
        let mut ledger = self.ledgers.begin();
        let mut timings = TrioMetrics::default();
        info!(trio_id = %ledger.id(), with_email = request.email.is_some(), "trio started");

        let mut delivered = Delivered::default();
        let outcome = match self
            .run_steps(&request, &mut ledger, &mut timings, &mut delivered)
            .await
        {
            Ok(()) => ledger.commit().map_err(ChannelError::from),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                let elapsed = started.elapsed();
                timings.total_duration_ms = millis(elapsed);
                self.metrics.record_success(elapsed);
                self.ledgers.finish(&ledger);
                info!(
                    trio_id = %ledger.id(),
                    notifications_sent = delivered.notifications_sent,
                    duration_ms = timings.total_duration_ms,
                    "trio completed"
                );
                TrioResult {
                    success: true,
                    email_id: delivered.email_id,
                    message_id: delivered.message_id,
                    notifications_sent: delivered.notifications_sent,
                    error: None,
                    rollback_completed: false,
                    recovery: None,
                    metrics: timings,
                }
            }
            Err(err) => {
                self.fail(&request, ledger, err, started, timings, delivered.message_id)
                    .await
            }
        }
    }

    async fn run_steps(
        &self,
        request: &TrioRequest,
        ledger: &mut Ledger,
        timings: &mut TrioMetrics,
        delivered: &mut Delivered,
    ) -> Result<(), ChannelError> {
        let opts = request.options;

        if let Some(directive) = &request.email {
            let policy = self.channels.email.with_overrides(opts.timeout_ms, opts.retries);
            let step = Instant::now();
            let sent = self.email.execute(directive, policy, ledger).await;
            timings.email_ms = Some(millis(step.elapsed()));
            delivered.email_id = Some(sent?);
        }

        let message = request.to_new_message();
        let policy = self.channels.message.with_overrides(opts.timeout_ms, opts.retries);
        let step = Instant::now();
        let stored = self.message.execute(&message, policy, ledger).await;
        timings.message_ms = Some(millis(step.elapsed()));
        let stored = stored?;
        delivered.message_id = Some(stored.id.clone());

        let creator = if message.hide_creator {
            None
        } else {
            message.creator.as_ref()
        };
        let payload = json!({
            "messageId": stored.id,
            "title": message.title,
            "content": message.content,
            "type": message.message_type,
            "priority": message.priority,
            "hideCreator": message.hide_creator,
            "creator": creator,
            "createdAt": stored.created_at,
        });
        let policy = self.channels.socket.with_overrides(opts.timeout_ms, opts.retries);
        let step = Instant::now();
        let pushed = self
            .socket
            .execute(&request.recipients, MESSAGE_CREATED_EVENT, payload, policy, ledger)
            .await;
        timings.socket_ms = Some(millis(step.elapsed()));
        delivered.notifications_sent = pushed?.sent.len();

        Ok(())
    }

    async fn fail(
        &self,
        request: &TrioRequest,
        mut ledger: Ledger,
        err: ChannelError,
        started: Instant,
        mut timings: TrioMetrics,
        persisted: Option<String>,
    ) -> TrioResult {
        warn!(trio_id = %ledger.id(), error = %err, "trio step failed");

        let rollback_enabled = request
            .options
            .enable_rollback
            .unwrap_or(self.enable_rollback);
        // (rollback completed, persisted message still active)
        let (rollback_completed, message_active) = if rollback_enabled {
            match ledger.rollback().await {
                Ok(report) => {
                    if !report.is_complete() {
                        warn!(
                            trio_id = %ledger.id(),
                            failed = report.failures.len(),
                            "rollback completed with failures"
                        );
                    }
                    let deactivation_failed = report
                        .failures
                        .iter()
                        .any(|f| f.channel == Channel::Message);
                    (report.is_complete(), deactivation_failed)
                }
                Err(e) => {
                    error!(trio_id = %ledger.id(), error = %e, "rollback refused");
                    (false, true)
                }
            }
        } else {
            if let Err(e) = ledger.fail(err.to_string()) {
                warn!(trio_id = %ledger.id(), error = %e, "could not mark transaction failed");
            }
            (false, true)
        };
        let message_id = persisted.filter(|_| message_active);

        let context = RecoveryContext {
            trio_id: Some(ledger.id()),
            template: request.email.as_ref().map(|e| e.template.clone()),
            recipients: request.recipients.len(),
            operations: ledger.state().operations.len(),
        };
        let handled = self
            .errors
            .handle_classified(classify_failure(&err), context, Utc::now());

        let elapsed = started.elapsed();
        timings.total_duration_ms = millis(elapsed);
        self.metrics
            .record_failure(elapsed, handled.error.error_type, rollback_enabled);
        self.ledgers.finish(&ledger);

        error!(
            trio_id = %ledger.id(),
            error = %err,
            error_type = %handled.error.error_type,
            rollback_completed,
            "trio failed"
        );

        TrioResult {
            success: false,
            email_id: None,
            message_id,
            notifications_sent: 0,
            error: Some(err.to_string()),
            rollback_completed,
            recovery: Some(handled.recovery),
            metrics: timings,
        }
    }

    // ── Convenience wrappers ────────────────────────────────────

    /// See [`TrioRequest::welcome`].
    pub async fn create_welcome_trio(&self, email: &str, user_id: &str, name: &str) -> TrioResult {
        self.create_trio(TrioRequest::welcome(email, user_id, name))
            .await
    }

    /// See [`TrioRequest::password_reset_success`].
    pub async fn create_password_reset_success_trio(
        &self,
        email: &str,
        user_id: &str,
        name: &str,
    ) -> TrioResult {
        self.create_trio(TrioRequest::password_reset_success(email, user_id, name))
            .await
    }

    /// See [`TrioRequest::event_created`].
    pub async fn create_event_created_trio(
        &self,
        organizer_email: &str,
        organizer_id: &str,
        data: EventCreatedEmail,
    ) -> TrioResult {
        self.create_trio(TrioRequest::event_created(organizer_email, organizer_id, data))
            .await
    }

    /// See [`TrioRequest::co_organizer_assigned`].
    pub async fn create_co_organizer_assigned_trio(
        &self,
        email: &str,
        user_id: &str,
        data: CoOrganizerAssignedEmail,
        assigned_by: Option<Creator>,
    ) -> TrioResult {
        self.create_trio(TrioRequest::co_organizer_assigned(
            email,
            user_id,
            data,
            assigned_by,
        ))
        .await
    }

    /// See [`TrioRequest::event_reminder`].
    pub async fn create_event_reminder_trio(
        &self,
        email: &str,
        user_id: &str,
        data: EventReminderEmail,
    ) -> TrioResult {
        self.create_trio(TrioRequest::event_reminder(email, user_id, data))
            .await
    }

    /// See [`TrioRequest::new_leader_signup`].
    pub async fn create_new_leader_signup_trio(
        &self,
        organizer_email: &str,
        organizer_ids: Vec<String>,
        data: NewLeaderSignupEmail,
    ) -> TrioResult {
        self.create_trio(TrioRequest::new_leader_signup(
            organizer_email,
            organizer_ids,
            data,
        ))
        .await
    }

    // ── Introspection ───────────────────────────────────────────

    /// Process-wide counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Error counters, breakers and recovery history.
    pub fn error_handler(&self) -> &ErrorHandler {
        &self.errors
    }

    /// In-flight and finished ledgers.
    pub fn ledgers(&self) -> &LedgerManager {
        &self.ledgers
    }

    /// Clear metrics, error state and ledger history.
    pub fn reset(&self) {
        self.metrics.reset();
        self.errors.reset();
        self.ledgers.reset();
    }
}

/// Rejected templates are caller bugs, whatever their identifier says.
fn classify_failure(err: &ChannelError) -> TrioError {
    match err {
        ChannelError::InvalidTemplate(e) => validation_error(&e.to_string()),
        other => classify_error(other),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
