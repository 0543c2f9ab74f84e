//! In-memory collaborators with scripted failures.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use trio::channels::email::{
    CoOrganizerAssignedEmail, EmailError, EventCreatedEmail, EventReminderEmail,
    NewLeaderSignupEmail, PasswordResetSuccessEmail, WelcomeEmail,
};
use trio::channels::message::{StoreError, StoredMessage};
use trio::channels::socket::PushError;
use trio::channels::{EmailSender, MessageStore, NewMessage, PushChannel};
use trio::config::{RecoveryConfig, TrioConfig};
use trio::{TrioCoordinator, TrioDeps};

/// Records sends; fails every one when `failing`.
#[derive(Default)]
pub struct FakeEmail {
    pub failing: bool,
    pub calls: AtomicU32,
    pub sent: Mutex<Vec<(String, &'static str)>>,
}

impl FakeEmail {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    fn send(&self, to: &str, template: &'static str) -> Result<String, EmailError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if self.failing {
            return Err(EmailError::Provider {
                status: 502,
                body: "bad gateway".to_owned(),
            });
        }
        self.sent
            .lock()
            .expect("sent lock")
            .push((to.to_owned(), template));
        Ok(format!("email-{call}"))
    }

    pub fn sent(&self) -> Vec<(String, &'static str)> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl EmailSender for FakeEmail {
    async fn send_welcome(&self, to: &str, _data: &WelcomeEmail) -> Result<String, EmailError> {
        self.send(to, "welcome")
    }

    async fn send_password_reset_success(
        &self,
        to: &str,
        _data: &PasswordResetSuccessEmail,
    ) -> Result<String, EmailError> {
        self.send(to, "password-reset-success")
    }

    async fn send_event_created(
        &self,
        to: &str,
        _data: &EventCreatedEmail,
    ) -> Result<String, EmailError> {
        self.send(to, "event-created")
    }

    async fn send_co_organizer_assigned(
        &self,
        to: &str,
        _data: &CoOrganizerAssignedEmail,
    ) -> Result<String, EmailError> {
        self.send(to, "co-organizer-assigned")
    }

    async fn send_event_reminder(
        &self,
        to: &str,
        _data: &EventReminderEmail,
    ) -> Result<String, EmailError> {
        self.send(to, "event-reminder")
    }

    async fn send_new_leader_signup(
        &self,
        to: &str,
        _data: &NewLeaderSignupEmail,
    ) -> Result<String, EmailError> {
        self.send(to, "new-leader-signup")
    }
}

/// A message held by [`FakeStore`].
#[derive(Debug, Clone)]
pub struct Saved {
    pub id: String,
    pub message: NewMessage,
    pub active: bool,
}

/// Message store that can refuse writes or deactivations.
#[derive(Default)]
pub struct FakeStore {
    pub failing_create: bool,
    pub failing_deactivate: bool,
    pub creates: AtomicU32,
    pub saved: Mutex<Vec<Saved>>,
}

impl FakeStore {
    pub fn saved(&self) -> Vec<Saved> {
        self.saved.lock().expect("saved lock").clone()
    }
}

#[async_trait]
impl MessageStore for FakeStore {
    async fn create(&self, message: &NewMessage) -> Result<StoredMessage, StoreError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if self.failing_create {
            return Err(StoreError::NotFound("system_messages".to_owned()));
        }
        let id = format!("msg-{n}");
        self.saved.lock().expect("saved lock").push(Saved {
            id: id.clone(),
            message: message.clone(),
            active: true,
        });
        Ok(StoredMessage {
            id,
            created_at: Utc::now(),
        })
    }

    async fn deactivate(&self, id: &str) -> Result<(), StoreError> {
        if self.failing_deactivate {
            return Err(StoreError::NotFound(id.to_owned()));
        }
        let mut saved = self.saved.lock().expect("saved lock");
        match saved.iter_mut().find(|s| s.id == id) {
            Some(entry) => {
                entry.active = false;
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_owned())),
        }
    }
}

/// Push channel where everyone except `offline` is connected.
#[derive(Default)]
pub struct FakePush {
    pub offline: HashSet<String>,
    pub pushed: Mutex<Vec<(String, serde_json::Value)>>,
}

impl FakePush {
    pub fn with_offline(ids: &[&str]) -> Self {
        Self {
            offline: ids.iter().map(|id| (*id).to_owned()).collect(),
            ..Self::default()
        }
    }

    pub fn pushed(&self) -> Vec<(String, serde_json::Value)> {
        self.pushed.lock().expect("pushed lock").clone()
    }
}

#[async_trait]
impl PushChannel for FakePush {
    async fn push(
        &self,
        recipient: &str,
        _event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), PushError> {
        if self.offline.contains(recipient) {
            return Err(PushError::NotConnected(recipient.to_owned()));
        }
        self.pushed
            .lock()
            .expect("pushed lock")
            .push((recipient.to_owned(), payload.clone()));
        Ok(())
    }
}

/// Default configuration without the random error-counter reset.
pub fn config() -> TrioConfig {
    TrioConfig {
        recovery: RecoveryConfig {
            stats_reset_probability: 0.0,
            ..RecoveryConfig::default()
        },
        ..TrioConfig::default()
    }
}

pub struct Harness {
    pub email: Arc<FakeEmail>,
    pub store: Arc<FakeStore>,
    pub push: Arc<FakePush>,
    pub coordinator: TrioCoordinator,
}

pub fn harness(email: FakeEmail, store: FakeStore, push: FakePush) -> Harness {
    harness_with(email, store, push, &config())
}

pub fn harness_with(
    email: FakeEmail,
    store: FakeStore,
    push: FakePush,
    config: &TrioConfig,
) -> Harness {
    let email = Arc::new(email);
    let store = Arc::new(store);
    let push = Arc::new(push);
    let coordinator = TrioCoordinator::new(
        TrioDeps {
            email: email.clone(),
            messages: store.clone(),
            push: push.clone(),
        },
        config,
    );
    Harness {
        email,
        store,
        push,
        coordinator,
    }
}

pub fn healthy() -> Harness {
    harness(FakeEmail::default(), FakeStore::default(), FakePush::default())
}
