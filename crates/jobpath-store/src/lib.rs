//! Persistent-store and notification-sink boundaries, with in-memory
//! reference implementations used by tests and default wiring.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobpath_core::{
    ApplicationStatus, Company, MailEvent, Notification, Role, SyncHealth, SyncState,
    TrackedApplication,
};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobpath-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mail event already recorded for provider {provider} message {message_id}")]
    DuplicateMailEvent { provider: String, message_id: String },
    #[error("application {0} not found")]
    ApplicationNotFound(Uuid),
    #[error("store backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything needed to create an application, with its role and company
/// looked up or created by name.
#[derive(Debug, Clone)]
pub struct NewApplication {
    pub user_id: Uuid,
    pub company_name: String,
    pub role_title: String,
    pub role_source: String,
    pub role_url: Option<String>,
    pub role_description: Option<String>,
    pub status: ApplicationStatus,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMailEvent {
    pub user_id: Uuid,
    pub provider: String,
    pub message_id: String,
    pub subject: String,
    pub from_address: String,
    pub snippet: String,
    pub detected_status: Option<ApplicationStatus>,
    pub detected_company: Option<String>,
    pub detected_role: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Keyed record store consumed by the sync engine. Each method is one
/// independent transaction-scoped write or read; there is no cross-call
/// transaction and no per-candidate lock (documented engine assumption).
#[async_trait]
pub trait Store: Send + Sync {
    /// Applications with role and company hydrated, in stable
    /// insertion/update order.
    async fn applications_for_user(&self, user_id: Uuid)
        -> StoreResult<Vec<TrackedApplication>>;

    async fn find_application(
        &self,
        user_id: Uuid,
        role_title: &str,
        company_name: &str,
    ) -> StoreResult<Option<TrackedApplication>>;

    async fn create_application(&self, new: NewApplication) -> StoreResult<TrackedApplication>;

    async fn update_application(
        &self,
        id: Uuid,
        status: ApplicationStatus,
        last_activity_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Idempotence check against the ledger.
    async fn mail_event_seen(
        &self,
        user_id: Uuid,
        provider: &str,
        message_id: &str,
    ) -> StoreResult<bool>;

    /// Appends one ledger row. Fails with [`StoreError::DuplicateMailEvent`]
    /// when the (user, provider, message_id) triple already exists.
    async fn record_mail_event(&self, new: NewMailEvent) -> StoreResult<MailEvent>;

    /// Most-recent events first, bounded by `limit`, optionally restricted
    /// to events at or after `since`.
    async fn recent_mail_events(
        &self,
        user_id: Uuid,
        provider: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<MailEvent>>;

    async fn mail_event_count(&self, user_id: Uuid, provider: &str) -> StoreResult<usize>;

    async fn upsert_sync_state(
        &self,
        user_id: Uuid,
        provider: &str,
        status: SyncHealth,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    async fn sync_state(&self, user_id: Uuid, provider: &str) -> StoreResult<Option<SyncState>>;
}

/// Fire-and-forget user alert sink. Callers log delivery failures and never
/// propagate them as run failures.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, note: Notification) -> StoreResult<()>;
}

#[derive(Default)]
struct MemoryInner {
    companies: HashMap<String, Company>,
    roles: HashMap<(String, String), Role>,
    applications: Vec<TrackedApplication>,
    events: Vec<MailEvent>,
    event_keys: HashSet<(Uuid, String, String)>,
    sync_states: HashMap<(Uuid, String), SyncState>,
}

/// In-memory reference store. Mirrors the uniqueness and ordering guarantees
/// a SQL backend would enforce, so engine tests exercise the real contract.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryInner {
    fn company_for(&mut self, name: &str) -> Company {
        self.companies
            .entry(name.to_string())
            .or_insert_with(|| Company {
                id: Uuid::new_v4(),
                name: name.to_string(),
            })
            .clone()
    }

    fn role_for(&mut self, new: &NewApplication) -> Role {
        self.roles
            .entry((new.company_name.clone(), new.role_title.clone()))
            .or_insert_with(|| Role {
                id: Uuid::new_v4(),
                title: new.role_title.clone(),
                source: new.role_source.clone(),
                url: new.role_url.clone(),
                description: new.role_description.clone(),
            })
            .clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn applications_for_user(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Vec<TrackedApplication>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .applications
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_application(
        &self,
        user_id: Uuid,
        role_title: &str,
        company_name: &str,
    ) -> StoreResult<Option<TrackedApplication>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .applications
            .iter()
            .find(|a| {
                a.user_id == user_id
                    && a.role.title == role_title
                    && a.company.name == company_name
            })
            .cloned())
    }

    async fn create_application(&self, new: NewApplication) -> StoreResult<TrackedApplication> {
        let mut inner = self.inner.lock().await;
        let company = inner.company_for(&new.company_name);
        let role = inner.role_for(&new);
        let application = TrackedApplication {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            status: new.status,
            last_activity_at: new.last_activity_at,
            role,
            company,
        };
        inner.applications.push(application.clone());
        Ok(application)
    }

    async fn update_application(
        &self,
        id: Uuid,
        status: ApplicationStatus,
        last_activity_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let application = inner
            .applications
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StoreError::ApplicationNotFound(id))?;
        application.status = status;
        application.last_activity_at = last_activity_at;
        Ok(())
    }

    async fn mail_event_seen(
        &self,
        user_id: Uuid,
        provider: &str,
        message_id: &str,
    ) -> StoreResult<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.event_keys.contains(&(
            user_id,
            provider.to_string(),
            message_id.to_string(),
        )))
    }

    async fn record_mail_event(&self, new: NewMailEvent) -> StoreResult<MailEvent> {
        let mut inner = self.inner.lock().await;
        let key = (
            new.user_id,
            new.provider.clone(),
            new.message_id.clone(),
        );
        if !inner.event_keys.insert(key) {
            return Err(StoreError::DuplicateMailEvent {
                provider: new.provider,
                message_id: new.message_id,
            });
        }
        let event = MailEvent {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            provider: new.provider,
            message_id: new.message_id,
            subject: new.subject,
            from_address: new.from_address,
            snippet: new.snippet,
            detected_status: new.detected_status,
            detected_company: new.detected_company,
            detected_role: new.detected_role,
            occurred_at: new.occurred_at,
        };
        inner.events.push(event.clone());
        Ok(event)
    }

    async fn recent_mail_events(
        &self,
        user_id: Uuid,
        provider: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<MailEvent>> {
        let inner = self.inner.lock().await;
        let mut events: Vec<MailEvent> = inner
            .events
            .iter()
            .filter(|e| {
                e.user_id == user_id
                    && e.provider == provider
                    && since.map(|s| e.occurred_at >= s).unwrap_or(true)
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        events.truncate(limit);
        Ok(events)
    }

    async fn mail_event_count(&self, user_id: Uuid, provider: &str) -> StoreResult<usize> {
        let inner = self.inner.lock().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.user_id == user_id && e.provider == provider)
            .count())
    }

    async fn upsert_sync_state(
        &self,
        user_id: Uuid,
        provider: &str,
        status: SyncHealth,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .sync_states
            .entry((user_id, provider.to_string()))
            .or_insert_with(|| SyncState {
                user_id,
                provider: provider.to_string(),
                status,
                last_synced_at: None,
            });
        entry.status = status;
        if last_synced_at.is_some() {
            entry.last_synced_at = last_synced_at;
        }
        Ok(())
    }

    async fn sync_state(&self, user_id: Uuid, provider: &str) -> StoreResult<Option<SyncState>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sync_states
            .get(&(user_id, provider.to_string()))
            .cloned())
    }
}

/// Notification sink that records alerts in memory; the default wiring for
/// tests and the CLI, and the shape a queue- or table-backed sink follows.
#[derive(Default)]
pub struct MemoryNotificationSink {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn notify(&self, note: Notification) -> StoreResult<()> {
        self.sent.lock().await.push(note);
        Ok(())
    }
}
