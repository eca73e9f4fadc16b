//! Core domain model for the JobPath sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobpath-core";

/// Lifecycle stage of one tracked application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Applied,
    Screening,
    Interview,
    Offer,
    Rejected,
    Withdrawn,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 6] = [
        ApplicationStatus::Applied,
        ApplicationStatus::Screening,
        ApplicationStatus::Interview,
        ApplicationStatus::Offer,
        ApplicationStatus::Rejected,
        ApplicationStatus::Withdrawn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Applied => "APPLIED",
            ApplicationStatus::Screening => "SCREENING",
            ApplicationStatus::Interview => "INTERVIEW",
            ApplicationStatus::Offer => "OFFER",
            ApplicationStatus::Rejected => "REJECTED",
            ApplicationStatus::Withdrawn => "WITHDRAWN",
        }
    }
}

/// Pure stage-transition function: given the current status and the status
/// detected from an inbox message, returns the status to move to, or `None`
/// for no change.
///
/// REJECTED is terminal. A detected APPLIED normally changes nothing, except
/// from WITHDRAWN, where it reactivates the application; callers treat that
/// one transition as an activity touch rather than a pipeline move.
pub fn next_status(
    current: ApplicationStatus,
    detected: ApplicationStatus,
) -> Option<ApplicationStatus> {
    use ApplicationStatus::*;

    if current == Rejected {
        return None;
    }
    match detected {
        Applied => (current == Withdrawn).then_some(Applied),
        Rejected => Some(Rejected),
        Offer => (current != Offer).then_some(Offer),
        Interview => matches!(current, Applied | Screening | Withdrawn).then_some(Interview),
        Screening => matches!(current, Applied | Withdrawn).then_some(Screening),
        Withdrawn => None,
    }
}

/// A hiring company, deduplicated by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
}

/// A role the candidate is pursuing at a company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub title: String,
    pub source: String,
    pub url: Option<String>,
    pub description: Option<String>,
}

/// One candidate's pursuit of one role. Status is only mutated through
/// [`next_status`] by the sync engine, or by explicit user edits; the sync
/// engine never deletes applications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedApplication {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: ApplicationStatus,
    pub last_activity_at: DateTime<Utc>,
    pub role: Role,
    pub company: Company,
}

/// Immutable ledger record of one processed inbox message. The
/// (user, provider, message_id) triple is the idempotence key: at most one
/// row exists per triple, and rows are never updated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailEvent {
    pub id: Uuid,
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncHealth {
    Active,
    Error,
}

impl SyncHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncHealth::Active => "ACTIVE",
            SyncHealth::Error => "ERROR",
        }
    }
}

/// Per (candidate, provider) liveness record, upserted at the start and end
/// of every sync run. Health signal only, never a correctness dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub user_id: Uuid,
    pub provider: String,
    pub status: SyncHealth,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Fire-and-forget user alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: Uuid,
    pub category: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
}

/// Lowercases, collapses every non-alphanumeric run to a single space, and
/// trims. Empty input yields empty output; the foundation for all matching.
pub fn normalize(text: &str) -> String {
    text.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized tokens of at least 3 characters; shorter tokens are noise for
/// scoring purposes.
pub fn tokenize(text: &str) -> Vec<String> {
    normalize(text)
        .split(' ')
        .filter(|t| t.len() >= 3)
        .map(str::to_string)
        .collect()
}

/// Uppercases the first character of each space-separated word.
pub fn title_case(input: &str) -> String {
    input
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
