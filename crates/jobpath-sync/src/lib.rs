//! Inbox-to-pipeline synchronization engine: classifies mailbox messages
//! into status signals, matches them against tracked applications, and
//! applies monotonic stage transitions with a per-message idempotence
//! ledger.

use std::sync::Arc;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use jobpath_core::{
    next_status, normalize, title_case, tokenize, ApplicationStatus, Notification, SyncHealth,
    TrackedApplication,
};
use jobpath_mailbox::{MailQuery, MailboxError, MailboxProvider, MessageDetail};
use jobpath_store::{NewApplication, NewMailEvent, NotificationSink, Store, StoreError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobpath-sync";

/// Role source recorded on applications the engine creates itself.
pub const SOURCE_GMAIL_SYNC: &str = "Gmail Sync";

/// Role title used when no title can be derived from a subject line.
pub const FALLBACK_ROLE_TITLE: &str = "Application from Gmail";

// ---------------------------------------------------------------------------
// Status classifier

/// Phrase table in priority order. The first family with a phrase present in
/// the normalized text wins, regardless of where later-family phrases occur.
const STATUS_RULES: [(ApplicationStatus, &[&str]); 5] = [
    (
        ApplicationStatus::Offer,
        &["offer", "congratulations", "excited to extend"],
    ),
    (
        ApplicationStatus::Rejected,
        &[
            "unfortunately",
            "not moving forward",
            "regret to inform",
            "not selected",
        ],
    ),
    (
        ApplicationStatus::Interview,
        &[
            "interview",
            "schedule a call",
            "hiring manager",
            "panel interview",
        ],
    ),
    (
        ApplicationStatus::Screening,
        &["phone screen", "recruiter call", "assessment"],
    ),
    (
        ApplicationStatus::Applied,
        &[
            "application received",
            "thanks for applying",
            "application submitted",
        ],
    ),
];

const APPLICATION_NOUNS: [&str; 2] = ["application", "candidacy"];
const RECEIPT_VERBS: [&str; 3] = ["received", "submitted", "confirmed"];

/// Classifies message text into a detected status, or `None` when the text
/// carries no recognizable hiring signal.
///
/// Besides the phrase table there is one fallback: text mentioning an
/// application noun together with a receipt verb reads as APPLIED even when
/// no canned phrase matches ("we received your application").
pub fn classify_status(text: &str) -> Option<ApplicationStatus> {
    let haystack = normalize(text);
    if haystack.is_empty() {
        return None;
    }
    for (status, phrases) in STATUS_RULES {
        if phrases.iter().any(|p| haystack.contains(p)) {
            return Some(status);
        }
    }
    let has_noun = APPLICATION_NOUNS.iter().any(|n| haystack.contains(n));
    let has_verb = RECEIPT_VERBS.iter().any(|v| haystack.contains(v));
    (has_noun && has_verb).then_some(ApplicationStatus::Applied)
}

// ---------------------------------------------------------------------------
// Identity extraction

static COMPANY_HINT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)application (?:to|for)\s+([a-z0-9&'().,\-\s]{2,60})",
        r"(?i)applying (?:to|at)\s+([a-z0-9&'().,\-\s]{2,60})",
        r"(?i)interview with\s+([a-z0-9&'().,\-\s]{2,60})",
        r"(?i)update from\s+([a-z0-9&'().,\-\s]{2,60})",
        r"(?i)opportunity at\s+([a-z0-9&'().,\-\s]{2,60})",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap_or_else(|e| panic!("company hint pattern: {e}")))
    .collect()
});

static GENERIC_SENDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(no.?reply|notifications?|careers?|talent|recruiting|team)")
        .unwrap_or_else(|e| panic!("generic sender pattern: {e}"))
});

static DOMAIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@([a-z0-9][a-z0-9.-]*\.[a-z]{2,})")
        .unwrap_or_else(|e| panic!("domain pattern: {e}"))
});

static ROLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)(?:for|as)\s+(.+?)\s+(?:at|with)\s+",
        r"(?i)application (?:for|to)\s+(.+?)\s*$",
        r"(?i)[—–-]\s*([a-z0-9&'()./\s]{3,80})\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap_or_else(|e| panic!("role pattern: {e}")))
    .collect()
});

/// Hosted applicant-tracking-system domains; their labels name the ATS
/// vendor, not the hiring company.
const ATS_DOMAINS: [&str; 9] = [
    "greenhouse",
    "lever",
    "ashby",
    "workday",
    "myworkdayjobs",
    "smartrecruiters",
    "jobvite",
    "icims",
    "jazzhr",
];

/// Consumer mail domains; their labels identify nobody.
const PERSONAL_MAIL_DOMAINS: [&str; 5] = ["gmail", "yahoo", "hotmail", "outlook", "live"];

fn is_ats_domain(label: &str) -> bool {
    ATS_DOMAINS.contains(&label)
}

/// Display name of a `Name <address>` From header. A bare address has no
/// display name; the raw local part is never promoted to one.
pub fn extract_display_name(from_address: &str) -> String {
    match from_address.find('<') {
        Some(idx) if idx > 0 => from_address[..idx]
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .trim()
            .to_string(),
        _ => String::new(),
    }
}

/// First label of the sender domain, lowercased. Personal mail domains yield
/// nothing; ATS domains are kept here and rejected by the caller that needs
/// a company identity.
pub fn extract_domain_label(from_address: &str) -> String {
    let lower = from_address.to_ascii_lowercase();
    let Some(caps) = DOMAIN_PATTERN.captures(&lower) else {
        return String::new();
    };
    let label = caps[1].split('.').next().unwrap_or("").to_string();
    if PERSONAL_MAIL_DOMAINS.contains(&label.as_str()) {
        String::new()
    } else {
        label
    }
}

/// First explicit company mention in the text ("your application to Acme",
/// "interview with Initech"), normalized and capped at four words.
pub fn extract_company_hint(text: &str) -> String {
    for pattern in COMPANY_HINT_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            let hint = normalize(&caps[1]);
            if !hint.is_empty() {
                return hint.split(' ').take(4).collect::<Vec<_>>().join(" ");
            }
        }
    }
    String::new()
}

/// Derives a display-ready company name from a message, in falling order of
/// confidence: explicit phrase in the text, then a non-generic display name,
/// then a usable sender-domain label. Empty when nothing is trustworthy.
pub fn derive_company_name(subject: &str, snippet: &str, from_address: &str) -> String {
    let text = format!("{subject}\n{snippet}\n{from_address}");
    let hint = extract_company_hint(&text);
    if !hint.is_empty() {
        return title_case(&hint);
    }

    let display = normalize(&extract_display_name(from_address));
    if !display.is_empty() && !GENERIC_SENDER.is_match(&display) {
        let capped = display.split(' ').take(4).collect::<Vec<_>>().join(" ");
        return title_case(&capped);
    }

    let label = extract_domain_label(from_address);
    if !label.is_empty() && !is_ats_domain(&label) {
        return title_case(&normalize(&label));
    }
    String::new()
}

/// Derives a role title from a subject line ("for X at Y", "application for
/// X", or a trailing dash-separated segment), falling back to
/// [`FALLBACK_ROLE_TITLE`].
pub fn derive_role_title(subject: &str) -> String {
    for pattern in ROLE_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(subject) {
            let value: String = normalize(&caps[1]).chars().take(80).collect();
            if value.len() >= 3 {
                return title_case(&value);
            }
        }
    }
    FALLBACK_ROLE_TITLE.to_string()
}

// ---------------------------------------------------------------------------
// Candidate matcher

pub const W_COMPANY_VERBATIM: i32 = 7;
pub const W_COMPANY_TOKEN: i32 = 1;
pub const W_ROLE_OVERLAP_STRONG: i32 = 3;
pub const W_ROLE_OVERLAP_WEAK: i32 = 1;
pub const W_SENDER_ADDRESS_TOKEN: i32 = 2;
pub const W_DISPLAY_NAME_TOKEN: i32 = 3;
pub const W_HINT_SUBSTRING: i32 = 5;
pub const W_HINT_TOKEN: i32 = 3;
pub const W_DOMAIN_STRONG: i32 = 4;
pub const W_DOMAIN_PARTIAL: i32 = 2;

/// Minimum score a candidate must reach to be considered a match at all.
pub const MATCH_SCORE_FLOOR: i32 = 1;

const MAX_COMPANY_TOKENS: usize = 4;
const MAX_ROLE_TOKENS: usize = 5;

/// Additive evidence score for one application against one message.
pub fn score_application(
    app: &TrackedApplication,
    combined_text: &str,
    from_address: &str,
) -> i32 {
    let company_norm = normalize(&app.company.name);
    let title_norm = normalize(&app.role.title);
    let text = normalize(combined_text);
    let from_lower = from_address.to_ascii_lowercase();
    let domain_label = extract_domain_label(from_address);
    let display_name = normalize(&extract_display_name(from_address));
    let company_hint = extract_company_hint(&format!("{from_address} {combined_text}"));

    let mut score = 0;

    if !company_norm.is_empty() && text.contains(&company_norm) {
        score += W_COMPANY_VERBATIM;
    }

    let company_tokens: Vec<String> = tokenize(&company_norm)
        .into_iter()
        .take(MAX_COMPANY_TOKENS)
        .collect();
    for token in &company_tokens {
        if text.contains(token.as_str()) {
            score += W_COMPANY_TOKEN;
        }
    }

    let role_tokens: Vec<String> = tokenize(&title_norm)
        .into_iter()
        .take(MAX_ROLE_TOKENS)
        .collect();
    let role_hits = role_tokens
        .iter()
        .filter(|t| text.contains(t.as_str()))
        .count();
    if role_hits >= 2 {
        score += W_ROLE_OVERLAP_STRONG;
    } else if role_hits == 1 {
        score += W_ROLE_OVERLAP_WEAK;
    }

    if company_tokens.iter().any(|t| from_lower.contains(t.as_str())) {
        score += W_SENDER_ADDRESS_TOKEN;
    }
    if !display_name.is_empty()
        && company_tokens
            .iter()
            .any(|t| display_name.contains(t.as_str()))
    {
        score += W_DISPLAY_NAME_TOKEN;
    }

    if !company_hint.is_empty() {
        if company_norm.contains(&company_hint) || company_hint.contains(&company_norm) {
            score += W_HINT_SUBSTRING;
        } else if company_tokens
            .iter()
            .any(|t| company_hint.contains(t.as_str()) || t.contains(&company_hint))
        {
            score += W_HINT_TOKEN;
        }
    }

    if !domain_label.is_empty() && !is_ats_domain(&domain_label) {
        let first_token = company_tokens.first().map(String::as_str).unwrap_or("");
        if company_norm.contains(&domain_label)
            || (!first_token.is_empty() && domain_label.contains(first_token))
        {
            score += W_DOMAIN_STRONG;
        } else if company_tokens
            .iter()
            .any(|t| domain_label.contains(t.as_str()) || t.contains(&domain_label))
        {
            score += W_DOMAIN_PARTIAL;
        }
    }

    score
}

/// Index of the best-scoring application, or `None` when no candidate
/// reaches [`MATCH_SCORE_FLOOR`]. Ties keep the earliest candidate.
pub fn pick_application(
    applications: &[TrackedApplication],
    combined_text: &str,
    from_address: &str,
) -> Option<usize> {
    let mut best: Option<(usize, i32)> = None;
    for (idx, app) in applications.iter().enumerate() {
        let score = score_application(app, combined_text, from_address);
        if best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((idx, score));
        }
    }
    best.and_then(|(idx, score)| (score >= MATCH_SCORE_FLOOR).then_some(idx))
}

// ---------------------------------------------------------------------------
// Sync engine

#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    pub page_size: u32,
    /// Hard stop for mailbox pagination, even when more pages exist.
    pub max_pages: u32,
    pub default_range_days: u32,
    /// Size of the recent-ledger window reconsidered after the live pass.
    pub backfill_limit: usize,
    /// Re-fetch full bodies during backfill; a fetch failure falls back to
    /// the stored subject and snippet.
    pub refetch_backfill_bodies: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_pages: 3,
            default_range_days: 30,
            backfill_limit: 300,
            refetch_backfill_bodies: true,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `JOBPATH_SYNC_*` environment variables;
    /// unparseable values keep the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("JOBPATH_SYNC_PAGE_SIZE") {
            config.page_size = v;
        }
        if let Some(v) = env_parse("JOBPATH_SYNC_MAX_PAGES") {
            config.max_pages = v;
        }
        if let Some(v) = env_parse("JOBPATH_SYNC_RANGE_DAYS") {
            config.default_range_days = v;
        }
        if let Some(v) = env_parse("JOBPATH_SYNC_BACKFILL_LIMIT") {
            config.backfill_limit = v;
        }
        if let Ok(v) = std::env::var("JOBPATH_SYNC_REFETCH_BODIES") {
            config.refetch_backfill_bodies = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Per-run options supplied by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub range_days: Option<u32>,
    pub full_inbox: bool,
}

/// Counters for one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Message ids listed from the mailbox, before ledger filtering.
    pub scanned: usize,
    /// New ledger rows written this run.
    pub events_created: usize,
    /// Signals classified to a status, live and backfill combined.
    pub detected_events: usize,
    /// Signals matched to an existing application.
    pub matched_events: usize,
    pub transitions_applied: usize,
    pub activity_touches: usize,
    pub applications_created: usize,
    /// Ledger rows reconsidered by the backfill pass.
    pub historical_reconsidered: usize,
    /// Applications in the working set when the run finished.
    pub applications_total: usize,
    /// Individual writes that failed without aborting the run.
    pub write_failures: usize,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("mailbox access token is missing or expired")]
    Unauthorized,
    #[error("mailbox token lacks the scope required to read messages")]
    InsufficientScope,
    #[error("mailbox provider failure: {0}")]
    Provider(MailboxError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<MailboxError> for SyncError {
    fn from(err: MailboxError) -> Self {
        match err {
            MailboxError::Unauthorized => SyncError::Unauthorized,
            MailboxError::InsufficientScope => SyncError::InsufficientScope,
            other => SyncError::Provider(other),
        }
    }
}

/// One-provider sync orchestrator. Construct per run with a token-scoped
/// mailbox; the store and notification sink are shared.
pub struct SyncEngine {
    store: Arc<dyn Store>,
    mailbox: Arc<dyn MailboxProvider>,
    notifications: Arc<dyn NotificationSink>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn Store>,
        mailbox: Arc<dyn MailboxProvider>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            mailbox,
            notifications,
            config: SyncConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs one full sync pass for a user: live mailbox scan, ledger
    /// backfill, sync-state bookkeeping, and a summary notification. A
    /// provider or auth failure aborts the run and marks the sync state as
    /// errored; per-message decode problems and individual write failures
    /// are absorbed into the outcome counters instead.
    pub async fn run(
        &self,
        user_id: Uuid,
        options: SyncOptions,
    ) -> Result<SyncOutcome, SyncError> {
        let provider = self.mailbox.provider_id();
        self.store
            .upsert_sync_state(user_id, provider, SyncHealth::Active, None)
            .await?;

        match self.run_inner(user_id, options).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Err(state_err) = self
                    .store
                    .upsert_sync_state(user_id, provider, SyncHealth::Error, None)
                    .await
                {
                    warn!(%user_id, error = %state_err, "failed to mark sync state errored");
                }
                Err(err)
            }
        }
    }

    async fn run_inner(
        &self,
        user_id: Uuid,
        options: SyncOptions,
    ) -> Result<SyncOutcome, SyncError> {
        let provider = self.mailbox.provider_id();
        let range_days = options.range_days.unwrap_or(self.config.default_range_days);
        let query = if options.full_inbox {
            MailQuery::FullInbox
        } else {
            MailQuery::RecentDays(range_days)
        };
        let started_at = Utc::now();

        let mut applications = self.store.applications_for_user(user_id).await?;
        let mut outcome = SyncOutcome::default();

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;
        loop {
            let page = self
                .mailbox
                .list_messages(&query, page_token.as_deref(), self.config.page_size)
                .await?;
            ids.extend(page.ids);
            pages += 1;
            page_token = page.next_page_token;
            if page_token.is_none() || pages >= self.config.max_pages {
                break;
            }
        }
        outcome.scanned = ids.len();
        debug!(%user_id, scanned = outcome.scanned, pages, "mailbox listing complete");

        for message_id in &ids {
            if self
                .store
                .mail_event_seen(user_id, provider, message_id)
                .await?
            {
                continue;
            }
            let detail = self.mailbox.get_message(message_id).await?;
            self.process_live_message(user_id, provider, &detail, &mut applications, &mut outcome)
                .await?;
        }

        self.backfill(
            user_id,
            provider,
            options.full_inbox,
            range_days,
            started_at,
            &mut applications,
            &mut outcome,
        )
        .await?;

        self.store
            .upsert_sync_state(user_id, provider, SyncHealth::Active, Some(Utc::now()))
            .await?;
        outcome.applications_total = applications.len();

        let pipeline_updates =
            outcome.transitions_applied + outcome.activity_touches + outcome.applications_created;
        if pipeline_updates > 0 {
            let note = Notification {
                user_id,
                category: "APP_STATUS".to_string(),
                title: "Pipeline updated from Gmail".to_string(),
                body: format!(
                    "{pipeline_updates} application statuses were updated from inbox signals."
                ),
                link: Some("/pipeline".to_string()),
            };
            if let Err(err) = self.notifications.notify(note).await {
                warn!(%user_id, error = %err, "failed to deliver sync notification");
            }
        }

        info!(
            %user_id,
            scanned = outcome.scanned,
            events_created = outcome.events_created,
            transitions = outcome.transitions_applied,
            created = outcome.applications_created,
            write_failures = outcome.write_failures,
            "sync run complete"
        );
        Ok(outcome)
    }

    async fn process_live_message(
        &self,
        user_id: Uuid,
        provider: &str,
        detail: &MessageDetail,
        applications: &mut Vec<TrackedApplication>,
        outcome: &mut SyncOutcome,
    ) -> Result<(), SyncError> {
        let subject = detail.subject().to_string();
        let from_address = detail.from_address().to_string();
        let snippet = detail.snippet.clone();
        let body = detail.body_text();
        let occurred_at = detail.internal_date;

        let combined = format!("{subject} {snippet} {body}");
        let match_text = format!("{combined} {from_address}");

        let detected = classify_status(&combined);
        if detected.is_some() {
            outcome.detected_events += 1;
        }
        let matched = pick_application(applications, &match_text, &from_address);

        let (detected_company, detected_role) = if let Some(idx) = matched {
            (
                Some(applications[idx].company.name.clone()),
                Some(applications[idx].role.title.clone()),
            )
        } else if detected.is_some() {
            let company = derive_company_name(&subject, &snippet, &from_address);
            (
                (!company.is_empty()).then_some(company),
                Some(derive_role_title(&subject)),
            )
        } else {
            (None, None)
        };

        let new_event = NewMailEvent {
            user_id,
            provider: provider.to_string(),
            message_id: detail.id.clone(),
            subject: subject.clone(),
            from_address: from_address.clone(),
            snippet: snippet.clone(),
            detected_status: detected,
            detected_company,
            detected_role,
            occurred_at,
        };
        match self.store.record_mail_event(new_event).await {
            Ok(_) => outcome.events_created += 1,
            // A concurrent run already ledgered this message; its effects
            // are that run's responsibility.
            Err(StoreError::DuplicateMailEvent { .. }) => return Ok(()),
            Err(err) => {
                warn!(message_id = %detail.id, error = %err, "failed to record mail event");
                outcome.write_failures += 1;
            }
        }

        let Some(detected) = detected else {
            return Ok(());
        };

        if let Some(idx) = matched {
            outcome.matched_events += 1;
            self.apply_signal(idx, detected, occurred_at, applications, outcome, false)
                .await;
        } else if let Some(app) = self
            .create_application_from_email(
                user_id,
                &subject,
                &snippet,
                &from_address,
                detected,
                occurred_at,
            )
            .await?
        {
            info!(
                %user_id,
                company = %app.company.name,
                role = %app.role.title,
                "created application from inbox signal"
            );
            applications.push(app);
            outcome.applications_created += 1;
        }
        Ok(())
    }

    /// Applies one detected status to one matched application.
    ///
    /// The WITHDRAWN reactivation and the APPLIED-on-APPLIED repeat are both
    /// booked as activity touches; every other accepted transition counts as
    /// a pipeline move. With `touch_only_if_newer` the repeat touch is
    /// skipped unless the signal postdates the recorded activity, so the
    /// backfill pass cannot rewind or double-bump timestamps.
    async fn apply_signal(
        &self,
        idx: usize,
        detected: ApplicationStatus,
        occurred_at: DateTime<Utc>,
        applications: &mut [TrackedApplication],
        outcome: &mut SyncOutcome,
        touch_only_if_newer: bool,
    ) {
        let app = &mut applications[idx];
        match next_status(app.status, detected) {
            Some(next) => {
                let is_touch = detected == ApplicationStatus::Applied;
                match self.store.update_application(app.id, next, occurred_at).await {
                    Ok(()) => {
                        app.status = next;
                        app.last_activity_at = occurred_at;
                        if is_touch {
                            outcome.activity_touches += 1;
                        } else {
                            outcome.transitions_applied += 1;
                        }
                    }
                    Err(err) => {
                        warn!(application = %app.id, error = %err, "failed to persist transition");
                        outcome.write_failures += 1;
                    }
                }
            }
            None if detected == ApplicationStatus::Applied
                && app.status == ApplicationStatus::Applied
                && (!touch_only_if_newer || occurred_at > app.last_activity_at) =>
            {
                match self
                    .store
                    .update_application(app.id, app.status, occurred_at)
                    .await
                {
                    Ok(()) => {
                        app.last_activity_at = occurred_at;
                        outcome.activity_touches += 1;
                    }
                    Err(err) => {
                        warn!(application = %app.id, error = %err, "failed to persist activity touch");
                        outcome.write_failures += 1;
                    }
                }
            }
            None => {}
        }
    }

    /// Creates (or refreshes) an application for a classified signal that
    /// matched nothing. Returns `None` when the sender cannot be identified
    /// as a company; such signals stay ledger-only.
    async fn create_application_from_email(
        &self,
        user_id: Uuid,
        subject: &str,
        snippet: &str,
        from_address: &str,
        detected: ApplicationStatus,
        occurred_at: DateTime<Utc>,
    ) -> Result<Option<TrackedApplication>, SyncError> {
        let company_name = derive_company_name(subject, snippet, from_address);
        if company_name.is_empty() {
            debug!(%from_address, "no company identity; signal stays ledger-only");
            return Ok(None);
        }
        let role_title = derive_role_title(subject);

        if let Some(existing) = self
            .store
            .find_application(user_id, &role_title, &company_name)
            .await?
        {
            let status = if detected == ApplicationStatus::Applied {
                existing.status
            } else {
                detected
            };
            self.store
                .update_application(existing.id, status, occurred_at)
                .await?;
            let mut refreshed = existing;
            refreshed.status = status;
            refreshed.last_activity_at = occurred_at;
            return Ok(Some(refreshed));
        }

        let application = self
            .store
            .create_application(NewApplication {
                user_id,
                company_name,
                role_title,
                role_source: SOURCE_GMAIL_SYNC.to_string(),
                role_url: None,
                role_description: Some(subject.to_string()),
                status: detected,
                last_activity_at: occurred_at,
            })
            .await?;
        Ok(Some(application))
    }

    /// Reconsiders the recent ledger window so signals that predate an
    /// application (or arrived while it was in another stage) still land.
    #[allow(clippy::too_many_arguments)]
    async fn backfill(
        &self,
        user_id: Uuid,
        provider: &str,
        full_inbox: bool,
        range_days: u32,
        started_at: DateTime<Utc>,
        applications: &mut Vec<TrackedApplication>,
        outcome: &mut SyncOutcome,
    ) -> Result<(), SyncError> {
        let since = (!full_inbox).then(|| started_at - Duration::days(i64::from(range_days)));
        let events = self
            .store
            .recent_mail_events(user_id, provider, since, self.config.backfill_limit)
            .await?;
        outcome.historical_reconsidered = events.len();

        for event in events {
            let mut text = format!("{} {}", event.subject, event.snippet);
            if self.config.refetch_backfill_bodies {
                if let Ok(detail) = self.mailbox.get_message(&event.message_id).await {
                    let body = detail.body_text();
                    if !body.is_empty() {
                        text.push(' ');
                        text.push_str(&body);
                    }
                }
            }

            let detected = event.detected_status.or_else(|| classify_status(&text));
            let Some(detected) = detected else {
                continue;
            };
            outcome.detected_events += 1;

            let match_text = format!("{text} {}", event.from_address);
            match pick_application(applications, &match_text, &event.from_address) {
                Some(idx) => {
                    outcome.matched_events += 1;
                    self.apply_signal(
                        idx,
                        detected,
                        event.occurred_at,
                        applications,
                        outcome,
                        true,
                    )
                    .await;
                }
                None => {
                    if let Some(app) = self
                        .create_application_from_email(
                            user_id,
                            &event.subject,
                            &event.snippet,
                            &event.from_address,
                            detected,
                            event.occurred_at,
                        )
                        .await?
                    {
                        applications.push(app);
                        outcome.applications_created += 1;
                    }
                }
            }
        }
        Ok(())
    }
}
