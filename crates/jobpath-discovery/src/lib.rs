//! Multi-source job-discovery aggregator: fans out to external job boards,
//! deduplicates postings by URL or title+company identity, and ranks the
//! survivors by relevance to the candidate's target roles and locations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobpath_core::normalize;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "jobpath-discovery";

const REMOTIVE_BASE_URL: &str = "https://remotive.com/api";
const ARBEITNOW_BASE_URL: &str = "https://www.arbeitnow.com/api";
const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Titles at the same company this similar are treated as one posting.
const NEAR_DUPLICATE_TITLE_THRESHOLD: f64 = 0.95;

pub const CONFIDENCE_REMOTIVE: f64 = 0.9;
pub const CONFIDENCE_ARBEITNOW: f64 = 0.8;

/// One posting gathered from an external source, stamped with the source's
/// trust weight for dedup tie-breaks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredJob {
    pub title: String,
    pub company_name: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub source: String,
    pub source_confidence: f64,
    pub location: Option<String>,
}

impl DiscoveredJob {
    /// Identity for dedup: the URL when present, otherwise title+company.
    fn dedup_key(&self) -> String {
        match self.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => format!("url:{}", url.to_lowercase()),
            _ => format!(
                "title:{}|company:{}",
                normalize(&self.title),
                normalize(&self.company_name)
            ),
        }
    }
}

/// What the candidate is looking for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    pub target_roles: Vec<String>,
    pub locations: Vec<String>,
    pub limit: usize,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("job source request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("job source responded with status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// One external job board. A failing source is skipped by the aggregator,
/// never fatal to the run.
#[async_trait]
pub trait JobSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Trust weight used to break dedup ties between sources.
    fn confidence(&self) -> f64;

    async fn fetch(&self, query: &DiscoveryQuery) -> Result<Vec<DiscoveredJob>, SourceError>;
}

fn lower(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Additive relevance score: target roles in the title outweigh roles in the
/// description, and a location hit in the posting's location field outweighs
/// one buried in the description. Seniority markers and a named company add
/// a nudge each.
pub fn score_relevance(job: &DiscoveredJob, target_roles: &[String], locations: &[String]) -> i32 {
    let title = lower(&job.title);
    let company = lower(&job.company_name);
    let location = lower(job.location.as_deref().unwrap_or(""));
    let description = lower(job.description.as_deref().unwrap_or(""));

    let mut score = 0;
    for role in target_roles {
        let role = lower(role);
        if role.is_empty() {
            continue;
        }
        if title.contains(&role) {
            score += 6;
        } else if description.contains(&role) {
            score += 3;
        }
    }
    for loc in locations {
        let loc = lower(loc);
        if loc.is_empty() {
            continue;
        }
        if location.contains(&loc) {
            score += 4;
        } else if description.contains(&loc) {
            score += 2;
        }
    }
    if title.contains("senior") {
        score += 1;
    }
    if title.contains("staff") {
        score += 1;
    }
    if !company.is_empty() {
        score += 1;
    }
    score
}

/// Collapses duplicate postings. Exact key collisions keep the entry from
/// the higher-confidence source; a second pass folds near-identical titles
/// at the same company the same way. Survivor order follows first sight.
pub fn dedup_jobs(jobs: Vec<DiscoveredJob>) -> Vec<DiscoveredJob> {
    let mut kept: Vec<DiscoveredJob> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for job in jobs {
        let key = job.dedup_key();
        match index.get(&key) {
            Some(&i) => {
                if job.source_confidence > kept[i].source_confidence {
                    kept[i] = job;
                }
            }
            None => {
                index.insert(key, kept.len());
                kept.push(job);
            }
        }
    }

    let mut folded: Vec<DiscoveredJob> = Vec::new();
    'next_job: for job in kept {
        for survivor in &mut folded {
            if normalize(&survivor.company_name) == normalize(&job.company_name)
                && jaro_winkler(&normalize(&survivor.title), &normalize(&job.title))
                    >= NEAR_DUPLICATE_TITLE_THRESHOLD
            {
                if job.source_confidence > survivor.source_confidence {
                    *survivor = job;
                }
                continue 'next_job;
            }
        }
        folded.push(job);
    }
    folded
}

/// Fans out to every source, skipping failures, then dedups, ranks, and
/// truncates to the query limit. Equal scores keep source order.
pub async fn discover(
    sources: &[Arc<dyn JobSource>],
    query: &DiscoveryQuery,
) -> Vec<DiscoveredJob> {
    let mut gathered = Vec::new();
    for source in sources {
        match source.fetch(query).await {
            Ok(mut jobs) => {
                debug!(source = source.source_id(), count = jobs.len(), "source fetched");
                gathered.append(&mut jobs);
            }
            Err(err) => {
                warn!(source = source.source_id(), error = %err, "job source failed; skipping");
            }
        }
    }

    let mut ranked: Vec<(i32, DiscoveredJob)> = dedup_jobs(gathered)
        .into_iter()
        .map(|job| (score_relevance(&job, &query.target_roles, &query.locations), job))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0));
    ranked
        .into_iter()
        .take(query.limit)
        .map(|(_, job)| job)
        .collect()
}

/// The production source set.
pub fn default_sources() -> Result<Vec<Arc<dyn JobSource>>, SourceError> {
    Ok(vec![
        Arc::new(RemotiveSource::new()?),
        Arc::new(ArbeitnowSource::new()?),
    ])
}

fn build_client() -> Result<reqwest::Client, SourceError> {
    Ok(reqwest::Client::builder()
        .gzip(true)
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .build()?)
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: String,
    params: &[(&str, String)],
) -> Result<T, SourceError> {
    let resp = client.get(&url).query(params).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(SourceError::HttpStatus {
            status: status.as_u16(),
            url: resp.url().to_string(),
        });
    }
    Ok(resp.json().await?)
}

// Remotive wire shapes.

#[derive(Debug, Deserialize)]
struct RemotiveResponse {
    #[serde(default)]
    jobs: Vec<RemotiveJob>,
}

#[derive(Debug, Deserialize)]
struct RemotiveJob {
    title: Option<String>,
    company_name: Option<String>,
    description: Option<String>,
    url: Option<String>,
    candidate_required_location: Option<String>,
}

fn remotive_jobs_from(raw: RemotiveResponse) -> Vec<DiscoveredJob> {
    raw.jobs
        .into_iter()
        .filter_map(|job| {
            let title = job.title.filter(|t| !t.trim().is_empty())?;
            let company_name = job.company_name.filter(|c| !c.trim().is_empty())?;
            Some(DiscoveredJob {
                title,
                company_name,
                description: job.description,
                url: job.url,
                source: "Remotive".to_string(),
                source_confidence: CONFIDENCE_REMOTIVE,
                location: job.candidate_required_location,
            })
        })
        .collect()
}

/// Remotive remote-jobs API, searched by the first three target roles.
pub struct RemotiveSource {
    client: reqwest::Client,
    base_url: String,
}

impl RemotiveSource {
    pub fn new() -> Result<Self, SourceError> {
        Self::with_base_url(REMOTIVE_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, SourceError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl JobSource for RemotiveSource {
    fn source_id(&self) -> &'static str {
        "remotive"
    }

    fn confidence(&self) -> f64 {
        CONFIDENCE_REMOTIVE
    }

    async fn fetch(&self, query: &DiscoveryQuery) -> Result<Vec<DiscoveredJob>, SourceError> {
        let keyword = query
            .target_roles
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        let url = format!("{}/remote-jobs", self.base_url);
        let raw: RemotiveResponse =
            get_json(&self.client, url, &[("search", keyword)]).await?;
        Ok(remotive_jobs_from(raw))
    }
}

// Arbeitnow wire shapes.

#[derive(Debug, Deserialize)]
struct ArbeitnowResponse {
    #[serde(default)]
    data: Vec<ArbeitnowJob>,
}

#[derive(Debug, Deserialize)]
struct ArbeitnowJob {
    title: Option<String>,
    company_name: Option<String>,
    description: Option<String>,
    remote: Option<bool>,
    location: Option<String>,
    url: Option<String>,
    slug: Option<String>,
}

fn arbeitnow_jobs_from(raw: ArbeitnowResponse) -> Vec<DiscoveredJob> {
    raw.data
        .into_iter()
        .filter_map(|job| {
            let title = job.title.filter(|t| !t.trim().is_empty())?;
            let company_name = job.company_name.filter(|c| !c.trim().is_empty())?;
            let url = job.url.filter(|u| !u.trim().is_empty()).or_else(|| {
                job.slug
                    .as_deref()
                    .map(|slug| format!("https://www.arbeitnow.com/jobs/{slug}"))
            });
            let location = if job.remote.unwrap_or(false) {
                Some("Remote".to_string())
            } else {
                job.location
            };
            Some(DiscoveredJob {
                title,
                company_name,
                description: job.description,
                url,
                source: "Arbeitnow".to_string(),
                source_confidence: CONFIDENCE_ARBEITNOW,
                location,
            })
        })
        .collect()
}

/// Arbeitnow job-board API; unfiltered board, relevance comes from ranking.
pub struct ArbeitnowSource {
    client: reqwest::Client,
    base_url: String,
}

impl ArbeitnowSource {
    pub fn new() -> Result<Self, SourceError> {
        Self::with_base_url(ARBEITNOW_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, SourceError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl JobSource for ArbeitnowSource {
    fn source_id(&self) -> &'static str {
        "arbeitnow"
    }

    fn confidence(&self) -> f64 {
        CONFIDENCE_ARBEITNOW
    }

    async fn fetch(&self, _query: &DiscoveryQuery) -> Result<Vec<DiscoveredJob>, SourceError> {
        let url = format!("{}/job-board-api", self.base_url);
        let raw: ArbeitnowResponse = get_json(&self.client, url, &[]).await?;
        Ok(arbeitnow_jobs_from(raw))
    }
}
