//! Job records and payloads

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::QueueError;
use crate::scraper::PageOptions;

// ============================================================================
// Status
// ============================================================================

/// Lifecycle state of a job row
///
/// `queued -> active -> {completed, failed}`, with `active -> queued` when the
/// stall reaper recovers a job whose holder stopped renewing its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed rows never change status again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(QueueError::UnknownStatus(other.to_string())),
        }
    }
}

// ============================================================================
// Lease token
// ============================================================================

/// Fencing token proving current ownership of an active job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    /// A fresh token; the worker mints one for every claim attempt
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for LeaseToken {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// First job of a crawl: sitemap retrieval and seeding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KickoffJob {
    pub crawl_id: Uuid,
    pub team_id: String,
    pub url: String,
}

/// Fetch of a single page, optionally as a member of a crawl
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeJob {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawl_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,

    #[serde(default)]
    pub page_options: PageOptions,

    /// Number of link hops from the seed page
    #[serde(default)]
    pub discovery_depth: u32,

    #[serde(default)]
    pub from_sitemap: bool,

    /// The crawl's seed page; its redirects move the crawl origin
    #[serde(default)]
    pub is_crawl_source: bool,
}

impl ScrapeJob {
    /// A standalone scrape with default options
    pub fn standalone(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            crawl_id: None,
            team_id: None,
            page_options: PageOptions::default(),
            discovery_depth: 0,
            from_sitemap: false,
            is_crawl_source: false,
        }
    }
}

/// Closed set of job kinds stored in the `payload` column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Kickoff(KickoffJob),
    Scrape(ScrapeJob),
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::Kickoff(_) => "kickoff",
            JobPayload::Scrape(_) => "scrape",
        }
    }

    pub fn crawl_id(&self) -> Option<Uuid> {
        match self {
            JobPayload::Kickoff(job) => Some(job.crawl_id),
            JobPayload::Scrape(job) => job.crawl_id,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            JobPayload::Kickoff(job) => &job.url,
            JobPayload::Scrape(job) => &job.url,
        }
    }

    /// Decode a stored payload, rejecting anything outside the known kinds
    pub fn from_stored(id: Uuid, value: serde_json::Value) -> Result<Self, QueueError> {
        serde_json::from_value(value).map_err(|e| QueueError::InvalidPayload {
            id,
            reason: e.to_string(),
        })
    }
}

// ============================================================================
// Job row
// ============================================================================

/// A durable job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    pub lease_token: Option<LeaseToken>,
    pub lease_time: Option<DateTime<Utc>>,
    pub stall_count: i32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Terminal outcome passed to `end_job`
#[derive(Debug, Clone, PartialEq)]
pub enum JobEnd {
    Completed { result: Option<serde_json::Value> },
    Failed { error: String },
}

impl JobEnd {
    pub fn completed(result: serde_json::Value) -> Self {
        JobEnd::Completed {
            result: Some(result),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        JobEnd::Failed {
            error: error.into(),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobEnd::Completed { .. } => JobStatus::Completed,
            JobEnd::Failed { .. } => JobStatus::Failed,
        }
    }

    pub(crate) fn result(&self) -> Option<&serde_json::Value> {
        match self {
            JobEnd::Completed { result } => result.as_ref(),
            JobEnd::Failed { .. } => None,
        }
    }

    pub(crate) fn error(&self) -> Option<&str> {
        match self {
            JobEnd::Completed { .. } => None,
            JobEnd::Failed { error } => Some(error),
        }
    }
}

/// Row counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Active => self.active += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}

/// Result of one stall-reaper pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Parse an externally supplied job id without touching any backend
pub fn parse_job_id(id: &str) -> Result<Uuid, QueueError> {
    Uuid::parse_str(id.trim()).map_err(|_| QueueError::InvalidId(id.to_string()))
}
