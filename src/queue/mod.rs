//! Durable job queue
//!
//! Jobs are rows with a status, a tagged payload and lease columns. Claims are
//! exclusive (`FOR UPDATE SKIP LOCKED` on PostgreSQL, a single `UPDATE ...
//! RETURNING` under the connection lock on SQLite), leases are fenced by a
//! per-claim token, and terminal transitions are broadcast to waiters.
//!
//! # Backends
//!
//! - [`PostgresJobQueue`] - shared by many worker processes
//! - [`SqliteJobQueue`] - single node, also used by the test-suite
//!
//! # Example
//!
//! ```rust,ignore
//! use crawlq::queue::{JobQueue, LeaseToken, SqliteJobQueue};
//!
//! let queue = SqliteJobQueue::in_memory()?;
//! if let Some(job) = queue.get_job_to_process(LeaseToken::new()).await? {
//!     // ... work ...
//! }
//! ```

pub mod error;
pub mod job;
pub mod maintenance;
pub mod notify;
pub mod postgres;
pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::QueueError;
pub use job::{
    parse_job_id, Job, JobEnd, JobPayload, JobStatus, KickoffJob, LeaseToken, QueueCounts,
    ReapReport, ScrapeJob,
};
pub use maintenance::QueueMaintenance;
pub use notify::{JobNotification, JobNotifications, NOTIFY_CHANNEL};
pub use postgres::PostgresJobQueue;
pub use sqlite::SqliteJobQueue;

// ============================================================================
// Configuration
// ============================================================================

/// Which storage engine backs the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Postgres,
    Sqlite,
}

impl std::str::FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown queue backend: {other}")),
        }
    }
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,

    /// PostgreSQL connection URL
    pub database_url: String,

    /// SQLite database path
    pub sqlite_path: PathBuf,

    /// Maximum pool size
    pub pool_size: usize,

    /// Active rows whose lease is older than this are reaped
    pub stall_threshold_secs: u64,

    /// Reaps tolerated before a job is failed instead of requeued
    pub max_stalls: u32,

    /// Stall reaper period
    pub reap_interval_secs: u64,

    /// Completed rows are deleted after this long
    pub completed_retention_secs: u64,

    /// Failed rows are deleted after this long
    pub failed_retention_secs: u64,

    /// Retention sweep period
    pub sweep_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Postgres,
            database_url: String::from("postgresql://localhost/crawlq"),
            sqlite_path: PathBuf::from("data/queue.db"),
            pool_size: 16,
            stall_threshold_secs: 60,
            max_stalls: 3,
            reap_interval_secs: 15,
            completed_retention_secs: 3600,
            failed_retention_secs: 86_400,
            sweep_interval_secs: 300,
        }
    }
}

impl QueueConfig {
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }

    pub fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// ============================================================================
// Queue trait
// ============================================================================

/// Operations every queue backend provides
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Short backend name for logs and health output
    fn backend_name(&self) -> &'static str;

    /// Hub on which terminal transitions are published
    fn notifications(&self) -> &JobNotifications;

    /// Insert a `queued` row
    async fn add_job(&self, id: Uuid, payload: JobPayload) -> Result<Job, QueueError>;

    /// Insert many `queued` rows in one transaction
    async fn add_jobs(&self, jobs: Vec<(Uuid, JobPayload)>) -> Result<usize, QueueError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError>;

    /// Claim the oldest queued row for `lease`, or `None` when nothing is queued
    async fn get_job_to_process(&self, lease: LeaseToken) -> Result<Option<Job>, QueueError>;

    /// Refresh the lease time; `false` means the lease is gone
    async fn renew_lease(&self, id: Uuid, lease: LeaseToken) -> Result<bool, QueueError>;

    /// Move an active row to a terminal status if `lease` still owns it
    async fn end_job(&self, id: Uuid, lease: LeaseToken, end: JobEnd) -> Result<bool, QueueError>;

    /// Requeue or fail active rows whose lease is older than `threshold`
    async fn reap_stalled(
        &self,
        threshold: Duration,
        max_stalls: u32,
    ) -> Result<ReapReport, QueueError>;

    /// Delete terminal rows older than their retention window
    async fn sweep_retention(&self, completed: Duration, failed: Duration)
        -> Result<u64, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;

    /// Resolve with the terminal status of `id`
    ///
    /// Malformed ids fail with [`QueueError::InvalidId`] before any backend
    /// call; a wait longer than `timeout` fails with [`QueueError::TimedOut`].
    async fn wait_for_job(&self, id: &str, timeout: Duration) -> Result<JobStatus, QueueError> {
        let id = parse_job_id(id)?;
        notify::wait_for_terminal(self, id, timeout).await
    }
}

/// Shared, dynamically dispatched queue handle
pub type SharedJobQueue = Arc<dyn JobQueue>;

/// Open the configured backend
pub async fn open_queue(config: &QueueConfig) -> Result<SharedJobQueue, QueueError> {
    match config.backend {
        QueueBackend::Postgres => {
            let queue = PostgresJobQueue::connect(config).await?;
            queue.init_schema().await?;
            Ok(Arc::new(queue))
        }
        QueueBackend::Sqlite => {
            if let Some(parent) = config.sqlite_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Ok(Arc::new(SqliteJobQueue::new(&config.sqlite_path)?))
        }
    }
}
