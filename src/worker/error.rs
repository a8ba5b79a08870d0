//! Error types for job execution

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::crawl::CrawlError;
use crate::queue::QueueError;
use crate::scraper::ScrapeError;

/// Errors raised while executing or reporting a claimed job
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The redirect target belongs to another job of the same crawl
    #[error("redirect target already claimed by another job")]
    RacedRedirect,

    /// The crawl was cancelled before the job started
    #[error("crawl {0} was cancelled")]
    CrawlCancelled(Uuid),

    /// Another holder owns the job now; its outcome is authoritative
    #[error("lease lost for job {0}")]
    LeaseLost(Uuid),

    /// The scrape budget ran out before any engine answered
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// The crawl record is missing (never created, or expired)
    #[error("crawl not found: {0}")]
    CrawlNotFound(Uuid),

    /// The job body panicked
    #[error("job panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Crawl(CrawlError),

    #[error(transparent)]
    Scrape(#[from] ScrapeError),
}

impl From<CrawlError> for WorkerError {
    fn from(err: CrawlError) -> Self {
        match err {
            CrawlError::CrawlNotFound(id) => WorkerError::CrawlNotFound(id),
            other => WorkerError::Crawl(other),
        }
    }
}

impl WorkerError {
    /// Whether retrying the same call may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Queue(e) => e.is_recoverable(),
            Self::Crawl(e) => e.is_recoverable(),
            Self::Scrape(e) => e.is_recoverable(),
            _ => false,
        }
    }

    /// Outcomes that end a job without counting as a failure
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::RacedRedirect | Self::CrawlCancelled(_) | Self::LeaseLost(_)
        )
    }
}
