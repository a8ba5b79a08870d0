//! Error types for crawl coordination

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the coordination store and the crawl coordinator
#[derive(Error, Debug)]
pub enum CrawlError {
    /// Redis command error
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool checkout error
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Redis pool could not be built
    #[error("failed to create redis pool: {0}")]
    CreatePool(String),

    /// Stored crawl record could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A thread panicked while holding the in-memory store lock
    #[error("coordination store lock poisoned")]
    LockPoisoned,

    /// No crawl record under this id (never created, or expired)
    #[error("crawl not found: {0}")]
    CrawlNotFound(Uuid),

    /// URL could not be parsed
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Include or exclude pattern is not a valid regular expression
    #[error("invalid path pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

impl CrawlError {
    pub fn invalid_url(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            Self::Pool(_) => true,
            _ => false,
        }
    }
}
