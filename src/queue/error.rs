//! Error types for the durable job queue

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by [`JobQueue`](super::JobQueue) implementations
#[derive(Error, Debug)]
pub enum QueueError {
    /// Identifier could not be parsed as a job id
    #[error("invalid job id: {0}")]
    InvalidId(String),

    /// No terminal notification arrived before the wait deadline
    #[error("timed out after {waited:?} waiting for job {id}")]
    TimedOut { id: Uuid, waited: Duration },

    /// Stored payload does not match any known job kind
    #[error("invalid payload for job {id}: {reason}")]
    InvalidPayload { id: Uuid, reason: String },

    /// Stored status column holds an unknown value
    #[error("unknown job status: {0}")]
    UnknownStatus(String),

    /// PostgreSQL error
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// PostgreSQL pool checkout error
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// PostgreSQL pool construction error
    #[error("failed to create connection pool: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),

    /// SQLite error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error preparing the SQLite database
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The in-process notification hub was dropped
    #[error("job notification channel closed")]
    NotificationsClosed,

    /// A thread panicked while holding the connection lock
    #[error("queue connection lock poisoned")]
    LockPoisoned,
}

impl QueueError {
    /// Whether retrying the same call may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Postgres(_) | Self::Pool(_) | Self::TimedOut { .. }
        )
    }
}
