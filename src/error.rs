//! Unified error handling for the crawlq crate
//!
//! Each subsystem has its own error enum; this module wraps them in a single
//! [`Error`] for code that crosses module boundaries (the binary, mostly),
//! while the subsystems keep using their own types internally.
//!
//! # Architecture
//!
//! - [`CrawlqErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use crawlq::error::{CrawlqErrorTrait, Error};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = ?err.category(), error = %err, "Retrying");
//!     } else {
//!         tracing::error!(error = %err, "Fatal error");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::crawl::CrawlError;
pub use crate::queue::QueueError;
pub use crate::scraper::ScrapeError;
pub use crate::server::ServerError;
pub use crate::worker::WorkerError;

/// Common trait for all crawlq error types
pub trait CrawlqErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP clients, sockets, remote engines
    Network,
    /// Job queue storage
    Queue,
    /// Crawl coordination store
    Coordination,
    /// Scrape pipeline and content extraction
    Scraping,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Queue => "queue",
            Self::Coordination => "coordination",
            Self::Scraping => "scraping",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Domain errors
// ============================================================================

impl CrawlqErrorTrait for QueueError {
    fn is_recoverable(&self) -> bool {
        QueueError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidId(_) => ErrorCategory::Config,
            _ => ErrorCategory::Queue,
        }
    }
}

impl CrawlqErrorTrait for CrawlError {
    fn is_recoverable(&self) -> bool {
        CrawlError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidUrl { .. } | Self::InvalidPattern(_) => ErrorCategory::Config,
            _ => ErrorCategory::Coordination,
        }
    }
}

impl CrawlqErrorTrait for ScrapeError {
    fn is_recoverable(&self) -> bool {
        ScrapeError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::TransientBackend { .. } | Self::Http(_) => ErrorCategory::Network,
            Self::InvalidUrl { .. } => ErrorCategory::Config,
            _ => ErrorCategory::Scraping,
        }
    }
}

impl CrawlqErrorTrait for WorkerError {
    fn is_recoverable(&self) -> bool {
        WorkerError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Queue(e) => e.category(),
            Self::Crawl(e) => e.category(),
            Self::Scrape(e) => e.category(),
            Self::CrawlNotFound(_) | Self::CrawlCancelled(_) | Self::RacedRedirect => {
                ErrorCategory::Coordination
            }
            Self::LeaseLost(_) => ErrorCategory::Queue,
            Self::DeadlineExceeded(_) => ErrorCategory::Scraping,
            Self::Panicked(_) => ErrorCategory::Other,
        }
    }
}

impl CrawlqErrorTrait for ServerError {
    fn is_recoverable(&self) -> bool {
        false
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Bind { .. } => ErrorCategory::Config,
            Self::Serve(_) => ErrorCategory::Network,
        }
    }
}

// ============================================================================
// Unified error
// ============================================================================

/// Unified error type for the crawlq crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Coordination error: {0}")]
    Crawl(#[from] CrawlError),

    #[error("Scrape error: {0}")]
    Scrape(#[from] ScrapeError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CrawlqErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Queue(e) => e.is_recoverable(),
            Self::Crawl(e) => e.is_recoverable(),
            Self::Scrape(e) => e.is_recoverable(),
            Self::Worker(e) => e.is_recoverable(),
            Self::Server(_) => false,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Queue(e) => e.category(),
            Self::Crawl(e) => e.category(),
            Self::Scrape(e) => e.category(),
            Self::Worker(e) => e.category(),
            Self::Server(e) => e.category(),
            Self::Io(_) => ErrorCategory::Network,
            Self::Json(_) => ErrorCategory::Other,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
