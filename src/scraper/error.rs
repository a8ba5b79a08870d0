//! Error types for the scrape pipeline

use std::time::Duration;

use thiserror::Error;

/// Errors raised by scrape engines and the fallback pipeline
#[derive(Error, Debug)]
pub enum ScrapeError {
    /// The engine failed in a way another engine may not; try the next candidate
    #[error("{engine} failed: {reason}")]
    TransientBackend {
        engine: &'static str,
        reason: String,
    },

    /// The page itself answered with a definitive error status
    #[error("page returned terminal status {status}")]
    TerminalPage { status: u16 },

    /// The scrape budget ran out
    #[error("scrape deadline of {budget:?} exceeded")]
    DeadlineExceeded { budget: Duration },

    /// No configured engine can serve the request
    #[error("no scrape engine supports the requested features")]
    NoEngines,

    /// PDF download or text extraction failed
    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    /// URL could not be parsed
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// HTTP client construction or request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Temporary file error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScrapeError {
    pub fn transient(engine: &'static str, reason: impl ToString) -> Self {
        Self::TransientBackend {
            engine,
            reason: reason.to_string(),
        }
    }

    pub fn invalid_url(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the fallback chain should move on to the next engine
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::TransientBackend { .. } | Self::Http(_))
    }
}
