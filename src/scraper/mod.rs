//! Scrape fallback pipeline
//!
//! A scrape walks an ordered list of engines until one produces usable
//! content, a definitive page error, or the deadline runs out. Every outcome
//! is turned into a [`Document`].
//!
//! # Example
//!
//! ```rust,ignore
//! use crawlq::scraper::{PageOptions, ScrapePipeline, ScraperConfig};
//!
//! let pipeline = ScrapePipeline::from_config(&ScraperConfig::default())?;
//! let report = pipeline.scrape("https://example.com", &PageOptions::default()).await;
//! println!("{:?}: {}", report.verdict, report.document.final_url());
//! ```

pub mod document;
pub mod engine;
pub mod engines;
pub mod error;
pub mod html;
pub mod pdf;
pub mod pipeline;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use document::{Action, Document, DocumentMetadata, PageOptions, ScrollDirection};
pub use engine::{
    order_candidates, EngineKind, EngineResponse, Feature, FeatureSet, ScrapeEngine, SharedEngine,
};
pub use error::ScrapeError;
pub use pipeline::{ScrapePipeline, ScrapeReport, Verdict};

/// Scraper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    /// Engine preference order; unavailable engines are skipped
    pub engines: Vec<EngineKind>,

    /// Base URL of the playwright rendering service
    pub playwright_url: Option<String>,

    /// Base URL of the browser automation service
    pub browser_url: Option<String>,

    /// Engines tried first for specific hosts
    pub host_overrides: HashMap<String, Vec<EngineKind>>,

    /// Fetch engine rate limit
    pub requests_per_second: u32,

    /// Overall budget for one scrape
    pub deadline_secs: u64,

    /// Upper bound for a single engine attempt
    pub attempt_timeout_secs: u64,

    /// Markdown length at which a page is accepted
    pub min_content_length: usize,

    /// User-Agent for sitemap requests
    pub user_agent: String,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            engines: vec![EngineKind::Browser, EngineKind::Playwright, EngineKind::Fetch],
            playwright_url: None,
            browser_url: None,
            host_overrides: HashMap::new(),
            requests_per_second: 10,
            deadline_secs: 60,
            attempt_timeout_secs: 30,
            min_content_length: 100,
            user_agent: format!("crawlq/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ScraperConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}
