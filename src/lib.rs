//! crawlq - distributed crawl coordination
//!
//! A durable job queue, shared crawl state, a worker loop and a scrape
//! pipeline that falls back across rendering engines.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`queue`] - Durable job queue (PostgreSQL, SQLite) with leases and notifications
//! - [`crawl`] - Crawl records, URL locking, link filtering and sitemaps
//! - [`scraper`] - Engines, HTML/PDF extraction and the fallback pipeline
//! - [`worker`] - Claim loop, lease heartbeat, kickoff and scrape handlers
//! - [`server`] - Health probes and the Prometheus endpoint
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Retry with exponential backoff
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use crawlq::config::Config;
//! use crawlq::crawl::{open_store, CrawlCoordinator, SitemapFetcher};
//! use crawlq::queue::open_queue;
//! use crawlq::scraper::ScrapePipeline;
//! use crawlq::worker::Worker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let queue = open_queue(&config.queue).await?;
//!     let store = open_store(&config.store).await?;
//!     let coordinator = CrawlCoordinator::new(store, config.coordinator.clone());
//!     let pipeline = ScrapePipeline::from_config(&config.scraper)?.into_shared();
//!     let sitemaps = SitemapFetcher::new(&config.scraper.user_agent, config.scraper.attempt_timeout())?;
//!
//!     let worker = Worker::new(queue, coordinator, pipeline, sitemaps, config.worker.clone());
//!     let (_tx, shutdown) = tokio::sync::watch::channel(false);
//!     worker.run(shutdown).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crawl;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod scraper;
pub mod server;
pub mod utils;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crawl::{CrawlCoordinator, CrawlerOptions, SitemapPolicy, StoredCrawl};
    pub use crate::error::{CrawlqErrorTrait, Error, ErrorCategory, Result};
    pub use crate::queue::{Job, JobPayload, JobQueue, JobStatus, SharedJobQueue};
    pub use crate::scraper::{Document, PageOptions, ScrapePipeline};
    pub use crate::worker::Worker;
}
