//! Crawl-state coordination
//!
//! A crawl is a [`StoredCrawl`] record plus a handful of sets and lists in a
//! shared [`CoordinationStore`]: the locked-URL sets used to deduplicate
//! discovery, the job membership set, and the terminal-state bookkeeping used
//! to decide when the crawl is finished.
//!
//! # Example
//!
//! ```rust,ignore
//! use crawlq::crawl::{CrawlCoordinator, CoordinatorConfig, MemoryStore, UrlLock};
//!
//! let coordinator = CrawlCoordinator::new(Arc::new(MemoryStore::new()), CoordinatorConfig::default());
//! coordinator.save_crawl(crawl_id, &crawl).await?;
//! if coordinator.lock_url(crawl_id, &crawl, "https://example.com/a").await? == UrlLock::Locked {
//!     // enqueue a scrape job
//! }
//! ```

pub mod coordinator;
pub mod error;
pub mod filter;
pub mod memory_store;
pub mod permutations;
pub mod redis_store;
pub mod sitemap;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scraper::PageOptions;

pub use coordinator::{
    CoordinatorConfig, CrawlCoordinator, CrawlProgress, FailedUrlPolicy, JobDone,
    RedirectOutcome, UrlLock,
};
pub use error::CrawlError;
pub use filter::{DenialReason, FilterOutcome, LinkFilter};
pub use memory_store::MemoryStore;
pub use permutations::{generate_url_permutations, normalize_url};
pub use redis_store::{RedisStore, StoreConfig};
pub use sitemap::{parse_sitemap, Sitemap, SitemapFetcher};
pub use store::{ClaimOutcome, CoordinationStore, MemberClaim, SharedStore, UniqueSlot};

/// How the kickoff job treats the origin's sitemap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SitemapPolicy {
    /// Seed from the sitemap and from links discovered on pages
    #[default]
    Include,
    /// Never fetch the sitemap
    Skip,
    /// Seed from the sitemap only; discovered links are not followed
    Only,
}

impl std::str::FromStr for SitemapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "include" => Ok(Self::Include),
            "skip" => Ok(Self::Skip),
            "only" => Ok(Self::Only),
            other => Err(format!("unknown sitemap policy: {other}")),
        }
    }
}

/// Per-crawl discovery rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerOptions {
    /// Maximum number of distinct pages locked for the crawl
    pub limit: u64,

    /// Maximum path depth below the origin
    pub max_depth: u32,

    /// Maximum number of link hops from the seed page
    pub max_discovery_depth: Option<u32>,

    /// Regexes a link must match (any) to be followed
    pub include_paths: Vec<String>,

    /// Regexes that exclude a link when matched
    pub exclude_paths: Vec<String>,

    pub sitemap: SitemapPolicy,

    /// Follow links outside the origin path
    pub allow_backward_links: bool,

    /// Follow links to other hosts
    pub allow_external_links: bool,

    /// Follow links to subdomains of the origin host
    pub allow_subdomains: bool,

    /// Treat URLs differing only by query string as one page
    pub ignore_query_parameters: bool,

    /// Match include/exclude patterns against the full URL instead of the path
    pub regex_on_full_url: bool,

    /// Lock every permutation of a URL instead of the URL alone
    pub deduplicate_similar_urls: bool,
}

impl Default for CrawlerOptions {
    fn default() -> Self {
        Self {
            limit: 10_000,
            max_depth: 10,
            max_discovery_depth: None,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            sitemap: SitemapPolicy::Include,
            allow_backward_links: false,
            allow_external_links: false,
            allow_subdomains: false,
            ignore_query_parameters: false,
            regex_on_full_url: false,
            deduplicate_similar_urls: true,
        }
    }
}

/// The persisted crawl record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCrawl {
    pub origin_url: String,
    pub team_id: String,
    pub crawler_options: CrawlerOptions,

    /// Options applied to every scrape job of the crawl
    #[serde(default)]
    pub scrape_options: PageOptions,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub cancelled: bool,
}

impl StoredCrawl {
    pub fn new(
        origin_url: impl Into<String>,
        team_id: impl Into<String>,
        crawler_options: CrawlerOptions,
        scrape_options: PageOptions,
    ) -> Self {
        Self {
            origin_url: origin_url.into(),
            team_id: team_id.into(),
            crawler_options,
            scrape_options,
            created_at: Utc::now(),
            cancelled: false,
        }
    }
}

/// Connect the configured coordination store
///
/// An empty `redis_url` selects the process-local [`MemoryStore`], which only
/// coordinates the loops of a single worker process.
pub async fn open_store(config: &StoreConfig) -> Result<SharedStore, CrawlError> {
    if config.redis_url.trim().is_empty() {
        tracing::warn!("No Redis URL configured, using in-memory coordination store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(RedisStore::new(config).await?))
}
