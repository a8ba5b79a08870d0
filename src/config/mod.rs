//! Configuration management for crawlq
//!
//! Settings come from `CRAWLQ_*` environment variables (plus the conventional
//! `DATABASE_URL` and `REDIS_URL`) or from a TOML file. Every section type
//! lives beside the module it configures; this module only assembles and
//! validates them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::crawl::{CoordinatorConfig, StoreConfig};
use crate::queue::QueueConfig;
use crate::scraper::{EngineKind, ScraperConfig};
use crate::server::ServerConfig;
use crate::worker::WorkerConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Job queue backend and maintenance
    pub queue: QueueConfig,

    /// Coordination store connection
    pub store: StoreConfig,

    /// Crawl bookkeeping
    pub coordinator: CoordinatorConfig,

    /// Worker loops
    pub worker: WorkerConfig,

    /// Scrape engines and pipeline budgets
    pub scraper: ScraperConfig,

    /// Health and metrics server
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: LogFormat::Pretty,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse `key` when set; a present but malformed value is an error
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}"))
        })
        .transpose()
}

fn parse_engines(raw: &str) -> Result<Vec<EngineKind>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<EngineKind>()
                .map_err(|e| anyhow::anyhow!("invalid engine in CRAWLQ_ENGINES: {e}"))
        })
        .collect()
}

impl Config {
    /// Load configuration from environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        // Queue
        let queue = &mut config.queue;
        if let Some(backend) = env_parse("CRAWLQ_QUEUE_BACKEND")? {
            queue.backend = backend;
        }
        if let Some(url) = env_var("DATABASE_URL") {
            queue.database_url = url;
        }
        if let Some(path) = env_var("CRAWLQ_SQLITE_PATH") {
            queue.sqlite_path = path.into();
        }
        if let Some(size) = env_parse("CRAWLQ_DB_POOL_SIZE")? {
            queue.pool_size = size;
        }
        if let Some(secs) = env_parse("CRAWLQ_STALL_THRESHOLD_SECS")? {
            queue.stall_threshold_secs = secs;
        }
        if let Some(stalls) = env_parse("CRAWLQ_MAX_STALLS")? {
            queue.max_stalls = stalls;
        }
        if let Some(secs) = env_parse("CRAWLQ_REAP_INTERVAL_SECS")? {
            queue.reap_interval_secs = secs;
        }
        if let Some(secs) = env_parse("CRAWLQ_COMPLETED_RETENTION_SECS")? {
            queue.completed_retention_secs = secs;
        }
        if let Some(secs) = env_parse("CRAWLQ_FAILED_RETENTION_SECS")? {
            queue.failed_retention_secs = secs;
        }
        if let Some(secs) = env_parse("CRAWLQ_SWEEP_INTERVAL_SECS")? {
            queue.sweep_interval_secs = secs;
        }

        // Coordination
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.store.redis_url = url;
        }
        if let Some(size) = env_parse("CRAWLQ_REDIS_POOL_SIZE")? {
            config.store.pool_size = size;
        }
        if let Some(secs) = env_parse("CRAWLQ_CRAWL_TTL_SECS")? {
            config.coordinator.ttl_secs = secs;
        }
        if let Some(policy) = env_parse("CRAWLQ_FAILED_URL_POLICY")? {
            config.coordinator.failed_url_policy = policy;
        }
        if let Some(n) = env_parse("CRAWLQ_LOCK_CONCURRENCY")? {
            config.coordinator.lock_concurrency = n;
        }

        // Worker
        if let Some(n) = env_parse("CRAWLQ_CONCURRENCY")? {
            config.worker.concurrency = n;
        }
        if let Some(ms) = env_parse("CRAWLQ_POLL_INTERVAL_MS")? {
            config.worker.poll_interval_ms = ms;
        }
        if let Some(secs) = env_parse("CRAWLQ_LEASE_RENEWAL_SECS")? {
            config.worker.lease_renewal_secs = secs;
        }

        // Scraper
        let scraper = &mut config.scraper;
        if let Some(raw) = env_var("CRAWLQ_ENGINES") {
            scraper.engines = parse_engines(&raw)?;
        }
        if let Some(url) = env_var("CRAWLQ_PLAYWRIGHT_URL") {
            scraper.playwright_url = Some(url);
        }
        if let Some(url) = env_var("CRAWLQ_BROWSER_URL") {
            scraper.browser_url = Some(url);
        }
        if let Some(rps) = env_parse("CRAWLQ_REQUESTS_PER_SECOND")? {
            scraper.requests_per_second = rps;
        }
        if let Some(secs) = env_parse("CRAWLQ_SCRAPE_DEADLINE_SECS")? {
            scraper.deadline_secs = secs;
        }
        if let Some(secs) = env_parse("CRAWLQ_ATTEMPT_TIMEOUT_SECS")? {
            scraper.attempt_timeout_secs = secs;
        }
        if let Some(len) = env_parse("CRAWLQ_MIN_CONTENT_LENGTH")? {
            scraper.min_content_length = len;
        }
        if let Some(ua) = env_var("CRAWLQ_USER_AGENT") {
            scraper.user_agent = ua;
        }

        // Server
        if let Some(enabled) = env_parse("CRAWLQ_SERVER_ENABLED")? {
            config.server.enabled = enabled;
        }
        if let Some(addr) = env_parse("CRAWLQ_BIND_ADDRESS")? {
            config.server.bind_address = addr;
        }

        // Logging
        if let Some(level) = env_var("CRAWLQ_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(format) = env_parse("CRAWLQ_LOG_FORMAT")? {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let queue = &self.queue;
        if queue.pool_size == 0 {
            anyhow::bail!("queue.pool_size must be greater than 0");
        }
        if queue.reap_interval_secs == 0 || queue.sweep_interval_secs == 0 {
            anyhow::bail!("queue maintenance intervals must be greater than 0");
        }
        if queue.max_stalls == 0 {
            anyhow::bail!("queue.max_stalls must be greater than 0");
        }
        if queue.failed_retention_secs < queue.completed_retention_secs {
            anyhow::bail!(
                "queue.failed_retention_secs ({}) must not be shorter than completed_retention_secs ({})",
                queue.failed_retention_secs,
                queue.completed_retention_secs
            );
        }

        let worker = &self.worker;
        if worker.concurrency == 0 {
            anyhow::bail!("worker.concurrency must be greater than 0");
        }
        if worker.poll_interval_ms == 0 {
            anyhow::bail!("worker.poll_interval_ms must be greater than 0");
        }
        if worker.lease_renewal_secs == 0 {
            anyhow::bail!("worker.lease_renewal_secs must be greater than 0");
        }
        if queue.stall_threshold_secs <= worker.lease_renewal_secs {
            anyhow::bail!(
                "queue.stall_threshold_secs ({}) must be larger than worker.lease_renewal_secs ({})",
                queue.stall_threshold_secs,
                worker.lease_renewal_secs
            );
        }

        if self.coordinator.ttl_secs == 0 {
            anyhow::bail!("coordinator.ttl_secs must be greater than 0");
        }
        if self.coordinator.lock_concurrency == 0 {
            anyhow::bail!("coordinator.lock_concurrency must be greater than 0");
        }

        let scraper = &self.scraper;
        if scraper.engines.is_empty() {
            anyhow::bail!("scraper.engines must name at least one engine");
        }
        if scraper.requests_per_second == 0 {
            anyhow::bail!("scraper.requests_per_second must be greater than 0");
        }
        if scraper.deadline_secs == 0 || scraper.attempt_timeout_secs == 0 {
            anyhow::bail!("scraper deadlines must be greater than 0");
        }

        Ok(())
    }
}
