//! Prometheus metrics for the queue, the crawl coordinator and the scrape pipeline
//!
//! This module provides metrics tracking for:
//! - Queue: enqueued/claimed/finished jobs, lease renewals, reaper and sweeper passes
//! - Crawls: started/finished/cancelled crawls, URL lock outcomes, filtered links
//! - Scraping: per-engine attempts and pipeline verdicts
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram_vec, Counter,
    CounterVec, Encoder, GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for job queue metrics
struct QueueMetrics {
    jobs_enqueued: CounterVec,
    jobs_claimed: CounterVec,
    jobs_finished: CounterVec,
    job_duration: HistogramVec,
    lease_renewals: CounterVec,
    jobs_reaped: CounterVec,
    jobs_swept: Counter,
    queue_depth: GaugeVec,
}

/// Container for crawl coordination metrics
struct CrawlMetrics {
    crawls_started: Counter,
    crawls_finished: Counter,
    crawls_cancelled: Counter,
    url_locks: CounterVec,
    links_filtered: CounterVec,
}

/// Container for scrape pipeline metrics
struct ScrapeMetrics {
    engine_attempts: CounterVec,
    scrapes: CounterVec,
    scrape_duration: HistogramVec,
}

static QUEUE_METRICS: OnceLock<QueueMetrics> = OnceLock::new();

static CRAWL_METRICS: OnceLock<CrawlMetrics> = OnceLock::new();

static SCRAPE_METRICS: OnceLock<ScrapeMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers anything.
/// If registration fails the error is returned and every recording helper
/// stays a no-op.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = crawlq::metrics::init_metrics() {
///     tracing::warn!(error = %e, "Metrics initialization failed");
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let queue = QueueMetrics {
        jobs_enqueued: register_counter_vec!(
            "crawlq_jobs_enqueued_total",
            "Total jobs added to the queue by kind",
            &["kind"]
        )?,
        jobs_claimed: register_counter_vec!(
            "crawlq_jobs_claimed_total",
            "Total jobs claimed by workers by kind",
            &["kind"]
        )?,
        jobs_finished: register_counter_vec!(
            "crawlq_jobs_finished_total",
            "Total jobs ended by kind and terminal status",
            &["kind", "status"]
        )?,
        job_duration: register_histogram_vec!(
            "crawlq_job_duration_seconds",
            "Time from claim to end of a job in seconds",
            &["kind"],
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
        )?,
        lease_renewals: register_counter_vec!(
            "crawlq_lease_renewals_total",
            "Lease renewal attempts by outcome",
            &["outcome"]
        )?,
        jobs_reaped: register_counter_vec!(
            "crawlq_jobs_reaped_total",
            "Stalled jobs recovered by the reaper by outcome",
            &["outcome"]
        )?,
        jobs_swept: register_counter!(
            "crawlq_jobs_swept_total",
            "Terminal jobs deleted by the retention sweep"
        )?,
        queue_depth: register_gauge_vec!(
            "crawlq_queue_jobs",
            "Jobs currently stored by status",
            &["status"]
        )?,
    };

    let crawl = CrawlMetrics {
        crawls_started: register_counter!("crawlq_crawls_started_total", "Total crawls started")?,
        crawls_finished: register_counter!(
            "crawlq_crawls_finished_total",
            "Total crawls that reached completion"
        )?,
        crawls_cancelled: register_counter!(
            "crawlq_crawls_cancelled_total",
            "Total crawls cancelled"
        )?,
        url_locks: register_counter_vec!(
            "crawlq_url_locks_total",
            "URL lock attempts by outcome",
            &["outcome"]
        )?,
        links_filtered: register_counter_vec!(
            "crawlq_links_filtered_total",
            "Discovered links rejected by the link filter by reason",
            &["reason"]
        )?,
    };

    let scrape = ScrapeMetrics {
        engine_attempts: register_counter_vec!(
            "crawlq_engine_attempts_total",
            "Scrape engine attempts by engine and outcome",
            &["engine", "outcome"]
        )?,
        scrapes: register_counter_vec!(
            "crawlq_scrapes_total",
            "Scrape pipeline runs by verdict",
            &["verdict"]
        )?,
        scrape_duration: register_histogram_vec!(
            "crawlq_scrape_duration_seconds",
            "Scrape pipeline duration in seconds by verdict",
            &["verdict"],
            vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0]
        )?,
    };

    QUEUE_METRICS.set(queue).map_err(|_| "Queue metrics already initialized")?;
    CRAWL_METRICS.set(crawl).map_err(|_| "Crawl metrics already initialized")?;
    SCRAPE_METRICS.set(scrape).map_err(|_| "Scrape metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    QUEUE_METRICS.get().is_some() && CRAWL_METRICS.get().is_some() && SCRAPE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

// ----------------------------------------------------------------------------
// Queue
// ----------------------------------------------------------------------------

/// Record jobs added to the queue
pub fn record_jobs_enqueued(kind: &str, count: usize) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.jobs_enqueued
            .with_label_values(&[kind])
            .inc_by(count as f64);
    }
}

/// Record a successful claim
pub fn record_job_claimed(kind: &str) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.jobs_claimed.with_label_values(&[kind]).inc();
    }
}

/// Record a job reaching a terminal status
pub fn record_job_finished(kind: &str, status: &str) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.jobs_finished.with_label_values(&[kind, status]).inc();
    }
}

/// Start a job timer (records when the handle drops)
pub fn start_job_timer(kind: &str) -> MetricsTimer {
    match QUEUE_METRICS.get() {
        Some(m) => MetricsTimer::new(m.job_duration.with_label_values(&[kind]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

/// Record a lease renewal attempt (`renewed`, `lost` or `error`)
pub fn record_lease_renewal(outcome: &str) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.lease_renewals.with_label_values(&[outcome]).inc();
    }
}

/// Record one stall reaper pass
pub fn record_reap(requeued: usize, failed: usize) {
    let Some(m) = QUEUE_METRICS.get() else {
        return;
    };

    if requeued > 0 {
        m.jobs_reaped
            .with_label_values(&["requeued"])
            .inc_by(requeued as f64);
    }
    if failed > 0 {
        m.jobs_reaped
            .with_label_values(&["failed"])
            .inc_by(failed as f64);
    }
}

/// Record rows deleted by the retention sweep
pub fn record_swept(deleted: u64) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.jobs_swept.inc_by(deleted as f64);
    }
}

/// Update per-status queue gauges
pub fn update_queue_depth(queued: u64, active: u64, completed: u64, failed: u64) {
    let Some(m) = QUEUE_METRICS.get() else {
        return;
    };

    for (status, value) in [
        ("queued", queued),
        ("active", active),
        ("completed", completed),
        ("failed", failed),
    ] {
        m.queue_depth.with_label_values(&[status]).set(value as f64);
    }
}

// ----------------------------------------------------------------------------
// Crawls
// ----------------------------------------------------------------------------

pub fn record_crawl_started() {
    if let Some(m) = CRAWL_METRICS.get() {
        m.crawls_started.inc();
    }
}

pub fn record_crawl_finished() {
    if let Some(m) = CRAWL_METRICS.get() {
        m.crawls_finished.inc();
    }
}

pub fn record_crawl_cancelled() {
    if let Some(m) = CRAWL_METRICS.get() {
        m.crawls_cancelled.inc();
    }
}

/// Record a URL lock attempt
pub fn record_url_lock(outcome: &str) {
    if let Some(m) = CRAWL_METRICS.get() {
        m.url_locks.with_label_values(&[outcome]).inc();
    }
}

/// Record a link rejected by the link filter
pub fn record_link_filtered(reason: &str) {
    if let Some(m) = CRAWL_METRICS.get() {
        m.links_filtered.with_label_values(&[reason]).inc();
    }
}

// ----------------------------------------------------------------------------
// Scraping
// ----------------------------------------------------------------------------

/// Record one engine attempt inside the fallback pipeline
pub fn record_engine_attempt(engine: &str, outcome: &str) {
    if let Some(m) = SCRAPE_METRICS.get() {
        m.engine_attempts
            .with_label_values(&[engine, outcome])
            .inc();
    }
}

/// Record a finished pipeline run
pub fn record_scrape(verdict: &str, duration_secs: f64) {
    let Some(m) = SCRAPE_METRICS.get() else {
        return;
    };

    m.scrapes.with_label_values(&[verdict]).inc();
    m.scrape_duration
        .with_label_values(&[verdict])
        .observe(duration_secs);
}

// ============================================================================
// Tests
// ============================================================================
