//! Test fixtures for integration tests
//!
//! Provides sample pages and helpers that wire a worker to an in-memory
//! stack.

use std::sync::Arc;
use std::time::Duration;

use crawlq::crawl::{
    CoordinatorConfig, CrawlCoordinator, CrawlerOptions, MemoryStore, SitemapFetcher,
    StoredCrawl,
};
use crawlq::queue::{JobPayload, JobQueue, KickoffJob, SharedJobQueue, SqliteJobQueue};
use crawlq::scraper::{EngineKind, PageOptions, ScrapePipeline, ScraperConfig};
use crawlq::utils::RetryConfig;
use crawlq::worker::{Worker, WorkerConfig};
use uuid::Uuid;

/// Body text long enough to clear the acceptance threshold
pub const LOREM: &str = "Crawl coordination keeps many workers from fetching the same \
page twice while still finishing every page the crawl discovered. This paragraph \
exists to give the scraper enough text to accept the page.";

/// An HTML page with a title, body text and the given links
pub fn page(title: &str, links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|href| format!(r#"<li><a href="{href}">{href}</a></li>"#))
        .collect();
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{title}</title>
    <meta name="description" content="{title} description">
</head>
<body>
    <main>
        <h1>{title}</h1>
        <p>{LOREM}</p>
        <ul>{anchors}</ul>
    </main>
</body>
</html>"#
    )
}

/// A page below the acceptance threshold
pub const THIN_PAGE: &str = "<html><body><p>hi</p></body></html>";

/// `<urlset>` listing `urls`
pub fn sitemap(urls: &[String]) -> String {
    let entries: String = urls
        .iter()
        .map(|u| format!("<url><loc>{u}</loc></url>"))
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{entries}</urlset>"#
    )
}

/// Fetch-only scraper with short budgets
pub fn scraper_config() -> ScraperConfig {
    ScraperConfig {
        engines: vec![EngineKind::Fetch],
        requests_per_second: 1000,
        deadline_secs: 10,
        attempt_timeout_secs: 5,
        ..Default::default()
    }
}

/// Worker over an in-memory SQLite queue and an in-memory store
pub fn test_worker(coordinator_config: CoordinatorConfig) -> Worker {
    let queue: SharedJobQueue = Arc::new(SqliteJobQueue::in_memory().unwrap());
    let coordinator = CrawlCoordinator::new(Arc::new(MemoryStore::new()), coordinator_config);
    let pipeline = ScrapePipeline::from_config(&scraper_config())
        .unwrap()
        .into_shared();
    let sitemaps = SitemapFetcher::new("crawlq-test", Duration::from_secs(5)).unwrap();
    let config = WorkerConfig {
        concurrency: 2,
        poll_interval_ms: 20,
        lease_renewal_secs: 5,
        report_retry: RetryConfig::with_delays(2, 1, 10),
    };
    Worker::new(queue, coordinator, pipeline, sitemaps, config)
}

/// Save a crawl and enqueue its kickoff; returns (crawl id, kickoff job id)
pub async fn start_crawl(worker: &Worker, origin: &str, options: CrawlerOptions) -> (Uuid, Uuid) {
    let crawl = StoredCrawl::new(origin, "team-test", options, PageOptions::default());
    let crawl_id = Uuid::new_v4();
    let kickoff_id = Uuid::new_v4();

    worker.coordinator().save_crawl(crawl_id, &crawl).await.unwrap();
    worker
        .queue()
        .add_job(
            kickoff_id,
            JobPayload::Kickoff(KickoffJob {
                crawl_id,
                team_id: crawl.team_id.clone(),
                url: crawl.origin_url.clone(),
            }),
        )
        .await
        .unwrap();

    (crawl_id, kickoff_id)
}

/// Process queued jobs one at a time until the queue is empty
pub async fn drain(worker: &Worker) -> Vec<Uuid> {
    let mut processed = Vec::new();
    while let Some(id) = worker.process_next().await.unwrap() {
        processed.push(id);
        assert!(processed.len() < 100, "queue never drained");
    }
    processed
}
