//! End-to-end worker tests
//!
//! A crawl is started the way the CLI starts one, then the worker drains the
//! queue against a mocked site.

use std::time::Duration;

use crawlq::crawl::{CoordinatorConfig, CrawlerOptions, FailedUrlPolicy, SitemapPolicy};
use crawlq::queue::{JobPayload, JobQueue, JobStatus};
use serde_json::Value;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::fixtures::{drain, page, sitemap, start_crawl, test_worker, THIN_PAGE};

async fn mount_page(server: &MockServer, at: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/html"))
        .mount(server)
        .await;
}

fn skip_sitemap() -> CrawlerOptions {
    CrawlerOptions {
        sitemap: SitemapPolicy::Skip,
        ..Default::default()
    }
}

// ============================================================================
// Complete crawl
// ============================================================================

#[tokio::test]
async fn test_crawl_discovers_links_and_finishes() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "/",
        page("Home", &["/a", "/b", "/c", "/private/x", "mailto:team@example.com"]),
    )
    .await;
    mount_page(&server, "/a", page("A", &["/", "/b"])).await;
    mount_page(&server, "/b", page("B", &["/a"])).await;
    mount_page(&server, "/c", page("C", &[])).await;
    Mock::given(method("GET"))
        .and(path("/private/x"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let worker = test_worker(CoordinatorConfig::default());
    let options = CrawlerOptions {
        exclude_paths: vec!["^/private".to_string()],
        ..skip_sitemap()
    };
    let origin = format!("{}/", server.uri());
    let (crawl_id, kickoff_id) = start_crawl(&worker, &origin, options).await;

    let processed = drain(&worker).await;
    // kickoff + seed + a, b, c
    assert_eq!(processed.len(), 5);

    let kickoff = worker.queue().get_job(kickoff_id).await.unwrap().unwrap();
    assert_eq!(kickoff.status, JobStatus::Completed);
    let summary = kickoff.result.unwrap();
    assert_eq!(summary["seeded"], true);
    assert_eq!(summary["enqueued"], 1);

    let progress = worker.coordinator().crawl_progress(crawl_id).await.unwrap();
    assert_eq!(progress.total, 4);
    assert_eq!(progress.succeeded, 4);
    assert_eq!(progress.failed, 0);
    assert_eq!(progress.dropped, 0);
    assert!(progress.kickoff_finished);
    assert!(progress.finished);

    let ordered = worker
        .coordinator()
        .done_jobs_ordered(crawl_id, 0, -1)
        .await
        .unwrap();
    assert_eq!(ordered.len(), 4);

    // Every member job is completed with the scraped document
    let mut titles = Vec::new();
    for id in ordered {
        let job = worker.queue().get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let result = job.result.unwrap();
        titles.push(result["metadata"]["title"].as_str().unwrap().to_string());
    }
    titles.sort();
    assert_eq!(titles, vec!["A", "B", "C", "Home"]);

    let counts = worker.queue().counts().await.unwrap();
    assert_eq!(counts.completed, 5);
    assert_eq!(counts.queued, 0);
}

#[tokio::test]
async fn test_sitemap_urls_are_seeded() {
    let server = MockServer::start().await;
    let uri = server.uri();
    mount_page(&server, "/", page("Home", &[])).await;
    mount_page(&server, "/s1", page("S1", &[])).await;
    mount_page(&server, "/s2", page("S2", &[])).await;
    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sitemap(&[format!("{uri}/s1"), format!("{uri}/s2"), format!("{uri}/")]),
            "application/xml",
        ))
        .mount(&server)
        .await;

    let worker = test_worker(CoordinatorConfig::default());
    let (crawl_id, kickoff_id) =
        start_crawl(&worker, &format!("{uri}/"), CrawlerOptions::default()).await;

    drain(&worker).await;

    let kickoff = worker.queue().get_job(kickoff_id).await.unwrap().unwrap();
    let summary = kickoff.result.unwrap();
    assert_eq!(summary["sitemap_urls"], 3);
    // The origin listed in the sitemap is already locked by the seed
    assert_eq!(summary["enqueued"], 3);

    let progress = worker.coordinator().crawl_progress(crawl_id).await.unwrap();
    assert_eq!(progress.total, 3);
    assert_eq!(progress.succeeded, 3);
    assert!(progress.finished);
}

// ============================================================================
// Redirects
// ============================================================================

#[tokio::test]
async fn test_redirect_race_drops_second_job() {
    let server = MockServer::start().await;
    mount_page(&server, "/", page("Home", &["/a", "/b"])).await;
    for from in ["/a", "/b"] {
        Mock::given(method("GET"))
            .and(path(from))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/moved"))
            .mount(&server)
            .await;
    }
    mount_page(&server, "/moved", page("Moved", &[])).await;

    let worker = test_worker(CoordinatorConfig::default());
    let (crawl_id, _) = start_crawl(&worker, &format!("{}/", server.uri()), skip_sitemap()).await;

    let processed = drain(&worker).await;
    assert_eq!(processed.len(), 4);

    let mut dropped = 0;
    for id in processed {
        let job = worker.queue().get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        if job.result.as_ref().and_then(|r| r.get("dropped")) == Some(&Value::from("raced_redirect"))
        {
            dropped += 1;
        }
    }
    assert_eq!(dropped, 1);

    let progress = worker.coordinator().crawl_progress(crawl_id).await.unwrap();
    assert_eq!(progress.total, 3);
    assert_eq!(progress.succeeded, 2);
    assert_eq!(progress.dropped, 1);
    assert!(progress.finished);
}

// ============================================================================
// Failures and cancellation
// ============================================================================

#[tokio::test]
async fn test_terminal_page_succeeds_thin_page_fails() {
    let server = MockServer::start().await;
    mount_page(&server, "/", page("Home", &["/gone", "/thin"])).await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_raw(page("Not Found", &[]), "text/html"))
        .mount(&server)
        .await;
    mount_page(&server, "/thin", THIN_PAGE.to_string()).await;

    let worker = test_worker(CoordinatorConfig {
        failed_url_policy: FailedUrlPolicy::Release,
        ..Default::default()
    });
    let (crawl_id, _) = start_crawl(&worker, &format!("{}/", server.uri()), skip_sitemap()).await;

    let processed = drain(&worker).await;
    assert_eq!(processed.len(), 4);

    let mut statuses = Vec::new();
    for id in &processed {
        let job = worker.queue().get_job(*id).await.unwrap().unwrap();
        if let JobPayload::Scrape(scrape) = &job.payload {
            if scrape.url.ends_with("/thin") {
                assert_eq!(job.status, JobStatus::Failed);
                assert!(job.error.unwrap().contains("fetch returned status 200"));
            }
            if scrape.url.ends_with("/gone") {
                assert_eq!(job.status, JobStatus::Completed);
                assert_eq!(job.result.unwrap()["metadata"]["status_code"], 404);
            }
        }
        statuses.push(job.status);
    }
    assert_eq!(statuses.iter().filter(|s| **s == JobStatus::Failed).count(), 1);

    let progress = worker.coordinator().crawl_progress(crawl_id).await.unwrap();
    assert_eq!(progress.total, 3);
    assert_eq!(progress.succeeded, 2);
    assert_eq!(progress.failed, 1);
    assert!(progress.finished);
}

#[tokio::test]
async fn test_cancelled_crawl_skips_queued_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(page("Home", &[]), "text/html"))
        .expect(0)
        .mount(&server)
        .await;

    let worker = test_worker(CoordinatorConfig::default());
    let (crawl_id, kickoff_id) =
        start_crawl(&worker, &format!("{}/", server.uri()), skip_sitemap()).await;

    // Kickoff only: the seed job is now queued
    assert_eq!(worker.process_next().await.unwrap(), Some(kickoff_id));
    assert!(worker.coordinator().cancel_crawl(crawl_id).await.unwrap());

    let seed_id = worker.process_next().await.unwrap().unwrap();
    let seed = worker.queue().get_job(seed_id).await.unwrap().unwrap();
    assert_eq!(seed.status, JobStatus::Completed);
    assert_eq!(seed.result.unwrap()["dropped"], "crawl_cancelled");

    let progress = worker.coordinator().crawl_progress(crawl_id).await.unwrap();
    assert!(progress.cancelled);
    assert_eq!(progress.dropped, 1);
    assert!(progress.finished);
}

// ============================================================================
// Worker loops
// ============================================================================

#[tokio::test]
async fn test_running_worker_completes_crawl() {
    let server = MockServer::start().await;
    mount_page(&server, "/", page("Home", &["/a", "/b"])).await;
    mount_page(&server, "/a", page("A", &[])).await;
    mount_page(&server, "/b", page("B", &[])).await;

    let worker = test_worker(CoordinatorConfig::default());
    let (crawl_id, kickoff_id) =
        start_crawl(&worker, &format!("{}/", server.uri()), skip_sitemap()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.clone().run(shutdown_rx));

    let status = worker
        .queue()
        .wait_for_job(&kickoff_id.to_string(), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Completed);

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let progress = worker.coordinator().crawl_progress(crawl_id).await.unwrap();
            if progress.finished {
                return progress;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("crawl did not finish");
    assert_eq!(finished.total, 3);
    assert_eq!(finished.succeeded, 3);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
