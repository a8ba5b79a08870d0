//! Crawl coordinator integration tests
//!
//! Many tasks share one coordinator the way worker loops share it, and the
//! assertions are about what exactly one of them may win.

use std::sync::Arc;

use crawlq::crawl::{
    CoordinatorConfig, CrawlCoordinator, CrawlerOptions, FailedUrlPolicy, JobDone, MemoryStore,
    RedirectOutcome, StoredCrawl, UrlLock,
};
use crawlq::scraper::PageOptions;
use uuid::Uuid;

fn coordinator(policy: FailedUrlPolicy) -> CrawlCoordinator {
    CrawlCoordinator::new(
        Arc::new(MemoryStore::new()),
        CoordinatorConfig {
            failed_url_policy: policy,
            ..Default::default()
        },
    )
}

async fn saved_crawl(coordinator: &CrawlCoordinator, limit: u64) -> (Uuid, StoredCrawl) {
    let crawl = StoredCrawl::new(
        "https://example.com/",
        "team",
        CrawlerOptions {
            limit,
            ..Default::default()
        },
        PageOptions::default(),
    );
    let id = Uuid::new_v4();
    coordinator.save_crawl(id, &crawl).await.unwrap();
    (id, crawl)
}

#[tokio::test]
async fn test_one_winner_among_equivalent_urls() {
    let coordinator = coordinator(FailedUrlPolicy::Retain);
    let (id, crawl) = saved_crawl(&coordinator, 100).await;

    let variants = [
        "https://example.com/docs",
        "http://example.com/docs/",
        "https://www.example.com/docs",
        "http://www.example.com/docs/index.html",
    ];

    let mut handles = Vec::new();
    for i in 0..16 {
        let coordinator = coordinator.clone();
        let crawl = crawl.clone();
        let url = variants[i % variants.len()].to_string();
        handles.push(tokio::spawn(async move {
            coordinator.lock_url(id, &crawl, &url).await.unwrap()
        }));
    }

    let mut locked = 0;
    for handle in handles {
        match handle.await.unwrap() {
            UrlLock::Locked => locked += 1,
            UrlLock::AlreadyLocked => {}
            UrlLock::LimitReached => panic!("limit should not be reached"),
        }
    }
    assert_eq!(locked, 1);
}

#[tokio::test]
async fn test_limit_bounds_locked_pages() {
    let coordinator = coordinator(FailedUrlPolicy::Retain);
    let (id, crawl) = saved_crawl(&coordinator, 3).await;

    let candidates: Vec<String> = (0..10)
        .map(|i| format!("https://example.com/page-{i}"))
        .collect();
    let locked = coordinator
        .lock_urls_individually(id, &crawl, &candidates)
        .await
        .unwrap();
    assert_eq!(locked.len(), 3);

    let extra = coordinator
        .lock_url(id, &crawl, "https://example.com/another")
        .await
        .unwrap();
    assert_eq!(extra, UrlLock::LimitReached);
}

#[tokio::test]
async fn test_released_failure_frees_a_slot() {
    let coordinator = coordinator(FailedUrlPolicy::Release);
    let (id, crawl) = saved_crawl(&coordinator, 1).await;

    let first = "https://example.com/first";
    assert_eq!(
        coordinator.lock_url(id, &crawl, first).await.unwrap(),
        UrlLock::Locked
    );
    assert_eq!(
        coordinator
            .lock_url(id, &crawl, "https://example.com/second")
            .await
            .unwrap(),
        UrlLock::LimitReached
    );

    let job = Uuid::new_v4();
    coordinator.add_crawl_job(id, job).await.unwrap();
    coordinator
        .add_crawl_job_done(id, Some(&crawl), job, JobDone::Failed, Some(first))
        .await
        .unwrap();

    assert_eq!(
        coordinator
            .lock_url(id, &crawl, "https://example.com/second")
            .await
            .unwrap(),
        UrlLock::Locked
    );
    // Discovery dedup is untouched by the release
    assert_eq!(
        coordinator.lock_url(id, &crawl, first).await.unwrap(),
        UrlLock::AlreadyLocked
    );
}

#[tokio::test]
async fn test_concurrent_redirects_to_one_target() {
    let coordinator = coordinator(FailedUrlPolicy::Retain);
    let (id, crawl) = saved_crawl(&coordinator, 100).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let coordinator = coordinator.clone();
        let crawl = crawl.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .claim_redirect(
                    id,
                    &crawl,
                    &format!("https://example.com/old-{i}"),
                    "https://example.com/new",
                    false,
                )
                .await
                .unwrap()
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    let claimed = outcomes
        .iter()
        .filter(|o| **o == RedirectOutcome::Claimed)
        .count();
    let raced = outcomes
        .iter()
        .filter(|o| **o == RedirectOutcome::Raced)
        .count();
    assert_eq!(claimed, 1);
    assert_eq!(raced, 7);
}

#[tokio::test]
async fn test_finish_is_won_exactly_once() {
    let coordinator = coordinator(FailedUrlPolicy::Retain);
    let (id, crawl) = saved_crawl(&coordinator, 100).await;

    let jobs: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
    coordinator.add_crawl_jobs(id, &jobs).await.unwrap();
    coordinator.finish_crawl_kickoff(id).await.unwrap();

    for (i, job) in jobs.iter().enumerate() {
        assert!(!coordinator.is_crawl_finished(id).await.unwrap());
        let done = if i == 0 { JobDone::Dropped } else { JobDone::Succeeded };
        coordinator
            .add_crawl_job_done(id, Some(&crawl), *job, done, None)
            .await
            .unwrap();
    }
    assert!(coordinator.is_crawl_finished(id).await.unwrap());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.finish_crawl_if_needed(id).await.unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let progress = coordinator.crawl_progress(id).await.unwrap();
    assert_eq!(progress.total, 4);
    assert_eq!(progress.succeeded, 3);
    assert_eq!(progress.dropped, 1);
    assert!(progress.finished);

    let ordered = coordinator.done_jobs_ordered(id, 0, -1).await.unwrap();
    assert_eq!(ordered, jobs[1..].to_vec());
}
