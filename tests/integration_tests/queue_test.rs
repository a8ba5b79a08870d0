//! Job queue integration tests
//!
//! Durability, claim exclusivity under concurrency, lease fencing and
//! waiting, against the file-backed SQLite backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crawlq::queue::{
    JobEnd, JobPayload, JobQueue, JobStatus, LeaseToken, QueueError, ScrapeJob, SqliteJobQueue,
};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

fn scrape(url: &str) -> JobPayload {
    JobPayload::Scrape(ScrapeJob::standalone(url))
}

#[tokio::test]
async fn test_jobs_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.db");
    let id = Uuid::new_v4();

    {
        let queue = SqliteJobQueue::new(&path).unwrap();
        queue.add_job(id, scrape("https://example.com/a")).await.unwrap();
    }

    let queue = SqliteJobQueue::new(&path).unwrap();
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.payload.url(), "https://example.com/a");

    let claimed = queue
        .get_job_to_process(LeaseToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, JobStatus::Active);
}

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() {
    let queue = Arc::new(SqliteJobQueue::in_memory().unwrap());
    let jobs: Vec<(Uuid, JobPayload)> = (0..20)
        .map(|i| (Uuid::new_v4(), scrape(&format!("https://example.com/{i}"))))
        .collect();
    assert_eq!(queue.add_jobs(jobs).await.unwrap(), 20);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = queue.get_job_to_process(LeaseToken::new()).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<Uuid> = all.iter().copied().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.active, 20);
    assert_eq!(counts.queued, 0);
}

#[tokio::test]
async fn test_stale_lease_cannot_end_job() {
    let queue = SqliteJobQueue::in_memory().unwrap();
    let id = Uuid::new_v4();
    queue.add_job(id, scrape("https://example.com")).await.unwrap();

    let first = LeaseToken::new();
    queue.get_job_to_process(first).await.unwrap().unwrap();

    // The reaper hands the job to a second claimant
    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = queue.reap_stalled(Duration::ZERO, 3).await.unwrap();
    assert_eq!(report.requeued, vec![id]);
    let second = LeaseToken::new();
    queue.get_job_to_process(second).await.unwrap().unwrap();

    assert!(!queue.renew_lease(id, first).await.unwrap());
    assert!(!queue
        .end_job(id, first, JobEnd::completed(json!({"from": "first"})))
        .await
        .unwrap());

    assert!(queue.renew_lease(id, second).await.unwrap());
    assert!(queue
        .end_job(id, second, JobEnd::completed(json!({"from": "second"})))
        .await
        .unwrap());

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.unwrap()["from"], "second");
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn test_wait_for_job_across_tasks() {
    let queue = Arc::new(SqliteJobQueue::in_memory().unwrap());
    let id = Uuid::new_v4();
    queue.add_job(id, scrape("https://example.com")).await.unwrap();

    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.wait_for_job(&id.to_string(), Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    let lease = LeaseToken::new();
    queue.get_job_to_process(lease).await.unwrap().unwrap();
    queue
        .end_job(id, lease, JobEnd::failed("boom"))
        .await
        .unwrap();

    let status = waiter.await.unwrap().unwrap();
    assert_eq!(status, JobStatus::Failed);

    // Already terminal: resolves without another notification
    let again = queue
        .wait_for_job(&id.to_string(), Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(again, JobStatus::Failed);
}

#[tokio::test]
async fn test_reaper_failure_wakes_waiters() {
    let queue = Arc::new(SqliteJobQueue::in_memory().unwrap());
    let id = Uuid::new_v4();
    queue.add_job(id, scrape("https://example.com")).await.unwrap();

    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.wait_for_job(&id.to_string(), Duration::from_secs(5)).await })
    };

    // max_stalls 1: requeued once, failed on the second stall
    for expected_failed in [false, true] {
        queue
            .get_job_to_process(LeaseToken::new())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = queue.reap_stalled(Duration::ZERO, 1).await.unwrap();
        assert_eq!(report.failed.contains(&id), expected_failed);
    }

    assert_eq!(waiter.await.unwrap().unwrap(), JobStatus::Failed);
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.stall_count, 2);
    assert!(job.error.is_some());
}

#[tokio::test]
async fn test_wait_for_job_errors() {
    let queue = SqliteJobQueue::in_memory().unwrap();

    let err = queue
        .wait_for_job("not-a-uuid", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidId(_)));

    let id = Uuid::new_v4();
    queue.add_job(id, scrape("https://example.com")).await.unwrap();
    let err = queue
        .wait_for_job(&id.to_string(), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::TimedOut { .. }));
}
