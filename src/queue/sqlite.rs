//! SQLite job queue for single-node deployments and tests
//!
//! All statements run under one `Mutex<Connection>`, which makes every claim
//! exclusive. Timestamps are stored as unix milliseconds.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::error::QueueError;
use super::job::{Job, JobEnd, JobPayload, JobStatus, LeaseToken, QueueCounts, ReapReport};
use super::notify::{JobNotification, JobNotifications};
use super::JobQueue;

const SELECT_COLUMNS: &str = "id, status, payload, created_at, lease_token, lease_time, \
     stall_count, result, error, finished_at";

const STALLED_ERROR: &str = "job stalled too many times";

/// Raw column values before payload validation
struct JobRow {
    id: String,
    status: String,
    payload: String,
    created_at: i64,
    lease_token: Option<String>,
    lease_time: Option<i64>,
    stall_count: i32,
    result: Option<String>,
    error: Option<String>,
    finished_at: Option<i64>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            payload: row.get(2)?,
            created_at: row.get(3)?,
            lease_token: row.get(4)?,
            lease_time: row.get(5)?,
            stall_count: row.get(6)?,
            result: row.get(7)?,
            error: row.get(8)?,
            finished_at: row.get(9)?,
        })
    }

    fn into_job(self) -> Result<Job, QueueError> {
        let id = Uuid::parse_str(&self.id).map_err(|_| QueueError::InvalidId(self.id.clone()))?;
        let payload: serde_json::Value = serde_json::from_str(&self.payload)?;
        let lease_token = self
            .lease_token
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|_| QueueError::InvalidId(self.lease_token.clone().unwrap_or_default()))?;

        Ok(Job {
            id,
            status: self.status.parse()?,
            payload: JobPayload::from_stored(id, payload)?,
            created_at: from_millis(self.created_at),
            lease_token: lease_token.map(LeaseToken::from),
            lease_time: self.lease_time.map(from_millis),
            stall_count: self.stall_count,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()?,
            error: self.error,
            finished_at: self.finished_at.map(from_millis),
        })
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// SQLite-backed [`JobQueue`]
pub struct SqliteJobQueue {
    conn: Mutex<Connection>,
    notifications: JobNotifications,
}

impl SqliteJobQueue {
    /// Open (or create) a database file
    pub fn new(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    /// In-memory database, used by tests
    pub fn in_memory() -> Result<Self, QueueError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, QueueError> {
        let queue = Self {
            conn: Mutex::new(conn),
            notifications: JobNotifications::default(),
        };
        queue.create_schema()?;
        Ok(queue)
    }

    fn create_schema(&self) -> Result<(), QueueError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS crawlq_jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'queued',
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                lease_token TEXT,
                lease_time INTEGER,
                stall_count INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                error TEXT,
                finished_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_crawlq_jobs_claim
                ON crawlq_jobs(status, created_at, seq);

            CREATE INDEX IF NOT EXISTS idx_crawlq_jobs_finished
                ON crawlq_jobs(status, finished_at);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn.lock().map_err(|_| QueueError::LockPoisoned)
    }

    fn insert(conn: &Connection, id: Uuid, payload: &JobPayload) -> Result<(), QueueError> {
        let payload = serde_json::to_string(payload)?;
        conn.execute(
            "INSERT INTO crawlq_jobs (id, status, payload, created_at) VALUES (?1, 'queued', ?2, ?3)",
            params![id.to_string(), payload, now_millis()],
        )?;
        Ok(())
    }

    fn select_job(conn: &Connection, id: Uuid) -> Result<Option<Job>, QueueError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM crawlq_jobs WHERE id = ?1");
        conn.query_row(&sql, params![id.to_string()], JobRow::from_row)
            .optional()?
            .map(JobRow::into_job)
            .transpose()
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn notifications(&self) -> &JobNotifications {
        &self.notifications
    }

    async fn add_job(&self, id: Uuid, payload: JobPayload) -> Result<Job, QueueError> {
        let conn = self.lock()?;
        Self::insert(&conn, id, &payload)?;
        Self::select_job(&conn, id)?.ok_or(QueueError::InvalidId(id.to_string()))
    }

    async fn add_jobs(&self, jobs: Vec<(Uuid, JobPayload)>) -> Result<usize, QueueError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for (id, payload) in &jobs {
            Self::insert(&tx, *id, payload)?;
        }
        tx.commit()?;
        Ok(jobs.len())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        let conn = self.lock()?;
        Self::select_job(&conn, id)
    }

    async fn get_job_to_process(&self, lease: LeaseToken) -> Result<Option<Job>, QueueError> {
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE crawlq_jobs
             SET status = 'active', lease_token = ?1, lease_time = ?2
             WHERE seq = (
                 SELECT seq FROM crawlq_jobs
                 WHERE status = 'queued'
                 ORDER BY created_at ASC, seq ASC
                 LIMIT 1
             )
             RETURNING {SELECT_COLUMNS}"
        );
        conn.query_row(
            &sql,
            params![lease.to_string(), now_millis()],
            JobRow::from_row,
        )
        .optional()?
        .map(JobRow::into_job)
        .transpose()
    }

    async fn renew_lease(&self, id: Uuid, lease: LeaseToken) -> Result<bool, QueueError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE crawlq_jobs SET lease_time = ?3
             WHERE id = ?1 AND status = 'active' AND lease_token = ?2",
            params![id.to_string(), lease.to_string(), now_millis()],
        )?;
        Ok(updated == 1)
    }

    async fn end_job(&self, id: Uuid, lease: LeaseToken, end: JobEnd) -> Result<bool, QueueError> {
        let status = end.status();
        let result = end.result().map(serde_json::to_string).transpose()?;
        let updated = {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE crawlq_jobs
                 SET status = ?3, lease_token = NULL, lease_time = NULL,
                     result = ?4, error = ?5, finished_at = ?6
                 WHERE id = ?1 AND status = 'active' AND lease_token = ?2",
                params![
                    id.to_string(),
                    lease.to_string(),
                    status.as_str(),
                    result,
                    end.error(),
                    now_millis()
                ],
            )?
        };

        if updated == 1 {
            self.notifications.publish(JobNotification { id, status });
        }
        Ok(updated == 1)
    }

    async fn reap_stalled(
        &self,
        threshold: Duration,
        max_stalls: u32,
    ) -> Result<ReapReport, QueueError> {
        let cutoff = now_millis() - millis(threshold);
        let max_stalls = i32::try_from(max_stalls).unwrap_or(i32::MAX);
        let mut report = ReapReport::default();

        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;

            let stalled: Vec<(String, i32)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, stall_count FROM crawlq_jobs
                     WHERE status = 'active' AND lease_time < ?1",
                )?;
                let rows = stmt.query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let now = now_millis();
            for (id, stall_count) in stalled {
                let uuid = Uuid::parse_str(&id).map_err(|_| QueueError::InvalidId(id.clone()))?;
                if stall_count < max_stalls {
                    tx.execute(
                        "UPDATE crawlq_jobs
                         SET status = 'queued', lease_token = NULL, lease_time = NULL,
                             stall_count = stall_count + 1
                         WHERE id = ?1",
                        params![id],
                    )?;
                    report.requeued.push(uuid);
                } else {
                    tx.execute(
                        "UPDATE crawlq_jobs
                         SET status = 'failed', lease_token = NULL, lease_time = NULL,
                             stall_count = stall_count + 1, error = ?2, finished_at = ?3
                         WHERE id = ?1",
                        params![id, STALLED_ERROR, now],
                    )?;
                    report.failed.push(uuid);
                }
            }

            tx.commit()?;
        }

        for id in &report.failed {
            self.notifications.publish(JobNotification {
                id: *id,
                status: JobStatus::Failed,
            });
        }
        Ok(report)
    }

    async fn sweep_retention(
        &self,
        completed: Duration,
        failed: Duration,
    ) -> Result<u64, QueueError> {
        let now = now_millis();
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM crawlq_jobs
             WHERE (status = 'completed' AND finished_at < ?1)
                OR (status = 'failed' AND finished_at < ?2)",
            params![now - millis(completed), now - millis(failed)],
        )?;
        Ok(deleted as u64)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM crawlq_jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let (status, count) = row?;
            counts.add(status.parse()?, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::{KickoffJob, ScrapeJob};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn scrape(url: &str) -> JobPayload {
        JobPayload::Scrape(ScrapeJob::standalone(url))
    }

    #[tokio::test]
    async fn test_add_and_get_job() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let id = Uuid::new_v4();

        let job = queue.add_job(id, scrape("https://a.com")).await.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.lease_token.is_none());
        assert_eq!(job.stall_count, 0);

        let fetched = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(fetched.payload, scrape("https://a.com"));
        assert!(queue.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claims_oldest_first() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queue.add_job(first, scrape("https://a.com/1")).await.unwrap();
        queue.add_job(second, scrape("https://a.com/2")).await.unwrap();

        let lease = LeaseToken::new();
        let claimed = queue.get_job_to_process(lease).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.lease_token, Some(lease));
        assert!(claimed.lease_time.is_some());

        let next = queue.get_job_to_process(LeaseToken::new()).await.unwrap().unwrap();
        assert_eq!(next.id, second);
        assert!(queue.get_job_to_process(LeaseToken::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let queue = Arc::new(SqliteJobQueue::in_memory().unwrap());
        let jobs: Vec<_> = (0..8)
            .map(|i| (Uuid::new_v4(), scrape(&format!("https://a.com/{i}"))))
            .collect();
        queue.add_jobs(jobs.clone()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..12 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.get_job_to_process(LeaseToken::new()).await.unwrap()
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                claimed.push(job.id);
            }
        }

        let unique: HashSet<_> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), 8);
        assert_eq!(unique.len(), 8);
        assert!(queue.get_job_to_process(LeaseToken::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_fencing() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let id = Uuid::new_v4();
        queue.add_job(id, scrape("https://a.com")).await.unwrap();

        let lease = LeaseToken::new();
        queue.get_job_to_process(lease).await.unwrap().unwrap();

        let stranger = LeaseToken::new();
        assert!(queue.renew_lease(id, lease).await.unwrap());
        assert!(!queue.renew_lease(id, stranger).await.unwrap());
        assert!(!queue.end_job(id, stranger, JobEnd::failed("late")).await.unwrap());

        assert!(queue
            .end_job(id, lease, JobEnd::completed(json!({"ok": true})))
            .await
            .unwrap());
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"ok": true})));
        assert!(job.lease_token.is_none());
        assert!(job.finished_at.is_some());

        // Ending twice is rejected
        assert!(!queue.end_job(id, lease, JobEnd::failed("again")).await.unwrap());
        assert!(!queue.renew_lease(id, lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_reaper_requeues_then_fails() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let id = Uuid::new_v4();
        queue
            .add_job(
                id,
                JobPayload::Kickoff(KickoffJob {
                    crawl_id: Uuid::new_v4(),
                    team_id: "team".to_string(),
                    url: "https://a.com".to_string(),
                }),
            )
            .await
            .unwrap();

        let max_stalls = 2;
        let mut seen_counts = Vec::new();
        for _ in 0..max_stalls {
            let lease = LeaseToken::new();
            queue.get_job_to_process(lease).await.unwrap().unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;

            let report = queue.reap_stalled(Duration::ZERO, max_stalls).await.unwrap();
            assert_eq!(report.requeued, vec![id]);
            assert!(report.failed.is_empty());

            // The reaped holder lost its lease
            assert!(!queue.renew_lease(id, lease).await.unwrap());

            let job = queue.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Queued);
            seen_counts.push(job.stall_count);
        }
        assert_eq!(seen_counts, vec![1, 2]);

        let mut waiter = queue.notifications().subscribe();
        queue.get_job_to_process(LeaseToken::new()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = queue.reap_stalled(Duration::ZERO, max_stalls).await.unwrap();
        assert_eq!(report.failed, vec![id]);

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.stall_count, 3);
        assert_eq!(job.error.as_deref(), Some(STALLED_ERROR));

        let notification = waiter.recv().await.unwrap();
        assert_eq!(notification.id, id);
        assert_eq!(notification.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_reaper_ignores_fresh_leases() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let id = Uuid::new_v4();
        queue.add_job(id, scrape("https://a.com")).await.unwrap();
        queue.get_job_to_process(LeaseToken::new()).await.unwrap();

        let report = queue
            .reap_stalled(Duration::from_secs(60), 3)
            .await
            .unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_job_resolves_on_end() {
        let queue = Arc::new(SqliteJobQueue::in_memory().unwrap());
        let id = Uuid::new_v4();
        queue.add_job(id, scrape("https://a.com")).await.unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .wait_for_job(&id.to_string(), Duration::from_secs(5))
                    .await
            })
        };

        let lease = LeaseToken::new();
        queue.get_job_to_process(lease).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue
            .end_job(id, lease, JobEnd::completed(json!(null)))
            .await
            .unwrap();

        let status = waiter.await.unwrap().unwrap();
        assert_eq!(status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_wait_for_already_finished_job() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let id = Uuid::new_v4();
        queue.add_job(id, scrape("https://a.com")).await.unwrap();
        let lease = LeaseToken::new();
        queue.get_job_to_process(lease).await.unwrap();
        queue.end_job(id, lease, JobEnd::failed("boom")).await.unwrap();

        let status = queue
            .wait_for_job(&id.to_string(), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_wait_for_job_times_out() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let id = Uuid::new_v4();
        queue.add_job(id, scrape("https://a.com")).await.unwrap();

        let err = queue
            .wait_for_job(&id.to_string(), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_retention_sweep() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let done = Uuid::new_v4();
        let failed = Uuid::new_v4();
        let pending = Uuid::new_v4();
        for id in [done, failed, pending] {
            queue.add_job(id, scrape("https://a.com")).await.unwrap();
        }
        for (id, end) in [
            (done, JobEnd::completed(json!(1))),
            (failed, JobEnd::failed("x")),
        ] {
            let lease = LeaseToken::new();
            let claimed = queue.get_job_to_process(lease).await.unwrap().unwrap();
            assert_eq!(claimed.id, id);
            queue.end_job(id, lease, end).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Only the completed row is past its window
        let deleted = queue
            .sweep_retention(Duration::ZERO, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(queue.get_job(done).await.unwrap().is_none());
        assert!(queue.get_job(failed).await.unwrap().is_some());
        assert!(queue.get_job(pending).await.unwrap().is_some());

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.completed, 0);
    }

    #[tokio::test]
    async fn test_file_backed_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let id = Uuid::new_v4();
        {
            let queue = SqliteJobQueue::new(&path).unwrap();
            queue.add_job(id, scrape("https://a.com")).await.unwrap();
        }
        let reopened = SqliteJobQueue::new(&path).unwrap();
        assert!(reopened.get_job(id).await.unwrap().is_some());
        reopened.health_check().await.unwrap();
    }
}
