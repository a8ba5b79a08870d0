//! PostgreSQL job queue shared by many worker processes
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never block on
//! each other's rows. Terminal transitions are announced with `NOTIFY` inside
//! the same transaction and fed back into the local
//! [`JobNotifications`] hub by a dedicated `LISTEN` connection.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, NoTls, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::QueueError;
use super::job::{Job, JobEnd, JobPayload, JobStatus, LeaseToken, QueueCounts, ReapReport};
use super::notify::{JobNotification, JobNotifications, NOTIFY_CHANNEL};
use super::{JobQueue, QueueConfig};

const RETURNING_COLUMNS: &str = "id, status, payload, created_at, lease_token, lease_time, \
     stall_count, result, error, finished_at";

const STALLED_ERROR: &str = "job stalled too many times";

const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Queue
// ============================================================================

/// PostgreSQL-backed [`JobQueue`]
pub struct PostgresJobQueue {
    pool: Pool,
    notifications: JobNotifications,
    listener: JoinHandle<()>,
}

impl PostgresJobQueue {
    /// Create the pool, verify connectivity and start the `LISTEN` bridge
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        let mut pool_config = PoolConfig::new();
        pool_config.url = Some(config.database_url.clone());
        pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pool_config.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size.max(1)));

        let pool = pool_config.create_pool(Some(Runtime::Tokio1), NoTls)?;

        // Test connection
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;
        drop(client);

        let notifications = JobNotifications::default();
        let listener = tokio::spawn(listen_loop(
            config.database_url.clone(),
            notifications.clone(),
        ));

        info!(pool_size = config.pool_size, "Connected PostgreSQL job queue");

        Ok(Self {
            pool,
            notifications,
            listener,
        })
    }

    /// Create the jobs table and its indexes
    pub async fn init_schema(&self) -> Result<(), QueueError> {
        let client = self.pool.get().await?;

        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS crawlq_jobs (
                    id UUID PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'queued'
                        CHECK (status IN ('queued', 'active', 'completed', 'failed')),
                    payload JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    lease_token UUID,
                    lease_time TIMESTAMPTZ,
                    stall_count INTEGER NOT NULL DEFAULT 0,
                    result JSONB,
                    error TEXT,
                    finished_at TIMESTAMPTZ
                );

                CREATE INDEX IF NOT EXISTS idx_crawlq_jobs_queued
                    ON crawlq_jobs(created_at) WHERE status = 'queued';

                CREATE INDEX IF NOT EXISTS idx_crawlq_jobs_active
                    ON crawlq_jobs(lease_time) WHERE status = 'active';

                CREATE INDEX IF NOT EXISTS idx_crawlq_jobs_finished
                    ON crawlq_jobs(status, finished_at)
                    WHERE status IN ('completed', 'failed');
                "#,
            )
            .await?;

        debug!("Job queue schema ready");
        Ok(())
    }
}

impl Drop for PostgresJobQueue {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn row_to_job(row: &Row) -> Result<Job, QueueError> {
    let id: Uuid = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let payload: serde_json::Value = row.try_get("payload")?;
    let lease_token: Option<Uuid> = row.try_get("lease_token")?;

    Ok(Job {
        id,
        status: status.parse()?,
        payload: JobPayload::from_stored(id, payload)?,
        created_at: row.try_get("created_at")?,
        lease_token: lease_token.map(LeaseToken::from),
        lease_time: row.try_get("lease_time")?,
        stall_count: row.try_get("stall_count")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        finished_at: row.try_get("finished_at")?,
    })
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    fn notifications(&self) -> &JobNotifications {
        &self.notifications
    }

    async fn add_job(&self, id: Uuid, payload: JobPayload) -> Result<Job, QueueError> {
        let client = self.pool.get().await?;
        let payload = serde_json::to_value(&payload)?;
        let sql = format!(
            "INSERT INTO crawlq_jobs (id, status, payload) VALUES ($1, 'queued', $2)
             RETURNING {RETURNING_COLUMNS}"
        );
        let row = client.query_one(&sql, &[&id, &payload]).await?;
        row_to_job(&row)
    }

    async fn add_jobs(&self, jobs: Vec<(Uuid, JobPayload)>) -> Result<usize, QueueError> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let stmt = tx
            .prepare("INSERT INTO crawlq_jobs (id, status, payload) VALUES ($1, 'queued', $2)")
            .await?;

        for (id, payload) in &jobs {
            let payload = serde_json::to_value(payload)?;
            tx.execute(&stmt, &[id, &payload]).await?;
        }

        tx.commit().await?;
        Ok(jobs.len())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {RETURNING_COLUMNS} FROM crawlq_jobs WHERE id = $1");
        client
            .query_opt(&sql, &[&id])
            .await?
            .as_ref()
            .map(row_to_job)
            .transpose()
    }

    async fn get_job_to_process(&self, lease: LeaseToken) -> Result<Option<Job>, QueueError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "UPDATE crawlq_jobs
             SET status = 'active', lease_token = $1, lease_time = NOW()
             WHERE id = (
                 SELECT id FROM crawlq_jobs
                 WHERE status = 'queued'
                 ORDER BY created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {RETURNING_COLUMNS}"
        );
        client
            .query_opt(&sql, &[&lease.as_uuid()])
            .await?
            .as_ref()
            .map(row_to_job)
            .transpose()
    }

    async fn renew_lease(&self, id: Uuid, lease: LeaseToken) -> Result<bool, QueueError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE crawlq_jobs SET lease_time = NOW()
                 WHERE id = $1 AND status = 'active' AND lease_token = $2",
                &[&id, &lease.as_uuid()],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn end_job(&self, id: Uuid, lease: LeaseToken, end: JobEnd) -> Result<bool, QueueError> {
        let status = end.status();
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let updated = tx
            .execute(
                "UPDATE crawlq_jobs
                 SET status = $3, lease_token = NULL, lease_time = NULL,
                     result = $4, error = $5, finished_at = NOW()
                 WHERE id = $1 AND status = 'active' AND lease_token = $2",
                &[
                    &id,
                    &lease.as_uuid(),
                    &status.as_str(),
                    &end.result(),
                    &end.error(),
                ],
            )
            .await?;

        let notification = JobNotification { id, status };
        if updated == 1 {
            tx.execute(
                "SELECT pg_notify($1, $2)",
                &[&NOTIFY_CHANNEL, &notification.to_payload()],
            )
            .await?;
        }
        tx.commit().await?;

        if updated == 1 {
            self.notifications.publish(notification);
        }
        Ok(updated == 1)
    }

    async fn reap_stalled(
        &self,
        threshold: Duration,
        max_stalls: u32,
    ) -> Result<ReapReport, QueueError> {
        let max_stalls = i32::try_from(max_stalls).unwrap_or(i32::MAX);
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let rows = tx
            .query(
                "WITH stalled AS (
                     SELECT id FROM crawlq_jobs
                     WHERE status = 'active'
                       AND lease_time < NOW() - make_interval(secs => $1::float8)
                     FOR UPDATE SKIP LOCKED
                 )
                 UPDATE crawlq_jobs j
                 SET status = CASE WHEN j.stall_count < $2 THEN 'queued' ELSE 'failed' END,
                     lease_token = NULL,
                     lease_time = NULL,
                     stall_count = j.stall_count + 1,
                     error = CASE WHEN j.stall_count < $2 THEN j.error ELSE $3 END,
                     finished_at = CASE WHEN j.stall_count < $2 THEN NULL ELSE NOW() END
                 FROM stalled
                 WHERE j.id = stalled.id
                 RETURNING j.id, j.status",
                &[&threshold.as_secs_f64(), &max_stalls, &STALLED_ERROR],
            )
            .await?;

        let mut report = ReapReport::default();
        for row in &rows {
            let id: Uuid = row.try_get(0)?;
            let status: String = row.try_get(1)?;
            match status.parse()? {
                JobStatus::Failed => report.failed.push(id),
                _ => report.requeued.push(id),
            }
        }

        for id in &report.failed {
            let notification = JobNotification {
                id: *id,
                status: JobStatus::Failed,
            };
            tx.execute(
                "SELECT pg_notify($1, $2)",
                &[&NOTIFY_CHANNEL, &notification.to_payload()],
            )
            .await?;
        }
        tx.commit().await?;

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
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                "DELETE FROM crawlq_jobs
                 WHERE (status = 'completed'
                        AND finished_at < NOW() - make_interval(secs => $1::float8))
                    OR (status = 'failed'
                        AND finished_at < NOW() - make_interval(secs => $2::float8))",
                &[&completed.as_secs_f64(), &failed.as_secs_f64()],
            )
            .await?;
        Ok(deleted)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT status, COUNT(*) FROM crawlq_jobs GROUP BY status",
                &[],
            )
            .await?;

        let mut counts = QueueCounts::default();
        for row in &rows {
            let status: String = row.try_get(0)?;
            let count: i64 = row.try_get(1)?;
            counts.add(status.parse()?, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

// ============================================================================
// LISTEN bridge
// ============================================================================

/// Keep a `LISTEN` connection open for the lifetime of the queue
async fn listen_loop(database_url: String, notifications: JobNotifications) {
    loop {
        match listen_once(&database_url, &notifications).await {
            Ok(()) => debug!("Job notification connection closed, reconnecting"),
            Err(e) => warn!(error = %e, "Job notification listener failed, reconnecting"),
        }
        tokio::time::sleep(LISTEN_RETRY_DELAY).await;
    }
}

async fn listen_once(
    database_url: &str,
    notifications: &JobNotifications,
) -> Result<(), QueueError> {
    let (client, mut connection) = tokio_postgres::connect(database_url, NoTls).await?;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // The connection must be polled for LISTEN and for notifications to arrive
    let driver = tokio::spawn(async move {
        let messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(messages);

        while let Some(message) = messages.next().await {
            match message? {
                AsyncMessage::Notification(n) => {
                    if tx.send(n.payload().to_string()).is_err() {
                        break;
                    }
                }
                AsyncMessage::Notice(notice) => {
                    debug!(notice = %notice.message(), "PostgreSQL notice");
                }
                _ => {}
            }
        }
        Ok::<(), tokio_postgres::Error>(())
    });

    client
        .batch_execute(&format!("LISTEN {NOTIFY_CHANNEL}"))
        .await?;
    debug!(channel = NOTIFY_CHANNEL, "Listening for job notifications");

    while let Some(payload) = rx.recv().await {
        notifications.publish_payload(&payload);
    }

    match driver.await {
        Ok(result) => result.map_err(QueueError::from),
        Err(_) => Ok(()),
    }
}
