//! Background stall reaper and retention sweeper

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{QueueConfig, SharedJobQueue};
use crate::metrics;

/// Periodic queue housekeeping
///
/// One task runs both loops: stalled `active` rows are requeued (or failed
/// once their stall cap is exhausted) every reap interval, and terminal rows
/// past their retention window are deleted every sweep interval.
pub struct QueueMaintenance {
    queue: SharedJobQueue,
    failed_tx: Option<mpsc::UnboundedSender<Uuid>>,
    stall_threshold: Duration,
    max_stalls: u32,
    reap_interval: Duration,
    completed_retention: Duration,
    failed_retention: Duration,
    sweep_interval: Duration,
}

impl QueueMaintenance {
    pub fn new(queue: SharedJobQueue, config: &QueueConfig) -> Self {
        Self {
            queue,
            failed_tx: None,
            stall_threshold: config.stall_threshold(),
            max_stalls: config.max_stalls,
            reap_interval: config.reap_interval(),
            completed_retention: config.completed_retention(),
            failed_retention: config.failed_retention(),
            sweep_interval: config.sweep_interval(),
        }
    }

    /// Forward the id of every job the reaper fails to `tx`
    ///
    /// Nobody else reports such a job to its crawl, since its last holder
    /// is gone.
    pub fn on_failed(mut self, tx: mpsc::UnboundedSender<Uuid>) -> Self {
        self.failed_tx = Some(tx);
        self
    }

    /// Start the housekeeping task; it exits when `shutdown` flips to `true`
    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// [`new`](Self::new) followed by [`start`](Self::start)
    pub fn spawn(
        queue: SharedJobQueue,
        config: &QueueConfig,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        Self::new(queue, config).start(shutdown)
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut reap_tick = tokio::time::interval(self.reap_interval);
        reap_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_tick = tokio::time::interval(self.sweep_interval);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            backend = self.queue.backend_name(),
            reap_interval_secs = self.reap_interval.as_secs(),
            sweep_interval_secs = self.sweep_interval.as_secs(),
            "Queue maintenance started"
        );

        loop {
            tokio::select! {
                _ = reap_tick.tick() => self.reap_once().await,
                _ = sweep_tick.tick() => self.sweep_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Queue maintenance stopped");
    }

    /// One reaper pass
    pub async fn reap_once(&self) {
        match self
            .queue
            .reap_stalled(self.stall_threshold, self.max_stalls)
            .await
        {
            Ok(report) if report.is_empty() => debug!("No stalled jobs"),
            Ok(report) => {
                metrics::record_reap(report.requeued.len(), report.failed.len());
                for id in &report.failed {
                    warn!(job_id = %id, "Job exceeded stall limit, marked failed");
                    if let Some(tx) = &self.failed_tx {
                        let _ = tx.send(*id);
                    }
                }
                info!(
                    requeued = report.requeued.len(),
                    failed = report.failed.len(),
                    "Recovered stalled jobs"
                );
            }
            Err(e) => warn!(error = %e, "Stall reaper pass failed"),
        }

        if let Ok(counts) = self.queue.counts().await {
            metrics::update_queue_depth(
                counts.queued,
                counts.active,
                counts.completed,
                counts.failed,
            );
        }
    }

    /// One retention sweep pass
    pub async fn sweep_once(&self) {
        match self
            .queue
            .sweep_retention(self.completed_retention, self.failed_retention)
            .await
        {
            Ok(0) => debug!("Retention sweep removed nothing"),
            Ok(deleted) => {
                metrics::record_swept(deleted);
                info!(deleted, "Retention sweep removed finished jobs");
            }
            Err(e) => warn!(error = %e, "Retention sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobEnd, JobPayload, JobQueue, JobStatus, LeaseToken, ScrapeJob, SqliteJobQueue};
    use std::sync::Arc;

    fn fast_config() -> QueueConfig {
        QueueConfig {
            stall_threshold_secs: 0,
            max_stalls: 1,
            reap_interval_secs: 1,
            completed_retention_secs: 0,
            failed_retention_secs: 0,
            sweep_interval_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reap_once_requeues_stalled_job() {
        let queue: SharedJobQueue = Arc::new(SqliteJobQueue::in_memory().unwrap());
        let id = Uuid::new_v4();
        queue
            .add_job(id, JobPayload::Scrape(ScrapeJob::standalone("https://a.com")))
            .await
            .unwrap();
        queue.get_job_to_process(LeaseToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let maintenance = QueueMaintenance::new(queue.clone(), &fast_config());
        maintenance.reap_once().await;

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.stall_count, 1);
    }

    #[tokio::test]
    async fn test_reaped_failures_are_forwarded() {
        let queue: SharedJobQueue = Arc::new(SqliteJobQueue::in_memory().unwrap());
        let id = Uuid::new_v4();
        queue
            .add_job(id, JobPayload::Scrape(ScrapeJob::standalone("https://a.com")))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let maintenance = QueueMaintenance::new(queue.clone(), &fast_config()).on_failed(tx);

        // Stall cap of 1: the first reap requeues, the second fails
        for _ in 0..2 {
            queue.get_job_to_process(LeaseToken::new()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            maintenance.reap_once().await;
        }

        assert_eq!(rx.try_recv().unwrap(), id);
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_sweep_once_deletes_expired_rows() {
        let queue: SharedJobQueue = Arc::new(SqliteJobQueue::in_memory().unwrap());
        let id = Uuid::new_v4();
        queue
            .add_job(id, JobPayload::Scrape(ScrapeJob::standalone("https://a.com")))
            .await
            .unwrap();
        let lease = LeaseToken::new();
        queue.get_job_to_process(lease).await.unwrap();
        queue.end_job(id, lease, JobEnd::failed("x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let maintenance = QueueMaintenance::new(queue.clone(), &fast_config());
        maintenance.sweep_once().await;

        assert!(queue.get_job(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spawned_task_stops_on_shutdown() {
        let queue: SharedJobQueue = Arc::new(SqliteJobQueue::in_memory().unwrap());
        let (tx, rx) = watch::channel(false);
        let handle = QueueMaintenance::spawn(queue, &fast_config(), rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
