//! Worker loop
//!
//! A [`Worker`] runs `concurrency` loops that each claim one job at a time
//! from the [`JobQueue`](crate::queue::JobQueue), execute it, and report the
//! outcome to the crawl coordinator and then to the queue. A heartbeat renews
//! the lease while the job runs and is cancelled on every exit path.
//!
//! Reporting order matters. The lease is renewed once more before the crawl
//! is told anything, so a holder that lost its job never touches crawl state.
//! Then `add_crawl_job_done` runs before `end_job`, so a waiter woken by the
//! queue notification already sees the crawl bookkeeping.
//!
//! # Example
//!
//! ```rust,ignore
//! use crawlq::worker::{Worker, WorkerConfig};
//!
//! let worker = Worker::new(queue, coordinator, pipeline, sitemaps, WorkerConfig::default());
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let handle = tokio::spawn(worker.run(shutdown_rx));
//! // ...
//! shutdown_tx.send(true)?;
//! handle.await?;
//! ```

mod error;
pub mod kickoff;
pub mod scrape;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::crawl::{CrawlCoordinator, CrawlError, JobDone, SitemapFetcher, StoredCrawl};
use crate::metrics;
use crate::queue::{Job, JobEnd, JobPayload, JobStatus, LeaseToken, QueueError, SharedJobQueue};
use crate::scraper::ScrapePipeline;
use crate::utils::{self, with_retry_if, RetryConfig};

pub use error::WorkerError;
pub use kickoff::KickoffSummary;

// ============================================================================
// Configuration
// ============================================================================

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Claim loops per process
    pub concurrency: usize,

    /// Sleep between claims when the queue is empty
    pub poll_interval_ms: u64,

    /// Lease heartbeat period
    pub lease_renewal_secs: u64,

    /// Backoff for reporting calls that hit transient errors
    pub report_retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 500,
            lease_renewal_secs: 15,
            report_retry: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_renewal(&self) -> Duration {
        Duration::from_secs(self.lease_renewal_secs)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// What the crawl coordinator is told about a finished job
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CrawlReport {
    /// The kickoff stopped registering jobs
    Kickoff { crawl_id: Uuid },
    /// A member scrape reached a terminal state
    Member {
        crawl_id: Uuid,
        done: JobDone,
        url: String,
    },
}

impl CrawlReport {
    fn for_payload(payload: &JobPayload, done: JobDone) -> Option<Self> {
        match payload {
            JobPayload::Kickoff(job) => Some(CrawlReport::Kickoff {
                crawl_id: job.crawl_id,
            }),
            JobPayload::Scrape(job) => job.crawl_id.map(|crawl_id| CrawlReport::Member {
                crawl_id,
                done,
                url: job.url.clone(),
            }),
        }
    }

    fn crawl_id(&self) -> Uuid {
        match self {
            CrawlReport::Kickoff { crawl_id } | CrawlReport::Member { crawl_id, .. } => *crawl_id,
        }
    }
}

/// Terminal outcome of one job run, ready to be reported
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JobOutcome {
    pub end: JobEnd,
    pub crawl: Option<CrawlReport>,
}

impl JobOutcome {
    pub(crate) fn succeeded(payload: &JobPayload, result: serde_json::Value) -> Self {
        Self {
            end: JobEnd::completed(result),
            crawl: CrawlReport::for_payload(payload, JobDone::Succeeded),
        }
    }

    pub(crate) fn failed(payload: &JobPayload, error: impl Into<String>) -> Self {
        Self {
            end: JobEnd::failed(error),
            crawl: CrawlReport::for_payload(payload, JobDone::Failed),
        }
    }

    pub(crate) fn dropped(payload: &JobPayload, reason: &str) -> Self {
        Self {
            end: JobEnd::completed(json!({ "dropped": reason })),
            crawl: CrawlReport::for_payload(payload, JobDone::Dropped),
        }
    }

    /// Benign errors drop the job, everything else fails it
    pub(crate) fn from_error(payload: &JobPayload, err: &WorkerError) -> Self {
        match err {
            WorkerError::RacedRedirect => Self::dropped(payload, "raced_redirect"),
            WorkerError::CrawlCancelled(_) => Self::dropped(payload, "crawl_cancelled"),
            other => Self::failed(payload, other.to_string()),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

// ============================================================================
// Lease heartbeat
// ============================================================================

/// Renews a lease on an interval until dropped
///
/// When a renewal reports the lease gone, the heartbeat fires `lost` once and
/// stops.
struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn start(
        queue: SharedJobQueue,
        job_id: Uuid,
        lease: LeaseToken,
        every: Duration,
        lost: oneshot::Sender<()>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately and the claim just set the lease time
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match queue.renew_lease(job_id, lease).await {
                    Ok(true) => {
                        metrics::record_lease_renewal("renewed");
                        debug!(job_id = %job_id, "Lease renewed");
                    }
                    Ok(false) => {
                        metrics::record_lease_renewal("lost");
                        warn!(job_id = %job_id, error = %WorkerError::LeaseLost(job_id), "Lease renewal rejected");
                        let _ = lost.send(());
                        return;
                    }
                    Err(e) => {
                        metrics::record_lease_renewal("error");
                        warn!(job_id = %job_id, error = %e, "Lease renewal failed");
                    }
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Claims and executes jobs
#[derive(Clone)]
pub struct Worker {
    queue: SharedJobQueue,
    coordinator: CrawlCoordinator,
    pipeline: Arc<ScrapePipeline>,
    sitemaps: SitemapFetcher,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: SharedJobQueue,
        coordinator: CrawlCoordinator,
        pipeline: Arc<ScrapePipeline>,
        sitemaps: SitemapFetcher,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            coordinator,
            pipeline,
            sitemaps,
            config,
        }
    }

    pub fn queue(&self) -> &SharedJobQueue {
        &self.queue
    }

    pub fn coordinator(&self) -> &CrawlCoordinator {
        &self.coordinator
    }

    pub(crate) fn pipeline(&self) -> &ScrapePipeline {
        &self.pipeline
    }

    pub(crate) fn sitemaps(&self) -> &SitemapFetcher {
        &self.sitemaps
    }

    /// Register `jobs` as crawl members, then enqueue them
    ///
    /// Membership is written first so the crawl never looks finished while a
    /// queued member exists. When the enqueue fails the registered ids are
    /// marked failed, otherwise the crawl would wait on them forever.
    pub(crate) async fn enqueue_members(
        &self,
        crawl_id: Uuid,
        crawl: &StoredCrawl,
        jobs: Vec<(Uuid, JobPayload)>,
    ) -> Result<usize, WorkerError> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let members: Vec<(Uuid, String)> = jobs
            .iter()
            .map(|(id, payload)| (*id, payload.url().to_string()))
            .collect();
        let ids: Vec<Uuid> = members.iter().map(|(id, _)| *id).collect();
        self.coordinator.add_crawl_jobs(crawl_id, &ids).await?;

        match self.queue.add_jobs(jobs).await {
            Ok(enqueued) => {
                metrics::record_jobs_enqueued("scrape", enqueued);
                Ok(enqueued)
            }
            Err(e) => {
                warn!(
                    crawl_id = %crawl_id,
                    jobs = ids.len(),
                    error = %e,
                    "Enqueue failed, settling registered members as failed"
                );
                for (id, url) in &members {
                    self.coordinator
                        .add_crawl_job_done(crawl_id, Some(crawl), *id, JobDone::Failed, Some(url))
                        .await?;
                }
                Err(e.into())
            }
        }
    }

    /// Run the claim loops until `shutdown` flips to `true`
    ///
    /// In-flight jobs finish and are reported before this returns.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let concurrency = self.config.concurrency.max(1);
        info!(
            concurrency,
            backend = self.queue.backend_name(),
            "Worker started"
        );

        let mut loops = JoinSet::new();
        for index in 0..concurrency {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            loops.spawn(worker.run_loop(index, shutdown));
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker loop terminated abnormally");
            }
        }

        info!("Worker stopped");
    }

    async fn run_loop(self, index: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(loop_index = index, "Claim loop started");

        while !*shutdown.borrow() {
            let idle = match self.process_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    warn!(loop_index = index, error = %e, "Failed to claim job");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        debug!(loop_index = index, "Claim loop stopped");
    }

    /// Claim one job, execute it and report the outcome
    ///
    /// Returns the job id, or `None` when nothing was queued.
    pub async fn process_next(&self) -> Result<Option<Uuid>, WorkerError> {
        let lease = LeaseToken::new();
        let Some(job) = self.queue.get_job_to_process(lease).await? else {
            return Ok(None);
        };

        let kind = job.payload.kind();
        metrics::record_job_claimed(kind);
        let _timer = metrics::start_job_timer(kind);
        debug!(job_id = %job.id, kind, url = %job.payload.url(), "Claimed job");

        let (lost_tx, lost_rx) = oneshot::channel();
        let heartbeat = Heartbeat::start(
            self.queue.clone(),
            job.id,
            lease,
            self.config.lease_renewal(),
            lost_tx,
        );

        let outcome = tokio::select! {
            result = AssertUnwindSafe(self.execute(&job)).catch_unwind() => match result {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let err = WorkerError::Panicked(panic_message(panic.as_ref()));
                    error!(job_id = %job.id, error = %err, "Job panicked");
                    JobOutcome::from_error(&job.payload, &err)
                }
            },
            Ok(()) = lost_rx => {
                drop(heartbeat);
                self.abandon(&job).await;
                return Ok(Some(job.id));
            }
        };

        // Keep renewing until the queue row is ended
        self.report(&job, lease, outcome).await;
        drop(heartbeat);
        Ok(Some(job.id))
    }

    async fn execute(&self, job: &Job) -> JobOutcome {
        match &job.payload {
            JobPayload::Kickoff(kickoff) => match kickoff::run_kickoff(self, kickoff).await {
                Ok(summary) => JobOutcome::succeeded(
                    &job.payload,
                    serde_json::to_value(&summary).unwrap_or_default(),
                ),
                Err(e) => {
                    warn!(job_id = %job.id, crawl_id = %kickoff.crawl_id, error = %e, "Kickoff failed");
                    JobOutcome::from_error(&job.payload, &e)
                }
            },
            JobPayload::Scrape(scrape) => scrape::run_scrape(self, job.id, scrape).await,
        }
    }

    // ------------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------------

    async fn report(&self, job: &Job, lease: LeaseToken, outcome: JobOutcome) {
        if let Some(report) = &outcome.crawl {
            match self.confirm_lease(job.id, lease).await {
                Ok(true) => {}
                Ok(false) => {
                    self.abandon(job).await;
                    return;
                }
                Err(e) => {
                    error!(
                        job_id = %job.id,
                        error = %e,
                        "Could not confirm lease, leaving job to the stall reaper"
                    );
                    return;
                }
            }

            if let Err(e) = self.report_to_crawl(job.id, report).await {
                error!(
                    job_id = %job.id,
                    crawl_id = %report.crawl_id(),
                    error = %e,
                    "Failed to report job to crawl"
                );
            }
        }

        let kind = job.payload.kind();
        let status = outcome.end.status();
        let queue = &self.queue;
        let ended = with_retry_if(
            &self.config.report_retry,
            || queue.end_job(job.id, lease, outcome.end.clone()),
            QueueError::is_recoverable,
        )
        .await;

        match ended {
            Ok(true) => {
                metrics::record_job_finished(kind, status.as_str());
                info!(job_id = %job.id, kind, status = %status, "Job finished");
            }
            Ok(false) => {
                warn!(
                    job_id = %job.id,
                    error = %WorkerError::LeaseLost(job.id),
                    "Result discarded, job owned elsewhere"
                );
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to end job"),
        }
    }

    /// Renew the lease one last time; `false` when another holder or the reaper took the job
    async fn confirm_lease(&self, job_id: Uuid, lease: LeaseToken) -> Result<bool, QueueError> {
        let queue = &self.queue;
        let owned = with_retry_if(
            &self.config.report_retry,
            || queue.renew_lease(job_id, lease),
            QueueError::is_recoverable,
        )
        .await?;
        if !owned {
            metrics::record_lease_renewal("lost");
            warn!(
                job_id = %job_id,
                error = %WorkerError::LeaseLost(job_id),
                "Lease gone before reporting"
            );
        }
        Ok(owned)
    }

    async fn report_to_crawl(&self, job_id: Uuid, report: &CrawlReport) -> Result<(), CrawlError> {
        let retry = &self.config.report_retry;
        let coordinator = &self.coordinator;
        let crawl_id = report.crawl_id();

        match report {
            CrawlReport::Kickoff { .. } => {
                with_retry_if(
                    retry,
                    || coordinator.finish_crawl_kickoff(crawl_id),
                    CrawlError::is_recoverable,
                )
                .await?;
            }
            CrawlReport::Member { done, url, .. } => {
                let crawl = with_retry_if(
                    retry,
                    || coordinator.get_crawl(crawl_id),
                    CrawlError::is_recoverable,
                )
                .await?;
                with_retry_if(
                    retry,
                    || {
                        coordinator.add_crawl_job_done(
                            crawl_id,
                            crawl.as_ref(),
                            job_id,
                            *done,
                            Some(url.as_str()),
                        )
                    },
                    CrawlError::is_recoverable,
                )
                .await?;
            }
        }

        with_retry_if(
            retry,
            || coordinator.finish_crawl_if_needed(crawl_id),
            CrawlError::is_recoverable,
        )
        .await?;
        Ok(())
    }

    /// Stop working on a job whose lease was taken away
    ///
    /// A row the reaper already failed has no holder left to report it, so
    /// its crawl is told here.
    async fn abandon(&self, job: &Job) {
        warn!(job_id = %job.id, "Abandoning job after lease loss");
        match self.queue.get_job(job.id).await {
            Ok(Some(row)) if row.status == JobStatus::Failed => self.settle_failed(&row).await,
            Ok(_) => {}
            Err(e) => warn!(job_id = %job.id, error = %e, "Could not read abandoned job"),
        }
    }

    async fn settle_failed(&self, job: &Job) {
        let error = job.error.as_deref().unwrap_or("job failed");
        let outcome = JobOutcome::failed(&job.payload, error);
        if let Some(report) = &outcome.crawl {
            match self.report_to_crawl(job.id, report).await {
                Ok(()) => debug!(job_id = %job.id, crawl_id = %report.crawl_id(), "Settled failed job"),
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to settle job with crawl"),
            }
        }
    }

    /// Report jobs failed by the stall reaper to their crawls
    ///
    /// Runs until every sender of `failed` is dropped.
    pub async fn settle_reaped(self, mut failed: mpsc::UnboundedReceiver<Uuid>) {
        while let Some(id) = failed.recv().await {
            let started = std::time::Instant::now();
            match self.queue.get_job(id).await {
                Ok(Some(job)) if job.status == JobStatus::Failed => self.settle_failed(&job).await,
                Ok(_) => debug!(job_id = %id, "Reaped job no longer failed"),
                Err(e) => warn!(job_id = %id, error = %e, "Could not read reaped job"),
            }
            debug!(job_id = %id, elapsed_ms = utils::millis(started.elapsed()), "Reaped job handled");
        }
    }
}
