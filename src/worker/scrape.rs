//! Scrape job: run the fallback pipeline and feed discovered links back
//!
//! For a crawl member the cancelled flag is checked twice: before the scrape
//! starts and again before discovered links are registered. A scrape already
//! in flight when the crawl is cancelled still finishes and is reported.

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{JobOutcome, Worker, WorkerError};
use crate::crawl::{LinkFilter, RedirectOutcome, SitemapPolicy, StoredCrawl};
use crate::queue::{JobPayload, ScrapeJob};
use crate::scraper::{Document, ScrapeReport, Verdict};

/// Execute a scrape job and decide how it is reported
pub(crate) async fn run_scrape(worker: &Worker, job_id: Uuid, job: &ScrapeJob) -> JobOutcome {
    let payload = JobPayload::Scrape(job.clone());
    match scrape_job(worker, job_id, job).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if e.is_benign() {
                debug!(job_id = %job_id, url = %job.url, reason = %e, "Scrape dropped");
            } else {
                warn!(job_id = %job_id, url = %job.url, error = %e, "Scrape job failed");
            }
            JobOutcome::from_error(&payload, &e)
        }
    }
}

async fn scrape_job(
    worker: &Worker,
    job_id: Uuid,
    job: &ScrapeJob,
) -> Result<JobOutcome, WorkerError> {
    let payload = JobPayload::Scrape(job.clone());

    let Some(crawl_id) = job.crawl_id else {
        let report = worker.pipeline().scrape(&job.url, &job.page_options).await;
        return Ok(settle_report(worker, job, &payload, report));
    };

    let coordinator = worker.coordinator();
    let crawl = coordinator.require_crawl(crawl_id).await?;
    if crawl.cancelled {
        return Err(WorkerError::CrawlCancelled(crawl_id));
    }

    let report = worker.pipeline().scrape(&job.url, &job.page_options).await;
    if !report.verdict.is_success() {
        return Ok(settle_report(worker, job, &payload, report));
    }

    let final_url = report.document.final_url();
    if final_url != job.url {
        let outcome = coordinator
            .claim_redirect(crawl_id, &crawl, &job.url, final_url, job.is_crawl_source)
            .await?;
        if outcome == RedirectOutcome::Raced {
            info!(
                job_id = %job_id,
                crawl_id = %crawl_id,
                from = %job.url,
                to = %final_url,
                "Redirect target already claimed, dropping job"
            );
            return Err(WorkerError::RacedRedirect);
        }
    }

    if crawl.crawler_options.sitemap != SitemapPolicy::Only && report.verdict == Verdict::Accepted {
        // Re-read: cancellation and a moved origin both matter from here on
        let current = coordinator.require_crawl(crawl_id).await?;
        if current.cancelled {
            debug!(crawl_id = %crawl_id, job_id = %job_id, "Crawl cancelled, skipping discovery");
        } else {
            discover(worker, crawl_id, &current, job, &report.document).await?;
        }
    }

    Ok(settle_report(worker, job, &payload, report))
}

/// Filter, lock, register and enqueue the links found on one page
async fn discover(
    worker: &Worker,
    crawl_id: Uuid,
    crawl: &StoredCrawl,
    job: &ScrapeJob,
    document: &Document,
) -> Result<usize, WorkerError> {
    if document.links.is_empty() {
        return Ok(0);
    }

    let depth = job.discovery_depth + 1;
    let filter = LinkFilter::new(&crawl.origin_url, &crawl.crawler_options)?;
    let allowed = filter.filter(&document.links, depth);
    if allowed.links.is_empty() {
        debug!(
            crawl_id = %crawl_id,
            url = %job.url,
            denied = allowed.denials.len(),
            "No followable links"
        );
        return Ok(0);
    }

    let coordinator = worker.coordinator();
    let locked = coordinator
        .lock_urls_individually(crawl_id, crawl, &allowed.links)
        .await?;
    if locked.is_empty() {
        return Ok(0);
    }

    let jobs: Vec<(Uuid, JobPayload)> = locked
        .into_iter()
        .map(|url| {
            let child = ScrapeJob {
                url,
                crawl_id: Some(crawl_id),
                team_id: job.team_id.clone(),
                page_options: crawl.scrape_options.clone(),
                discovery_depth: depth,
                from_sitemap: false,
                is_crawl_source: false,
            };
            (Uuid::new_v4(), JobPayload::Scrape(child))
        })
        .collect();

    let enqueued = worker.enqueue_members(crawl_id, crawl, jobs).await?;

    info!(
        crawl_id = %crawl_id,
        url = %job.url,
        found = document.links.len(),
        enqueued,
        depth,
        "Discovered links"
    );
    Ok(enqueued)
}

/// Map a pipeline verdict onto the job outcome
fn settle_report(
    worker: &Worker,
    job: &ScrapeJob,
    payload: &JobPayload,
    report: ScrapeReport,
) -> JobOutcome {
    match report.verdict {
        Verdict::Accepted | Verdict::TerminalPage => {
            match serde_json::to_value(&report.document) {
                Ok(result) => JobOutcome::succeeded(payload, result),
                Err(e) => JobOutcome::failed(payload, format!("failed to encode document: {e}")),
            }
        }
        Verdict::DeadlineExceeded => {
            let budget = worker.pipeline().budget_for(&job.page_options);
            JobOutcome::from_error(payload, &WorkerError::DeadlineExceeded(budget))
        }
        Verdict::Exhausted => {
            let reason = report
                .failure_reason()
                .unwrap_or_else(|| "scrape exhausted".to_string());
            JobOutcome::failed(payload, reason)
        }
    }
}
