//! Kickoff job: seed a crawl from its origin page and sitemap
//!
//! Every job is registered with the coordinator before it is enqueued (see
//! `Worker::enqueue_members`). Marking the kickoff finished is left to
//! reporting, which happens on every exit path.

use serde::Serialize;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::{Worker, WorkerError};
use crate::crawl::sitemap::default_sitemap_url;
use crate::crawl::{CrawlError, LinkFilter, SitemapPolicy, StoredCrawl, UrlLock};
use crate::queue::{JobPayload, KickoffJob, ScrapeJob};

/// Result stored on a completed kickoff job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KickoffSummary {
    /// Whether the origin page was newly locked
    pub seeded: bool,

    /// URLs the sitemap walk returned
    pub sitemap_urls: usize,

    /// Scrape jobs added to the queue
    pub enqueued: usize,
}

fn member_job(crawl_id: Uuid, crawl: &StoredCrawl, url: String, from_sitemap: bool) -> ScrapeJob {
    ScrapeJob {
        url,
        crawl_id: Some(crawl_id),
        team_id: Some(crawl.team_id.clone()),
        page_options: crawl.scrape_options.clone(),
        discovery_depth: 0,
        from_sitemap,
        is_crawl_source: !from_sitemap,
    }
}

/// Lock the origin and the sitemap URLs, then register and enqueue their scrapes
pub(crate) async fn run_kickoff(
    worker: &Worker,
    job: &KickoffJob,
) -> Result<KickoffSummary, WorkerError> {
    let coordinator = worker.coordinator();
    let crawl_id = job.crawl_id;
    let crawl = coordinator.require_crawl(crawl_id).await?;
    if crawl.cancelled {
        return Err(WorkerError::CrawlCancelled(crawl_id));
    }

    let mut summary = KickoffSummary::default();
    let mut jobs: Vec<(Uuid, JobPayload)> = Vec::new();

    if coordinator.lock_url(crawl_id, &crawl, &job.url).await? == UrlLock::Locked {
        summary.seeded = true;
        let seed = member_job(crawl_id, &crawl, job.url.clone(), false);
        jobs.push((Uuid::new_v4(), JobPayload::Scrape(seed)));
    }

    if crawl.crawler_options.sitemap != SitemapPolicy::Skip {
        let origin = Url::parse(&crawl.origin_url)
            .map_err(|e| CrawlError::invalid_url(&crawl.origin_url, e))?;

        if let Some(sitemap_url) = default_sitemap_url(&origin) {
            let limit = usize::try_from(crawl.crawler_options.limit).unwrap_or(usize::MAX);
            let urls = worker.sitemaps().fetch_urls(sitemap_url.as_str(), limit).await;
            summary.sitemap_urls = urls.len();

            let filter = LinkFilter::new(&crawl.origin_url, &crawl.crawler_options)?;
            let allowed = filter.filter(&urls, 0);
            debug!(
                crawl_id = %crawl_id,
                found = urls.len(),
                allowed = allowed.links.len(),
                denied = allowed.denials.len(),
                "Filtered sitemap URLs"
            );

            let locked = coordinator
                .lock_urls_individually(crawl_id, &crawl, &allowed.links)
                .await?;
            jobs.extend(locked.into_iter().map(|url| {
                let job = member_job(crawl_id, &crawl, url, true);
                (Uuid::new_v4(), JobPayload::Scrape(job))
            }));
        }
    }

    summary.enqueued = worker.enqueue_members(crawl_id, &crawl, jobs).await?;

    info!(
        crawl_id = %crawl_id,
        origin = %crawl.origin_url,
        seeded = summary.seeded,
        sitemap_urls = summary.sitemap_urls,
        enqueued = summary.enqueued,
        "Crawl kicked off"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::CrawlerOptions;
    use crate::scraper::PageOptions;

    #[test]
    fn test_member_job_marks_seed() {
        let crawl = StoredCrawl::new(
            "https://example.com/",
            "team-7",
            CrawlerOptions::default(),
            PageOptions {
                wait_for_ms: 500,
                ..Default::default()
            },
        );
        let id = Uuid::new_v4();

        let seed = member_job(id, &crawl, "https://example.com/".to_string(), false);
        assert!(seed.is_crawl_source);
        assert!(!seed.from_sitemap);
        assert_eq!(seed.team_id.as_deref(), Some("team-7"));
        assert_eq!(seed.page_options.wait_for_ms, 500);

        let listed = member_job(id, &crawl, "https://example.com/a".to_string(), true);
        assert!(!listed.is_crawl_source);
        assert!(listed.from_sitemap);
        assert_eq!(listed.crawl_id, Some(id));
    }
}
