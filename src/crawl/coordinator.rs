//! Crawl-state coordinator
//!
//! All state for crawl `{id}` lives under `crawl:{id}` keys in the
//! coordination store and expires after the configured TTL:
//!
//! | key | type | contents |
//! |-----|------|----------|
//! | `crawl:{id}` | string | JSON [`StoredCrawl`] |
//! | `crawl:{id}:cancelled` | string | set once the crawl is cancelled; overrides the record's flag |
//! | `crawl:{id}:visited` | set | every locked permutation |
//! | `crawl:{id}:visited_unique` | set | one normalised URL per locked page, counted against the limit |
//! | `crawl:{id}:jobs` | set | member job ids |
//! | `crawl:{id}:jobs_done` | set | member job ids in a terminal state |
//! | `crawl:{id}:jobs_failed` | set | member job ids that failed |
//! | `crawl:{id}:jobs_done_ordered` | list | successful job ids in completion order |
//! | `crawl:{id}:kickoff:finish` | string | set once the kickoff job stopped registering jobs |
//! | `crawl:{id}:finish` | string | set exactly once, by whoever observes completion first |

use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::error::CrawlError;
use super::permutations::{generate_url_permutations, normalize_url};
use super::store::{ClaimOutcome, MemberClaim, SharedStore, UniqueSlot};
use super::StoredCrawl;
use crate::metrics;

// ============================================================================
// Configuration
// ============================================================================

/// What happens to a failed page's slot in the crawl limit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailedUrlPolicy {
    /// A failed page keeps counting against the limit
    #[default]
    Retain,
    /// A failed page gives its slot back; discovery dedup is unaffected
    Release,
}

impl std::str::FromStr for FailedUrlPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "retain" => Ok(Self::Retain),
            "release" => Ok(Self::Release),
            other => Err(format!("unknown failed URL policy: {other}")),
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Lifetime of every crawl key, refreshed on write
    pub ttl_secs: u64,

    pub failed_url_policy: FailedUrlPolicy,

    /// Concurrent lock attempts in [`CrawlCoordinator::lock_urls_individually`]
    pub lock_concurrency: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 86_400,
            failed_url_policy: FailedUrlPolicy::Retain,
            lock_concurrency: 16,
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of trying to lock one URL for a crawl
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlLock {
    /// This call claimed the page
    Locked,
    /// Some permutation of the page was claimed before
    AlreadyLocked,
    /// The crawl already holds its page limit
    LimitReached,
}

impl UrlLock {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlLock::Locked => "locked",
            UrlLock::AlreadyLocked => "already_locked",
            UrlLock::LimitReached => "limit_reached",
        }
    }
}

/// Result of claiming a scrape's redirect target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOutcome {
    /// The final URL is a permutation of the requested one
    SamePage,
    /// The target now belongs to this job
    Claimed,
    /// Another job of the crawl already owns the target
    Raced,
}

/// How a member job ended, from the crawl's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDone {
    Succeeded,
    Failed,
    /// Terminal without being a success or a failure (raced redirect, cancelled)
    Dropped,
}

/// Snapshot of a crawl's bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrawlProgress {
    pub total: u64,
    pub done: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dropped: u64,
    pub kickoff_finished: bool,
    pub finished: bool,
    pub cancelled: bool,
}

impl CrawlProgress {
    pub fn pending(&self) -> u64 {
        self.total.saturating_sub(self.done)
    }
}

// ============================================================================
// Coordinator
// ============================================================================

fn crawl_key(id: Uuid) -> String {
    format!("crawl:{id}")
}

fn sub_key(id: Uuid, suffix: &str) -> String {
    format!("crawl:{id}:{suffix}")
}

fn lock_members(url: &Url, crawl: &StoredCrawl) -> Vec<String> {
    if crawl.crawler_options.deduplicate_similar_urls {
        generate_url_permutations(url)
    } else {
        vec![url.to_string()]
    }
}

/// Crawl bookkeeping on top of a shared [`CoordinationStore`](super::CoordinationStore)
#[derive(Clone)]
pub struct CrawlCoordinator {
    store: SharedStore,
    config: CoordinatorConfig,
}

impl CrawlCoordinator {
    pub fn new(store: SharedStore, config: CoordinatorConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    // ------------------------------------------------------------------------
    // Crawl record
    // ------------------------------------------------------------------------

    /// Write the crawl record
    ///
    /// Saving a record whose `cancelled` is `false` never clears a
    /// cancellation: the flag lives in its own key and is only ever set.
    pub async fn save_crawl(&self, id: Uuid, crawl: &StoredCrawl) -> Result<(), CrawlError> {
        let json = serde_json::to_string(crawl)?;
        self.store.put(&crawl_key(id), &json, self.ttl()).await?;
        if crawl.cancelled {
            self.store
                .put_if_absent(&sub_key(id, "cancelled"), "yes", self.ttl())
                .await?;
        }
        debug!(crawl_id = %id, origin = %crawl.origin_url, "Saved crawl");
        Ok(())
    }

    pub async fn get_crawl(&self, id: Uuid) -> Result<Option<StoredCrawl>, CrawlError> {
        let Some(json) = self.store.get(&crawl_key(id)).await? else {
            return Ok(None);
        };
        let mut crawl: StoredCrawl = serde_json::from_str(&json)?;
        if !crawl.cancelled {
            crawl.cancelled = self.store.get(&sub_key(id, "cancelled")).await?.is_some();
        }
        Ok(Some(crawl))
    }

    /// Like [`get_crawl`](Self::get_crawl) but a missing record is an error
    pub async fn require_crawl(&self, id: Uuid) -> Result<StoredCrawl, CrawlError> {
        self.get_crawl(id)
            .await?
            .ok_or(CrawlError::CrawlNotFound(id))
    }

    /// Set the cancelled flag; `false` when the crawl does not exist
    ///
    /// Only the flag key is written, so a concurrent record update such as a
    /// seed redirect cannot lose the cancellation.
    pub async fn cancel_crawl(&self, id: Uuid) -> Result<bool, CrawlError> {
        if self.store.get(&crawl_key(id)).await?.is_none() {
            return Ok(false);
        }
        let newly = self
            .store
            .put_if_absent(&sub_key(id, "cancelled"), "yes", self.ttl())
            .await?;
        if newly {
            metrics::record_crawl_cancelled();
            info!(crawl_id = %id, "Crawl cancelled");
        }
        Ok(true)
    }

    pub async fn is_cancelled(&self, id: Uuid) -> Result<bool, CrawlError> {
        Ok(self.require_crawl(id).await?.cancelled)
    }

    // ------------------------------------------------------------------------
    // URL locking
    // ------------------------------------------------------------------------

    async fn lock_normalized(
        &self,
        id: Uuid,
        crawl: &StoredCrawl,
        url: &Url,
    ) -> Result<UrlLock, CrawlError> {
        let members = lock_members(url, crawl);
        let unique_key = sub_key(id, "visited_unique");
        let visited_key = sub_key(id, "visited");
        let claim = MemberClaim {
            key: &visited_key,
            members: &members,
            unique: Some(UniqueSlot {
                key: &unique_key,
                member: url.as_str(),
                limit: crawl.crawler_options.limit,
            }),
            ttl: self.ttl(),
        };

        let lock = match self.store.claim_members(&claim).await? {
            ClaimOutcome::Claimed => UrlLock::Locked,
            ClaimOutcome::AlreadyClaimed => UrlLock::AlreadyLocked,
            ClaimOutcome::LimitReached => UrlLock::LimitReached,
        };
        metrics::record_url_lock(lock.as_str());
        debug!(crawl_id = %id, url = %url, outcome = lock.as_str(), "URL lock");
        Ok(lock)
    }

    /// Claim every permutation of `url` for the crawl as one atomic group
    pub async fn lock_url(
        &self,
        id: Uuid,
        crawl: &StoredCrawl,
        url: &str,
    ) -> Result<UrlLock, CrawlError> {
        let url = normalize_url(url, crawl.crawler_options.ignore_query_parameters)?;
        self.lock_normalized(id, crawl, &url).await
    }

    /// Lock candidates one by one, returning the normalised URLs this call claimed
    ///
    /// Candidates that fail to parse are skipped. Order follows `candidates`.
    pub async fn lock_urls_individually(
        &self,
        id: Uuid,
        crawl: &StoredCrawl,
        candidates: &[String],
    ) -> Result<Vec<String>, CrawlError> {
        let ignore_query = crawl.crawler_options.ignore_query_parameters;
        let normalized: Vec<Url> = candidates
            .iter()
            .filter_map(|candidate| match normalize_url(candidate, ignore_query) {
                Ok(url) => Some(url),
                Err(e) => {
                    debug!(crawl_id = %id, error = %e, "Skipping unparseable candidate");
                    None
                }
            })
            .collect();

        let results: Vec<(Url, Result<UrlLock, CrawlError>)> = stream::iter(normalized)
            .map(|url| async move {
                let lock = self.lock_normalized(id, crawl, &url).await;
                (url, lock)
            })
            .buffered(self.config.lock_concurrency.max(1))
            .collect()
            .await;

        let mut locked = Vec::new();
        for (url, lock) in results {
            if lock? == UrlLock::Locked {
                locked.push(url.into());
            }
        }
        Ok(locked)
    }

    /// Claim the final URL of a redirected scrape
    ///
    /// A redirect of the crawl's seed page moves the crawl origin instead of
    /// racing, so later discovery is scoped to where the site actually lives.
    pub async fn claim_redirect(
        &self,
        id: Uuid,
        crawl: &StoredCrawl,
        requested_url: &str,
        final_url: &str,
        is_crawl_source: bool,
    ) -> Result<RedirectOutcome, CrawlError> {
        let ignore_query = crawl.crawler_options.ignore_query_parameters;
        let requested = normalize_url(requested_url, ignore_query)?;
        let target = normalize_url(final_url, ignore_query)?;

        let members = generate_url_permutations(&target);
        if members.iter().any(|m| m == requested.as_str()) {
            return Ok(RedirectOutcome::SamePage);
        }

        let members = lock_members(&target, crawl);
        let visited_key = sub_key(id, "visited");

        if is_crawl_source {
            self.store
                .set_add(&visited_key, &members, self.ttl())
                .await?;
            let mut updated = self.require_crawl(id).await?;
            updated.origin_url = target.to_string();
            self.save_crawl(id, &updated).await?;
            info!(crawl_id = %id, from = %requested, to = %target, "Crawl origin redirected");
            return Ok(RedirectOutcome::Claimed);
        }

        let claim = MemberClaim {
            key: &visited_key,
            members: &members,
            unique: None,
            ttl: self.ttl(),
        };
        Ok(match self.store.claim_members(&claim).await? {
            ClaimOutcome::Claimed => RedirectOutcome::Claimed,
            _ => {
                debug!(crawl_id = %id, target = %target, "Redirect target already claimed");
                RedirectOutcome::Raced
            }
        })
    }

    // ------------------------------------------------------------------------
    // Job membership
    // ------------------------------------------------------------------------

    pub async fn add_crawl_job(&self, id: Uuid, job_id: Uuid) -> Result<(), CrawlError> {
        self.add_crawl_jobs(id, &[job_id]).await
    }

    pub async fn add_crawl_jobs(&self, id: Uuid, job_ids: &[Uuid]) -> Result<(), CrawlError> {
        if job_ids.is_empty() {
            return Ok(());
        }
        let members: Vec<String> = job_ids.iter().map(Uuid::to_string).collect();
        self.store
            .set_add(&sub_key(id, "jobs"), &members, self.ttl())
            .await?;
        Ok(())
    }

    /// Record a member job's terminal state
    ///
    /// Reporting the same job twice is harmless. Under
    /// [`FailedUrlPolicy::Release`] a failed `url` gives its limit slot back,
    /// which needs the crawl record to normalise it.
    pub async fn add_crawl_job_done(
        &self,
        id: Uuid,
        crawl: Option<&StoredCrawl>,
        job_id: Uuid,
        done: JobDone,
        url: Option<&str>,
    ) -> Result<(), CrawlError> {
        let job = job_id.to_string();
        let ttl = self.ttl();

        if done == JobDone::Failed {
            self.store
                .set_add(&sub_key(id, "jobs_failed"), std::slice::from_ref(&job), ttl)
                .await?;

            if self.config.failed_url_policy == FailedUrlPolicy::Release {
                if let (Some(crawl), Some(url)) = (crawl, url) {
                    let url = normalize_url(url, crawl.crawler_options.ignore_query_parameters)?;
                    self.store
                        .set_remove(&sub_key(id, "visited_unique"), &[url.to_string()])
                        .await?;
                }
            }
        }

        let newly_done = self
            .store
            .set_add(&sub_key(id, "jobs_done"), std::slice::from_ref(&job), ttl)
            .await?
            == 1;

        if newly_done && done == JobDone::Succeeded {
            self.store
                .list_push(&sub_key(id, "jobs_done_ordered"), &job, ttl)
                .await?;
        }

        debug!(crawl_id = %id, job_id = %job_id, outcome = ?done, "Crawl job done");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    /// Mark the kickoff as done registering jobs
    pub async fn finish_crawl_kickoff(&self, id: Uuid) -> Result<(), CrawlError> {
        self.store
            .put(&sub_key(id, "kickoff:finish"), "yes", self.ttl())
            .await
    }

    pub async fn is_kickoff_finished(&self, id: Uuid) -> Result<bool, CrawlError> {
        Ok(self
            .store
            .get(&sub_key(id, "kickoff:finish"))
            .await?
            .is_some())
    }

    /// Kickoff finished and every member job is terminal
    pub async fn is_crawl_finished(&self, id: Uuid) -> Result<bool, CrawlError> {
        if !self.is_kickoff_finished(id).await? {
            return Ok(false);
        }
        let total = self.store.set_len(&sub_key(id, "jobs")).await?;
        let done = self.store.set_len(&sub_key(id, "jobs_done")).await?;
        Ok(done >= total)
    }

    /// `true` for exactly one caller once the crawl is finished
    pub async fn finish_crawl_if_needed(&self, id: Uuid) -> Result<bool, CrawlError> {
        if !self.is_crawl_finished(id).await? {
            return Ok(false);
        }

        let won = self
            .store
            .put_if_absent(&sub_key(id, "finish"), "yes", self.ttl())
            .await?;
        if won {
            metrics::record_crawl_finished();
            info!(crawl_id = %id, "Crawl finished");
        }
        Ok(won)
    }

    pub async fn crawl_progress(&self, id: Uuid) -> Result<CrawlProgress, CrawlError> {
        let crawl = self.require_crawl(id).await?;
        let total = self.store.set_len(&sub_key(id, "jobs")).await?;
        let done = self.store.set_len(&sub_key(id, "jobs_done")).await?;
        let succeeded = self.store.list_len(&sub_key(id, "jobs_done_ordered")).await?;
        let failed = self.store.set_len(&sub_key(id, "jobs_failed")).await?;

        Ok(CrawlProgress {
            total,
            done,
            succeeded,
            failed,
            dropped: done.saturating_sub(succeeded + failed),
            kickoff_finished: self.is_kickoff_finished(id).await?,
            finished: self.store.get(&sub_key(id, "finish")).await?.is_some(),
            cancelled: crawl.cancelled,
        })
    }

    /// Successful job ids in completion order (inclusive range, negative from the end)
    pub async fn done_jobs_ordered(
        &self,
        id: Uuid,
        start: i64,
        stop: i64,
    ) -> Result<Vec<Uuid>, CrawlError> {
        let ids = self
            .store
            .list_range(&sub_key(id, "jobs_done_ordered"), start, stop)
            .await?;
        Ok(ids
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect())
    }
}
