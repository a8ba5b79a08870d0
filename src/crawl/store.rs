//! Key-value coordination store abstraction
//!
//! The coordinator only needs strings, sets and lists with expiry plus one
//! compound primitive, [`CoordinationStore::claim_members`], which must be
//! atomic: it is what guarantees a URL is locked by exactly one caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::error::CrawlError;

/// Limit-guarded side set updated together with a claim
#[derive(Debug, Clone, Copy)]
pub struct UniqueSlot<'a> {
    pub key: &'a str,
    pub member: &'a str,
    /// The claim fails with [`ClaimOutcome::LimitReached`] once the set holds this many members
    pub limit: u64,
}

/// Atomic "insert all of these members, but only if none is present" request
#[derive(Debug, Clone)]
pub struct MemberClaim<'a> {
    pub key: &'a str,
    pub members: &'a [String],
    pub unique: Option<UniqueSlot<'a>>,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This call inserted every member
    Claimed,
    /// At least one member was already present; nothing was written
    AlreadyClaimed,
    /// The unique slot set is full; nothing was written
    LimitReached,
}

/// Shared fast key-value store backing crawl state
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn ping(&self) -> Result<(), CrawlError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CrawlError>;

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CrawlError>;

    /// Write only when `key` is absent; `true` when this call wrote it
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, CrawlError>;

    /// Add members and refresh the expiry, returning how many were new
    async fn set_add(&self, key: &str, members: &[String], ttl: Duration)
        -> Result<u64, CrawlError>;

    /// Remove members, returning how many were present
    async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64, CrawlError>;

    async fn set_len(&self, key: &str) -> Result<u64, CrawlError>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, CrawlError>;

    /// Append to a list and refresh the expiry
    async fn list_push(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CrawlError>;

    /// Inclusive range with Redis-style negative indexes
    async fn list_range(&self, key: &str, start: i64, stop: i64)
        -> Result<Vec<String>, CrawlError>;

    async fn list_len(&self, key: &str) -> Result<u64, CrawlError>;

    /// Atomically claim a group of set members
    async fn claim_members(&self, claim: &MemberClaim<'_>) -> Result<ClaimOutcome, CrawlError>;
}

pub type SharedStore = Arc<dyn CoordinationStore>;
