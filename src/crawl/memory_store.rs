//! In-process coordination store for single-node runs and tests
//!
//! Every operation runs inside one mutex critical section, which makes
//! [`claim_members`](CoordinationStore::claim_members) atomic the same way the
//! Lua script is on Redis. Expired entries are dropped lazily on access.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::error::CrawlError;
use super::store::{ClaimOutcome, CoordinationStore, MemberClaim};

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

type Table<T> = HashMap<String, Expiring<T>>;

/// Live value under `key`, evicting it first if it has expired
fn live<'a, T>(table: &'a mut Table<T>, key: &str) -> Option<&'a mut T> {
    if table
        .get(key)
        .is_some_and(|entry| entry.expires_at <= Instant::now())
    {
        table.remove(key);
    }
    table.get_mut(key).map(|entry| &mut entry.value)
}

/// Live value under `key`, created empty if missing, with its expiry refreshed
fn touch<'a, T: Default>(table: &'a mut Table<T>, key: &str, ttl: Duration) -> &'a mut T {
    live(table, key);
    let expires_at = Instant::now() + ttl;
    let entry = table.entry(key.to_string()).or_insert_with(|| Expiring {
        value: T::default(),
        expires_at,
    });
    entry.expires_at = expires_at;
    &mut entry.value
}

#[derive(Debug, Default)]
struct Tables {
    strings: Table<String>,
    sets: Table<HashSet<String>>,
    lists: Table<Vec<String>>,
}

/// [`CoordinationStore`] kept in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, CrawlError> {
        self.tables.lock().map_err(|_| CrawlError::LockPoisoned)
    }
}

/// Resolve a Redis-style inclusive index range against `len`
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), CrawlError> {
        self.lock().map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CrawlError> {
        let mut tables = self.lock()?;
        Ok(live(&mut tables.strings, key).cloned())
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CrawlError> {
        let mut tables = self.lock()?;
        *touch(&mut tables.strings, key, ttl) = value.to_string();
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CrawlError> {
        let mut tables = self.lock()?;
        if live(&mut tables.strings, key).is_some() {
            return Ok(false);
        }
        *touch(&mut tables.strings, key, ttl) = value.to_string();
        Ok(true)
    }

    async fn set_add(
        &self,
        key: &str,
        members: &[String],
        ttl: Duration,
    ) -> Result<u64, CrawlError> {
        let mut tables = self.lock()?;
        let set = touch(&mut tables.sets, key, ttl);
        let added = members
            .iter()
            .filter(|member| set.insert((*member).clone()))
            .count();
        Ok(added as u64)
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64, CrawlError> {
        let mut tables = self.lock()?;
        let Some(set) = live(&mut tables.sets, key) else {
            return Ok(0);
        };
        let removed = members.iter().filter(|member| set.remove(*member)).count();
        Ok(removed as u64)
    }

    async fn set_len(&self, key: &str) -> Result<u64, CrawlError> {
        let mut tables = self.lock()?;
        Ok(live(&mut tables.sets, key).map_or(0, |set| set.len() as u64))
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, CrawlError> {
        let mut tables = self.lock()?;
        Ok(live(&mut tables.sets, key).is_some_and(|set| set.contains(member)))
    }

    async fn list_push(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CrawlError> {
        let mut tables = self.lock()?;
        touch(&mut tables.lists, key, ttl).push(value.to_string());
        Ok(())
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, CrawlError> {
        let mut tables = self.lock()?;
        let Some(list) = live(&mut tables.lists, key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((start, stop)) => list[start..=stop].to_vec(),
            None => Vec::new(),
        })
    }

    async fn list_len(&self, key: &str) -> Result<u64, CrawlError> {
        let mut tables = self.lock()?;
        Ok(live(&mut tables.lists, key).map_or(0, |list| list.len() as u64))
    }

    async fn claim_members(&self, claim: &MemberClaim<'_>) -> Result<ClaimOutcome, CrawlError> {
        let mut tables = self.lock()?;

        if let Some(set) = live(&mut tables.sets, claim.key) {
            if claim.members.iter().any(|member| set.contains(member)) {
                return Ok(ClaimOutcome::AlreadyClaimed);
            }
        }

        if let Some(unique) = &claim.unique {
            let used = live(&mut tables.sets, unique.key).map_or(0, |set| set.len() as u64);
            if used >= unique.limit {
                return Ok(ClaimOutcome::LimitReached);
            }
        }

        touch(&mut tables.sets, claim.key, claim.ttl).extend(claim.members.iter().cloned());
        if let Some(unique) = &claim.unique {
            touch(&mut tables.sets, unique.key, claim.ttl).insert(unique.member.to_string());
        }

        Ok(ClaimOutcome::Claimed)
    }
}
