//! Redis coordination store shared by every worker process

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use super::error::CrawlError;
use super::store::{ClaimOutcome, CoordinationStore, MemberClaim};

/// Atomic group claim
///
/// KEYS[1] claimed set, KEYS[2] limit-guarded set.
/// ARGV[1] ttl seconds, ARGV[2] limit (-1 for none), ARGV[3] unique member
/// ('' for none), ARGV[4..] members.
/// Returns 1 when claimed, 0 when any member existed, -1 when the limit is hit.
const CLAIM_SCRIPT: &str = r#"
for i = 4, #ARGV do
    if redis.call('SISMEMBER', KEYS[1], ARGV[i]) == 1 then
        return 0
    end
end
local limit = tonumber(ARGV[2])
if limit >= 0 and redis.call('SCARD', KEYS[2]) >= limit then
    return -1
end
for i = 4, #ARGV do
    redis.call('SADD', KEYS[1], ARGV[i])
end
redis.call('EXPIRE', KEYS[1], ARGV[1])
if ARGV[3] ~= '' then
    redis.call('SADD', KEYS[2], ARGV[3])
    redis.call('EXPIRE', KEYS[2], ARGV[1])
end
return 1
"#;

static CLAIM: LazyLock<redis::Script> = LazyLock::new(|| redis::Script::new(CLAIM_SCRIPT));

/// Coordination store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis URL (e.g., redis://localhost:6379); empty selects the in-memory store
    pub redis_url: String,

    /// Connection pool size
    pub pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            pool_size: 16,
        }
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
}

/// Redis-backed [`CoordinationStore`]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// Create the pool and verify connectivity
    pub async fn new(config: &StoreConfig) -> Result<Self, CrawlError> {
        let pool = PoolConfig::from_url(&config.redis_url)
            .builder()
            .map_err(|e| CrawlError::CreatePool(e.to_string()))?
            .max_size(config.pool_size.max(1))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| CrawlError::CreatePool(e.to_string()))?;

        let store = Self { pool };
        store.ping().await?;

        tracing::info!(url = %config.redis_url, "Connected to Redis coordination store");
        Ok(store)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), CrawlError> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CrawlError> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CrawlError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CrawlError> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_add(
        &self,
        key: &str,
        members: &[String],
        ttl: Duration,
    ) -> Result<u64, CrawlError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get().await?;
        let (added,): (u64,) = redis::pipe()
            .atomic()
            .sadd(key, members)
            .expire(key, ttl_secs(ttl))
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(added)
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64, CrawlError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get().await?;
        let removed: u64 = conn.srem(key, members).await?;
        Ok(removed)
    }

    async fn set_len(&self, key: &str) -> Result<u64, CrawlError> {
        let mut conn = self.pool.get().await?;
        let len: u64 = conn.scard(key).await?;
        Ok(len)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, CrawlError> {
        let mut conn = self.pool.get().await?;
        let present: bool = conn.sismember(key, member).await?;
        Ok(present)
    }

    async fn list_push(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CrawlError> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::pipe()
            .atomic()
            .rpush(key, value)
            .ignore()
            .expire(key, ttl_secs(ttl))
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, CrawlError> {
        let mut conn = self.pool.get().await?;
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut *conn)
            .await?;
        Ok(items)
    }

    async fn list_len(&self, key: &str) -> Result<u64, CrawlError> {
        let mut conn = self.pool.get().await?;
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn claim_members(&self, claim: &MemberClaim<'_>) -> Result<ClaimOutcome, CrawlError> {
        let (unique_key, limit, unique_member) = match &claim.unique {
            Some(unique) => (
                unique.key,
                i64::try_from(unique.limit).unwrap_or(i64::MAX),
                unique.member,
            ),
            None => (claim.key, -1, ""),
        };

        let mut invocation = CLAIM.prepare_invoke();
        invocation
            .key(claim.key)
            .key(unique_key)
            .arg(ttl_secs(claim.ttl))
            .arg(limit)
            .arg(unique_member);
        for member in claim.members {
            invocation.arg(member);
        }

        let mut conn = self.pool.get().await?;
        let reply: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(match reply {
            1 => ClaimOutcome::Claimed,
            -1 => ClaimOutcome::LimitReached,
            _ => ClaimOutcome::AlreadyClaimed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_secs_is_never_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(86_400)), 86_400);
    }

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert!(config.pool_size > 0);
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_to_connect() {
        let config = StoreConfig {
            redis_url: "redis://127.0.0.1:1".to_string(),
            pool_size: 1,
        };
        assert!(RedisStore::new(&config).await.is_err());
    }
}
