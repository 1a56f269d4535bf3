//! Redis cache backend implementation.
//!
//! Plain values are Redis strings. A list is a sorted set scored by creation
//! time that also holds a warm marker member scored `+inf`. The marker keeps
//! an empty-but-warm list alive, and because it lives in the same key it is
//! evicted together with the items: a set without its marker is cold. List
//! mutations run as Lua scripts and are therefore atomic per key.

use super::{CacheBackend, ListPush};
use crate::error::{Error, Result};
use deadpool_redis::redis::{self, Script};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use std::sync::Arc;
use std::time::Duration;

/// Default Redis connection pool size.
/// Override with FEEDKIT_REDIS_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: usize = 16;

/// Member marking a list warm. Cached items start with the `FKIT` envelope
/// magic, so they never collide with it.
const WARM_MARKER: &[u8] = b"#warm";

// KEYS[1] list; ARGV[1] ttl ms (0 = none), ARGV[2] marker, then score/item pairs.
const LIST_INIT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('ZADD', KEYS[1], '+inf', ARGV[2])
for i = 3, #ARGV, 2 do
    redis.call('ZADD', KEYS[1], ARGV[i], ARGV[i + 1])
end
local ttl = tonumber(ARGV[1])
if ttl > 0 then
    redis.call('PEXPIRE', KEYS[1], ttl)
end
return 1
"#;

// KEYS[1] list; ARGV[1] score, ARGV[2] item, ARGV[3] bound, ARGV[4] marker.
const LIST_PUSH_SCRIPT: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[4]) then
    return 0
end
if redis.call('ZSCORE', KEYS[1], ARGV[2]) then
    return 1
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
local bound = tonumber(ARGV[3])
redis.call('ZREMRANGEBYRANK', KEYS[1], 0, -(bound + 2))
return 2
"#;

/// Items of a `ZREVRANGE` reply, or `None` if the warm marker is missing.
fn strip_warm_marker(mut members: Vec<Vec<u8>>) -> Option<Vec<Vec<u8>>> {
    if members.first().map(Vec::as_slice) != Some(WARM_MARKER) {
        return None;
    }
    members.remove(0);
    Some(members)
}

/// Configuration for Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String, // e.g., "redis://localhost:6379/0"
    pub pool_size: usize,
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://localhost:6379".to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

/// Redis backend with connection pooling.
///
/// # Example
///
/// ```no_run
/// # use feed_kit::backend::{CacheBackend, RedisBackend, RedisConfig};
/// # async fn example() -> feed_kit::Result<()> {
/// let backend = RedisBackend::new(RedisConfig::default()).await?;
/// backend.set("post:1", b"value".to_vec(), None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    connection_timeout: Duration,
    list_init: Arc<Script>,
    list_push: Arc<Script>,
}

impl RedisBackend {
    /// Create a backend and verify the pool can reach the server.
    ///
    /// # Errors
    /// Returns `Err` if the pool cannot be built or the server does not answer
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let mut pool_config = Config::from_url(config.url.clone());
        pool_config.pool = Some(PoolConfig::new(config.pool_size));

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::ConfigError(format!("Failed to create connection pool: {}", e)))?;

        let backend = RedisBackend {
            pool,
            connection_timeout: config.connection_timeout,
            list_init: Arc::new(Script::new(LIST_INIT_SCRIPT)),
            list_push: Arc::new(Script::new(LIST_PUSH_SCRIPT)),
        };

        if !backend.health_check().await? {
            return Err(Error::BackendError(format!(
                "Redis at {} did not answer PING",
                config.url
            )));
        }

        info!(
            "✓ Redis backend initialized at {} (pool size: {})",
            config.url, config.pool_size
        );
        Ok(backend)
    }

    /// Create from a URL; pool size comes from `FEEDKIT_REDIS_POOL_SIZE`
    /// when set.
    pub async fn from_url(url: String) -> Result<Self> {
        let pool_size = std::env::var("FEEDKIT_REDIS_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        Self::new(RedisConfig {
            url,
            pool_size,
            ..Default::default()
        })
        .await
    }

    async fn conn(&self) -> Result<Connection> {
        match tokio::time::timeout(self.connection_timeout, self.pool.get()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(Error::BackendError(format!(
                "Failed to get Redis connection: {}",
                e
            ))),
            Err(_) => Err(Error::Timeout(self.connection_timeout)),
        }
    }
}

fn backend_err(op: &str, key: &str, e: redis::RedisError) -> Error {
    Error::BackendError(format!("Redis {} failed for key {}: {}", op, key, e))
}

impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("GET", key, e))?;

        debug!(
            "✓ Redis GET {} -> {}",
            key,
            if value.is_some() { "HIT" } else { "MISS" }
        );
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut command = redis::cmd("SET");
        command.arg(key).arg(value);
        if let Some(ttl) = ttl {
            command.arg("PX").arg(ttl.as_millis() as u64);
        }

        let _: () = command
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("SET", key, e))?;

        debug!("✓ Redis SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("DEL", key, e))?;

        debug!("✓ Redis DEL {}", key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("EXISTS", key, e))?;
        Ok(exists)
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis MGET failed: {}", e)))?;

        debug!("✓ Redis MGET {} keys (batch operation)", keys.len());
        Ok(values)
    }

    async fn mdelete(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis MDEL failed: {}", e)))?;

        debug!("✓ Redis MDELETE {} keys", keys.len());
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let mut conn = match self.conn().await {
            Ok(conn) => conn,
            Err(_) => return Ok(false),
        };
        let pong: std::result::Result<String, _> =
            redis::cmd("PING").query_async(&mut conn).await;
        Ok(pong.is_ok())
    }

    async fn clear_all(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis FLUSHDB failed: {}", e)))?;

        warn!("⚠ Redis FLUSHDB executed - all cache cleared!");
        Ok(())
    }

    async fn list_get(&self, key: &str) -> Result<Option<Vec<Vec<u8>>>> {
        let mut conn = self.conn().await?;
        let members: Vec<Vec<u8>> = redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("ZREVRANGE", key, e))?;

        match strip_warm_marker(members) {
            Some(items) => {
                debug!("✓ Redis LIST {} -> {} items", key, items.len());
                Ok(Some(items))
            }
            None => {
                debug!("✓ Redis LIST {} -> COLD", key);
                Ok(None)
            }
        }
    }

    async fn list_init(
        &self,
        key: &str,
        items: Vec<(i64, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let mut invocation = self.list_init.key(key);
        invocation
            .arg(ttl.map(|d| d.as_millis() as u64).unwrap_or(0))
            .arg(WARM_MARKER);
        for (score, item) in items {
            invocation.arg(score).arg(item);
        }

        let written: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend_err("LIST INIT", key, e))?;
        Ok(written == 1)
    }

    async fn list_push(
        &self,
        key: &str,
        score: i64,
        item: Vec<u8>,
        bound: usize,
    ) -> Result<ListPush> {
        let mut conn = self.conn().await?;
        let outcome: i64 = self
            .list_push
            .key(key)
            .arg(score)
            .arg(item)
            .arg(bound as u64)
            .arg(WARM_MARKER)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend_err("LIST PUSH", key, e))?;

        Ok(match outcome {
            0 => ListPush::Cold,
            1 => ListPush::Present,
            _ => ListPush::Inserted,
        })
    }
}
