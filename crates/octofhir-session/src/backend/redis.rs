//! Redis cache adapter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, PoolConfig, Runtime};

use super::CacheAdapter;
use crate::config::RedisConfig;
use crate::error::BackendError;
use crate::pattern::KeyPattern;

/// Keys fetched per `SCAN` round-trip and deleted per `DEL`.
const SCAN_BATCH: usize = 500;

/// Redis-backed adapter shared across server instances.
///
/// Every command is bounded by the configured timeout so a hung Redis turns
/// into a `BackendError::Timeout` rather than a stalled request.
#[derive(Clone)]
pub struct RedisAdapter {
    pool: Pool,
    timeout: Duration,
}

impl RedisAdapter {
    pub fn new(pool: Pool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Builds the connection pool without contacting Redis.
    pub fn from_config(config: &RedisConfig) -> Result<Self, BackendError> {
        let timeout = config.timeout();
        let mut pool_config = PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);

        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BackendError::Connection(format!("failed to create Redis pool: {e}")))?;

        Ok(Self::new(pool, timeout))
    }

    /// Builds the pool and verifies that Redis answers a `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, BackendError> {
        let adapter = Self::from_config(config)?;
        adapter
            .bounded(async {
                let mut conn = adapter.connection().await?;
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok(())
            })
            .await?;
        Ok(adapter)
    }

    async fn connection(&self) -> Result<Connection, BackendError> {
        Ok(self.pool.get().await?)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| BackendError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl CacheAdapter for RedisAdapter {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            let data: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok(data)
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError> {
        // PX rejects 0
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        self.bounded(async {
            let mut conn = self.connection().await?;
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, BackendError> {
        let glob = KeyPattern::new(pattern)
            .map_err(|e| BackendError::Command(e.to_string()))?
            .as_redis_glob();

        self.bounded(async {
            let mut conn = self.connection().await?;

            let mut keys: Vec<String> = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&glob)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }

            // SCAN may return a key more than once
            keys.sort_unstable();
            keys.dedup();

            let mut removed = 0u64;
            for chunk in keys.chunks(SCAN_BATCH) {
                let n: u64 = redis::cmd("DEL").arg(chunk).query_async(&mut conn).await?;
                removed += n;
            }
            Ok(removed)
        })
        .await
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.pool.close();
        Ok(())
    }
}

/// Strips credentials from a connection URL for logging.
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://***@{}", &rest[at + 1..]),
        None => url.to_string(),
    }
}

/// Create the L2 adapter based on configuration.
///
/// - **Redis disabled**: returns `None` (in-process tiers only)
/// - **Redis enabled**: connects, falling back to `None` on failure so the
///   engine can start and run without Redis
pub async fn create_cache_adapter(config: &RedisConfig) -> Option<Arc<dyn CacheAdapter>> {
    if !config.enabled {
        tracing::info!("Redis disabled, session cache runs in-process only");
        return None;
    }

    tracing::info!(url = %redact_url(&config.url), "Connecting session cache to Redis");

    match RedisAdapter::connect(config).await {
        Ok(adapter) => {
            tracing::info!("Session cache connected to Redis");
            Some(Arc::new(adapter))
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to in-process session cache."
            );
            None
        }
    }
}
