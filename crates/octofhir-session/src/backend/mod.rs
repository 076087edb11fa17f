//! Pluggable key/value backends for the shared cache tier.
//!
//! ## Adapters
//!
//! - [`MemoryAdapter`]: DashMap with per-key expiry, for single-instance
//!   deployments and tests
//! - [`RedisAdapter`]: pooled Redis connection shared across instances
//!
//! Every call returns a `Result<_, BackendError>`. Callers choose the next
//! tier by matching on it; nothing in this module logs or retries.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BackendError;

pub use self::memory::MemoryAdapter;
pub use self::redis::{RedisAdapter, create_cache_adapter};

/// A key/value store with TTL and pattern-based deletion.
///
/// Keys are raw session ids. Values are opaque bytes (MessagePack in this
/// crate).
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// Short backend name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Get a value. `Ok(None)` means the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Store a value that expires after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError>;

    /// Delete a key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Delete every key matching a `*` glob. Returns the number removed.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, BackendError>;

    /// Release connections. Further calls may fail with `BackendError::Closed`.
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
