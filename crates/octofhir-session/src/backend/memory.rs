//! In-process cache adapter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::CacheAdapter;
use crate::error::BackendError;
use crate::pattern::KeyPattern;

struct StoredValue {
    data: Vec<u8>,
    expires_at: Instant,
}

/// DashMap-backed adapter with TTL support.
///
/// Useful as the L2 of a single instance, and as a stand-in for Redis in
/// tests.
#[derive(Default)]
pub struct MemoryAdapter {
    entries: DashMap<String, StoredValue>,
    closed: AtomicBool,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove expired entries. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| v.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.ensure_open()?;
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Ok(Some(entry.data.clone()));
            }
            drop(entry);
            self.entries
                .remove_if(key, |_, v| v.expires_at <= Instant::now());
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.ensure_open()?;
        Ok(self.entries.remove(key).is_some())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, BackendError> {
        self.ensure_open()?;
        let matcher =
            KeyPattern::new(pattern).map_err(|e| BackendError::Command(e.to_string()))?;
        let mut removed = 0u64;
        self.entries.retain(|key, _| {
            if matcher.is_match(key) {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::Release);
        self.entries.clear();
        Ok(())
    }
}
