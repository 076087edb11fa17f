//! Durable session persistence with automatic failover.
//!
//! [`SessionStore`] fronts an optional backend adapter (Redis in production)
//! with an in-process map of identical semantics:
//!
//! ```text
//! get/set/delete → backend ──Err──→ in-process map
//!                     │
//!                    Ok ──→ result
//! ```
//!
//! Backend failures are logged and absorbed; callers only ever see a value,
//! a miss, or an acknowledgement.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::SessionResult;
use crate::backend::CacheAdapter;
use crate::error::BackendError;
use crate::metrics;
use crate::pattern::KeyPattern;
use crate::types::{
    SessionRecord, UserSnapshot, from_unix_millis, redact_session_id, to_unix_millis,
};

/// Wire form of a session record (MessagePack).
#[derive(Serialize, Deserialize)]
struct StoredSession {
    user: UserSnapshot,
    expires_at_ms: i64,
}

/// In-process copy of a session record.
#[derive(Clone)]
struct LocalSession {
    user: Arc<UserSnapshot>,
    expires_at: OffsetDateTime,
}

/// Session persistence facade with backend → in-process failover.
pub struct SessionStore {
    backend: Option<Arc<dyn CacheAdapter>>,
    local: DashMap<String, LocalSession>,
    closed: AtomicBool,
    fallbacks: AtomicU64,
}

/// Store statistics for monitoring.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Records held by the in-process map.
    pub local_entries: usize,
    /// Operations served by the in-process map because the backend failed.
    pub fallbacks: u64,
    /// Backend name, or `None` for in-process only.
    pub backend: Option<&'static str>,
}

impl SessionStore {
    /// Creates a store with no backend; everything lives in-process.
    pub fn in_memory() -> Self {
        Self::with_backend(None)
    }

    pub fn with_backend(backend: Option<Arc<dyn CacheAdapter>>) -> Self {
        Self {
            backend,
            local: DashMap::new(),
            closed: AtomicBool::new(false),
            fallbacks: AtomicU64::new(0),
        }
    }

    fn backend(&self) -> Option<&Arc<dyn CacheAdapter>> {
        if self.closed.load(Ordering::Acquire) {
            None
        } else {
            self.backend.as_ref()
        }
    }

    fn note_fallback(&self, operation: &'static str, key: &str, error: &BackendError) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        metrics::record_backend_fallback(operation);
        tracing::warn!(
            operation,
            session = %redact_session_id(key),
            error = %error,
            "Session backend unavailable, using in-process store"
        );
    }

    /// Looks up a session's user.
    pub async fn get(&self, session_id: &str) -> Option<Arc<UserSnapshot>> {
        self.get_record(session_id).await.map(|r| r.user)
    }

    /// Looks up the full record, including its expiry.
    ///
    /// A key absent from the backend is still looked up in-process, so only
    /// keys missing from both tiers are reported as not found.
    pub async fn get_record(&self, session_id: &str) -> Option<SessionRecord> {
        if let Some(backend) = self.backend() {
            match backend.get(session_id).await {
                Ok(Some(bytes)) => match rmp_serde::from_slice::<StoredSession>(&bytes) {
                    Ok(stored) => {
                        let record = SessionRecord {
                            session_id: session_id.to_string(),
                            user: Arc::new(stored.user),
                            expires_at: from_unix_millis(stored.expires_at_ms),
                        };
                        if !record.is_expired() {
                            return Some(record);
                        }
                    }
                    Err(e) => self.note_fallback("get", session_id, &BackendError::from(e)),
                },
                Ok(None) => {}
                Err(e) => self.note_fallback("get", session_id, &e),
            }
        }

        self.get_local(session_id)
    }

    fn get_local(&self, session_id: &str) -> Option<SessionRecord> {
        let now = OffsetDateTime::now_utc();
        let local = self.local.get(session_id).map(|e| e.clone())?;
        if local.expires_at <= now {
            // Self-evict, unless a concurrent set already replaced it
            self.local
                .remove_if(session_id, |_, e| e.expires_at <= now);
            return None;
        }
        Some(SessionRecord {
            session_id: session_id.to_string(),
            user: local.user,
            expires_at: local.expires_at,
        })
    }

    /// Stores a session until `expires_at`.
    ///
    /// Records that are already expired are not stored.
    pub async fn set(&self, session_id: &str, user: Arc<UserSnapshot>, expires_at: OffsetDateTime) {
        let remaining = expires_at - OffsetDateTime::now_utc();
        if !remaining.is_positive() {
            tracing::debug!(
                session = %redact_session_id(session_id),
                "Refusing to store an already expired session"
            );
            self.local.remove(session_id);
            return;
        }
        let ttl = Duration::try_from(remaining).unwrap_or(Duration::ZERO);

        if let Some(backend) = self.backend() {
            let stored = StoredSession {
                user: (*user).clone(),
                expires_at_ms: to_unix_millis(expires_at),
            };
            let written = match rmp_serde::to_vec(&stored) {
                Ok(bytes) => backend.set(session_id, bytes, ttl).await,
                Err(e) => Err(e.into()),
            };
            match written {
                Ok(()) => {
                    // Drop any copy left behind by an earlier outage
                    self.local.remove(session_id);
                    return;
                }
                Err(e) => self.note_fallback("set", session_id, &e),
            }
        }

        self.local
            .insert(session_id.to_string(), LocalSession { user, expires_at });
    }

    /// Deletes a session from both tiers. Returns `true` if either held it.
    pub async fn delete(&self, session_id: &str) -> bool {
        let mut removed = false;
        if let Some(backend) = self.backend() {
            match backend.delete(session_id).await {
                Ok(existed) => removed |= existed,
                Err(e) => self.note_fallback("delete", session_id, &e),
            }
        }
        removed |= self.local.remove(session_id).is_some();
        removed
    }

    /// Like [`delete`](Self::delete), but a failed backend delete is returned
    /// instead of falling back. The in-process copy is removed either way.
    ///
    /// # Errors
    ///
    /// Returns the backend's error when the shared copy may still exist.
    pub async fn try_delete(&self, session_id: &str) -> Result<bool, BackendError> {
        let removed_local = self.local.remove(session_id).is_some();
        let Some(backend) = self.backend() else {
            return Ok(removed_local);
        };
        match backend.delete(session_id).await {
            Ok(existed) => Ok(existed || removed_local),
            Err(e) => {
                self.note_fallback("delete", session_id, &e);
                Err(e)
            }
        }
    }

    /// Deletes every key matching a `*` glob from both tiers.
    ///
    /// Returns the sum of keys removed from the backend and in-process.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the pattern cannot be compiled.
    pub async fn delete_pattern(&self, pattern: &str) -> SessionResult<u64> {
        let matcher = KeyPattern::new(pattern)?;

        let mut removed = 0u64;
        if let Some(backend) = self.backend() {
            match backend.delete_pattern(matcher.as_str()).await {
                Ok(n) => removed += n,
                Err(e) => self.note_fallback("delete_pattern", pattern, &e),
            }
        }

        let before = self.local.len();
        self.local.retain(|key, _| !matcher.is_match(key));
        removed += before.saturating_sub(self.local.len()) as u64;

        tracing::debug!(pattern = %pattern, removed, "Deleted sessions by pattern");
        Ok(removed)
    }

    /// Closes backend connections and clears the in-process map.
    ///
    /// Idempotent. After closing, the store keeps working in-process only.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.close().await {
                tracing::warn!(error = %e, backend = backend.name(), "Failed to close session backend");
            }
        }
        self.local.clear();
        tracing::debug!("Session store closed");
    }

    /// Removes expired in-process records. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let before = self.local.len();
        self.local.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.local.len())
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            local_entries: self.local.len(),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            backend: self.backend.as_ref().map(|b| b.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryAdapter;
    use async_trait::async_trait;

    /// Adapter that fails every call.
    struct BrokenAdapter;

    #[async_trait]
    impl CacheAdapter for BrokenAdapter {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, BackendError> {
            Err(BackendError::Connection("refused".into()))
        }
        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), BackendError> {
            Err(BackendError::Timeout(Duration::from_millis(5)))
        }
        async fn delete(&self, _key: &str) -> Result<bool, BackendError> {
            Err(BackendError::Connection("refused".into()))
        }
        async fn delete_pattern(&self, _pattern: &str) -> Result<u64, BackendError> {
            Err(BackendError::Connection("refused".into()))
        }
    }

    fn user(id: &str) -> Arc<UserSnapshot> {
        Arc::new(UserSnapshot::new(id, format!("user-{id}")).with_tenant("acme"))
    }

    fn in_one_hour() -> OffsetDateTime {
        OffsetDateTime::now_utc() + time::Duration::hours(1)
    }

    #[tokio::test]
    async fn test_in_memory_set_get_delete() {
        let store = SessionStore::in_memory();
        store.set("s1", user("u1"), in_one_hour()).await;

        let found = store.get("s1").await.unwrap();
        assert_eq!(found.id, "u1");

        assert!(store.delete("s1").await);
        assert!(store.get("s1").await.is_none());
        assert!(!store.delete("s1").await);
    }

    #[tokio::test]
    async fn test_local_records_self_evict() {
        let store = SessionStore::in_memory();
        let soon = OffsetDateTime::now_utc() + time::Duration::milliseconds(20);
        store.set("s1", user("u1"), soon).await;
        assert!(store.get("s1").await.is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(store.get("s1").await.is_none());
        assert_eq!(store.stats().local_entries, 0);
    }

    #[tokio::test]
    async fn test_expired_record_is_not_stored() {
        let store = SessionStore::in_memory();
        let past = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        store.set("s1", user("u1"), past).await;
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_backend_roundtrip_keeps_local_empty() {
        let backend = Arc::new(MemoryAdapter::new());
        let store = SessionStore::with_backend(Some(backend.clone()));

        store.set("s1", user("u1"), in_one_hour()).await;
        assert_eq!(backend.len(), 1);
        assert_eq!(store.stats().local_entries, 0);

        let record = store.get_record("s1").await.unwrap();
        assert_eq!(record.user.tenant_id.as_deref(), Some("acme"));
        assert!(!record.is_expired());
    }

    #[tokio::test]
    async fn test_failing_backend_degrades_to_local() {
        let store = SessionStore::with_backend(Some(Arc::new(BrokenAdapter)));

        store.set("s1", user("u1"), in_one_hour()).await;
        assert_eq!(store.get("s1").await.unwrap().id, "u1");
        assert!(store.delete("s1").await);
        assert!(store.get("s1").await.is_none());

        let stats = store.stats();
        assert_eq!(stats.backend, Some("broken"));
        assert!(stats.fallbacks >= 4);
    }

    #[tokio::test]
    async fn test_delete_pattern_sums_both_tiers() {
        let backend = Arc::new(MemoryAdapter::new());
        let store = SessionStore::with_backend(Some(backend.clone()));

        store.set("user:1", user("1"), in_one_hour()).await;
        store.set("admin:1", user("a"), in_one_hour()).await;
        // Simulates a record written during an earlier backend outage
        store.local.insert(
            "user:2".to_string(),
            LocalSession {
                user: user("2"),
                expires_at: in_one_hour(),
            },
        );

        assert_eq!(store.delete_pattern("user:*").await.unwrap(), 2);
        assert!(store.get("user:1").await.is_none());
        assert!(store.get("user:2").await.is_none());
        assert!(store.get("admin:1").await.is_some());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let backend = Arc::new(MemoryAdapter::new());
        let store = SessionStore::with_backend(Some(backend.clone()));
        store.set("s1", user("u1"), in_one_hour()).await;

        store.close().await;
        store.close().await;

        assert!(backend.is_empty());
        assert!(store.get("s1").await.is_none());

        // Still usable in-process after close
        store.set("s2", user("u2"), in_one_hour()).await;
        assert!(store.get("s2").await.is_some());
    }
}
