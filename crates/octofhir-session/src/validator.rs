//! Session validation through the cache tiers.
//!
//! Lookup order for a session id:
//!
//! ```text
//! L1 (in-process) ─miss─→ L2 (CacheAdapter) ─miss─→ durable authority
//!        │                       │                         │
//!   tenant guard            tenant guard            coalesced per id,
//!   refresh + write-through seed L1                 populate L1 + L2
//! ```
//!
//! Concurrent misses for the same id share a single durable round-trip. The
//! lookup runs on its own task, so callers that give up do not cancel it and
//! its result still warms the caches.
//!
//! Ids retired by rotation or invalidation are tombstoned for one cache TTL.
//! A lookup that settles after the retirement will not re-seed either tier.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::activity::ActivityTracker;
use crate::authority::SessionAuthority;
use crate::backend::CacheAdapter;
use crate::metrics;
use crate::tenant::TenantGuard;
use crate::types::{CacheEntry, UserSnapshot, from_unix_millis, redact_session_id, to_unix_millis};

/// Prefix of coalescing keys.
const LOOKUP_KEY_PREFIX: &str = "validateSession:";

type SharedLookup = Shared<BoxFuture<'static, Option<Arc<UserSnapshot>>>>;

/// Wire form of an L2 cache entry (MessagePack).
#[derive(Serialize, Deserialize)]
struct CachedSession {
    user: UserSnapshot,
    cached_at_ms: i64,
    #[serde(default)]
    expires_at_ms: Option<i64>,
}

impl CachedSession {
    fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            user: (*entry.user).clone(),
            cached_at_ms: to_unix_millis(entry.cached_at),
            expires_at_ms: entry.expires_at.map(to_unix_millis),
        }
    }

    fn into_entry(self) -> CacheEntry {
        CacheEntry {
            user: Arc::new(self.user),
            cached_at: from_unix_millis(self.cached_at_ms),
            expires_at: self.expires_at_ms.map(from_unix_millis),
        }
    }
}

struct InFlight {
    generation: u64,
    lookup: SharedLookup,
}

#[derive(Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    durable_lookups: AtomicU64,
    coalesced: AtomicU64,
    l2_errors: AtomicU64,
}

/// Validator statistics for monitoring.
#[derive(Debug, Clone, Default)]
pub struct ValidatorStats {
    pub l1_entries: usize,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    /// Durable round-trips actually performed.
    pub durable_lookups: u64,
    /// Callers that joined an in-flight durable lookup instead of starting one.
    pub coalesced_lookups: u64,
    /// Failed calls to the shared cache tier.
    pub l2_errors: u64,
    pub in_flight: usize,
    pub retired: usize,
}

struct ValidatorInner {
    l1: DashMap<String, CacheEntry>,
    l2: Option<Arc<dyn CacheAdapter>>,
    in_flight: DashMap<String, InFlight>,
    /// Tombstones: retired id -> when the tombstone lapses.
    retired: DashMap<String, Instant>,
    next_generation: AtomicU64,
    guard: TenantGuard,
    activity: Arc<ActivityTracker>,
    ttl: Duration,
    counters: Counters,
}

/// Resolves session ids to users through L1, L2 and the durable authority.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SessionValidator {
    inner: Arc<ValidatorInner>,
}

impl SessionValidator {
    pub fn new(
        ttl: Duration,
        guard: TenantGuard,
        l2: Option<Arc<dyn CacheAdapter>>,
        activity: Arc<ActivityTracker>,
    ) -> Self {
        Self {
            inner: Arc::new(ValidatorInner {
                l1: DashMap::new(),
                l2,
                in_flight: DashMap::new(),
                retired: DashMap::new(),
                next_generation: AtomicU64::new(0),
                guard,
                activity,
                ttl,
                counters: Counters::default(),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Resolves `session_id` for a request scoped to `tenant_id`.
    ///
    /// Returns `None` for unknown, expired, or other-tenant sessions, and when
    /// no durable authority is available. Never fails.
    pub async fn resolve(
        &self,
        session_id: &str,
        tenant_id: Option<&str>,
        authority: Option<Arc<dyn SessionAuthority>>,
    ) -> Option<Arc<UserSnapshot>> {
        if session_id.is_empty() {
            return None;
        }
        let inner = &self.inner;

        // L1
        let cached = inner.l1.get(session_id).map(|e| e.clone());
        if let Some(entry) = cached {
            if entry.is_fresh(inner.ttl) {
                inner.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_hit("l1");
                tracing::trace!(
                    session = %redact_session_id(session_id),
                    tier = "l1",
                    "Session cache hit"
                );
                let user = inner.guard.admit(session_id, Arc::clone(&entry.user), tenant_id)?;

                let refreshed = entry.refreshed();
                let still_cached = match inner.l1.get_mut(session_id) {
                    Some(mut slot) => {
                        *slot = refreshed.clone();
                        true
                    }
                    None => false,
                };
                // Evicted while we looked; do not write it back
                if still_cached {
                    inner.write_l2(session_id, &refreshed).await;
                    inner.activity.record_extension(session_id);
                }
                return Some(user);
            }
            inner.l1.remove_if(session_id, |_, e| !e.is_fresh(inner.ttl));
        }

        // L2
        if let Some(entry) = inner.read_l2(session_id).await {
            if entry.is_fresh(inner.ttl) {
                inner.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_hit("l2");
                tracing::trace!(
                    session = %redact_session_id(session_id),
                    tier = "l2",
                    "Session cache hit"
                );
                let user = inner.guard.admit(session_id, Arc::clone(&entry.user), tenant_id)?;

                if !inner.is_retired(session_id) {
                    inner.l1.insert(session_id.to_string(), entry);
                }
                inner.activity.touch(session_id);
                return Some(user);
            }
        }

        inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_miss();
        tracing::debug!(
            session = %redact_session_id(session_id),
            tenant = ?tenant_id,
            "Session cache miss"
        );

        // Durable
        let Some(authority) = authority else {
            tracing::debug!(
                session = %redact_session_id(session_id),
                "Durable session store not available, treating session as unauthenticated"
            );
            return None;
        };

        let lookup = self.join_or_start_lookup(session_id, tenant_id, authority);
        let user = lookup.await?;
        inner.guard.admit(session_id, user, tenant_id)
    }

    fn join_or_start_lookup(
        &self,
        session_id: &str,
        tenant_id: Option<&str>,
        authority: Arc<dyn SessionAuthority>,
    ) -> SharedLookup {
        let key = format!("{LOOKUP_KEY_PREFIX}{session_id}");
        match self.inner.in_flight.entry(key) {
            Entry::Occupied(occupied) => {
                self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                metrics::record_coalesced_lookup();
                occupied.get().lookup.clone()
            }
            Entry::Vacant(vacant) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let release = InFlightRelease {
                    inner: Arc::clone(&self.inner),
                    key: vacant.key().clone(),
                    generation,
                };
                let task = tokio::spawn(durable_lookup(
                    Arc::clone(&self.inner),
                    authority,
                    session_id.to_string(),
                    tenant_id.map(str::to_owned),
                    release,
                ));
                let lookup = async move {
                    match task.await {
                        Ok(user) => user,
                        Err(e) => {
                            tracing::error!(error = %e, "Durable session lookup task failed");
                            None
                        }
                    }
                }
                .boxed()
                .shared();
                vacant.insert(InFlight {
                    generation,
                    lookup: lookup.clone(),
                });
                lookup
            }
        }
    }

    /// Writes a fresh entry for `session_id` into L1 and L2.
    ///
    /// `expires_at` is the durable record's expiry and caps how long the
    /// entry can be served.
    pub async fn store_entry(
        &self,
        session_id: &str,
        user: Arc<UserSnapshot>,
        expires_at: Option<OffsetDateTime>,
    ) {
        self.inner
            .populate(session_id, CacheEntry::new(user, expires_at))
            .await;
    }

    /// Removes `session_id` from both tiers and tombstones it for one TTL.
    pub async fn evict(&self, session_id: &str) {
        let inner = &self.inner;
        inner
            .retired
            .insert(session_id.to_string(), Instant::now() + inner.ttl);
        inner.l1.remove(session_id);
        inner
            .in_flight
            .remove(&format!("{LOOKUP_KEY_PREFIX}{session_id}"));

        if let Some(l2) = &inner.l2 {
            if let Err(e) = l2.delete(session_id).await {
                inner.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_backend_fallback("cache_delete");
                tracing::warn!(
                    session = %redact_session_id(session_id),
                    error = %e,
                    "Failed to evict session from cache backend"
                );
            }
        }
    }

    /// Removes stale L1 entries and lapsed tombstones. Returns the number of
    /// L1 entries removed.
    pub fn cleanup_expired(&self) -> usize {
        let inner = &self.inner;
        let before = inner.l1.len();
        inner.l1.retain(|_, e| e.is_fresh(inner.ttl));
        let removed = before.saturating_sub(inner.l1.len());

        let now = Instant::now();
        inner.retired.retain(|_, until| *until > now);
        removed
    }

    /// Drops all process-local state. In-flight lookups finish on their own.
    pub fn clear(&self) {
        self.inner.l1.clear();
        self.inner.in_flight.clear();
        self.inner.retired.clear();
    }

    pub fn stats(&self) -> ValidatorStats {
        let inner = &self.inner;
        let c = &inner.counters;
        ValidatorStats {
            l1_entries: inner.l1.len(),
            l1_hits: c.l1_hits.load(Ordering::Relaxed),
            l2_hits: c.l2_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            durable_lookups: c.durable_lookups.load(Ordering::Relaxed),
            coalesced_lookups: c.coalesced.load(Ordering::Relaxed),
            l2_errors: c.l2_errors.load(Ordering::Relaxed),
            in_flight: inner.in_flight.len(),
            retired: inner.retired.len(),
        }
    }
}

impl ValidatorInner {
    fn is_retired(&self, session_id: &str) -> bool {
        let now = Instant::now();
        match self.retired.get(session_id).map(|until| *until) {
            Some(until) if until > now => true,
            Some(_) => {
                self.retired.remove_if(session_id, |_, until| *until <= now);
                false
            }
            None => false,
        }
    }

    async fn read_l2(&self, session_id: &str) -> Option<CacheEntry> {
        let l2 = self.l2.as_ref()?;
        if self.is_retired(session_id) {
            return None;
        }
        match l2.get(session_id).await {
            Ok(Some(bytes)) => match rmp_serde::from_slice::<CachedSession>(&bytes) {
                Ok(cached) => Some(cached.into_entry()),
                Err(e) => {
                    tracing::warn!(
                        session = %redact_session_id(session_id),
                        error = %e,
                        "Discarding undecodable session cache entry"
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_backend_fallback("cache_get");
                tracing::warn!(
                    backend = l2.name(),
                    session = %redact_session_id(session_id),
                    error = %e,
                    "Session cache backend unavailable, treating as miss"
                );
                None
            }
        }
    }

    /// Writes through to L2. Failures are logged and swallowed.
    async fn write_l2(&self, session_id: &str, entry: &CacheEntry) {
        let Some(l2) = &self.l2 else {
            return;
        };
        if self.is_retired(session_id) {
            return;
        }

        let mut ttl = self.ttl;
        if let Some(expires_at) = entry.expires_at {
            let remaining = expires_at - OffsetDateTime::now_utc();
            if !remaining.is_positive() {
                return;
            }
            ttl = ttl.min(Duration::try_from(remaining).unwrap_or(Duration::ZERO));
        }

        let written = match rmp_serde::to_vec(&CachedSession::from_entry(entry)) {
            Ok(bytes) => l2.set(session_id, bytes, ttl).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
            metrics::record_backend_fallback("cache_set");
            tracing::warn!(
                backend = l2.name(),
                session = %redact_session_id(session_id),
                error = %e,
                "Failed to write session cache entry"
            );
            return;
        }

        // Retired while the write was in flight
        if self.is_retired(session_id) {
            if let Err(e) = l2.delete(session_id).await {
                self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_backend_fallback("cache_delete");
                tracing::warn!(
                    backend = l2.name(),
                    session = %redact_session_id(session_id),
                    error = %e,
                    "Failed to remove retired session from cache backend"
                );
            }
        }
    }

    async fn populate(&self, session_id: &str, entry: CacheEntry) {
        if self.is_retired(session_id) {
            tracing::debug!(
                session = %redact_session_id(session_id),
                "Not caching retired session"
            );
            return;
        }
        self.l1.insert(session_id.to_string(), entry.clone());
        self.write_l2(session_id, &entry).await;
        self.activity.touch(session_id);
    }
}

/// Removes a coalescing entry when its lookup settles, including on panic.
struct InFlightRelease {
    inner: Arc<ValidatorInner>,
    key: String,
    generation: u64,
}

impl Drop for InFlightRelease {
    fn drop(&mut self) {
        let generation = self.generation;
        self.inner
            .in_flight
            .remove_if(&self.key, |_, f| f.generation == generation);
    }
}

/// Body of a coalesced durable lookup.
///
/// Caches the user only if it passes the initiating caller's tenant guard.
async fn durable_lookup(
    inner: Arc<ValidatorInner>,
    authority: Arc<dyn SessionAuthority>,
    session_id: String,
    tenant_id: Option<String>,
    _release: InFlightRelease,
) -> Option<Arc<UserSnapshot>> {
    inner.counters.durable_lookups.fetch_add(1, Ordering::Relaxed);
    metrics::record_durable_lookup();

    let validated = match authority.lookup_session(&session_id).await {
        Ok(Some(validated)) => validated,
        Ok(None) => {
            tracing::debug!(session = %redact_session_id(&session_id), "Session not found");
            return None;
        }
        Err(e) => {
            tracing::warn!(
                session = %redact_session_id(&session_id),
                error = %e,
                "Durable session lookup failed"
            );
            return None;
        }
    };

    if validated
        .expires_at
        .is_some_and(|exp| exp <= OffsetDateTime::now_utc())
    {
        return None;
    }

    let user = Arc::new(validated.user);
    if inner.guard.permits(&user, tenant_id.as_deref()) {
        inner
            .populate(&session_id, CacheEntry::new(Arc::clone(&user), validated.expires_at))
            .await;
    }
    Some(user)
}
