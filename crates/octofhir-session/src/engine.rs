//! The session engine: one explicitly constructed service object owning the
//! caches, the coalescing map, rotation bookkeeping and the sweep task.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(SessionStore::in_memory());
//! let authority = Arc::new(StoreAuthority::new(store));
//!
//! let engine = SessionEngine::builder(SessionConfig::default())
//!     .authority(authority.clone())
//!     .build()?;
//! engine.start();
//!
//! let session_id = authority.issue(user, expires_at).await;
//! if let Some(user) = engine.resolve_user(&session_id, Some("acme")).await {
//!     let session_id = engine.maybe_rotate(&session_id, &user, &ctx).await?;
//! }
//!
//! engine.stop().await;
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::activity::{ActivityStats, ActivityTracker};
use crate::authority::SessionAuthority;
use crate::backend::{CacheAdapter, create_cache_adapter};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::rate_limit::{NoRateLimit, RotationRateLimiter, WindowRateLimiter};
use crate::rotation::{RotationOutcome, TokenRotator};
use crate::tenant::TenantGuard;
use crate::types::{RequestContext, UserSnapshot, redact_session_id};
use crate::validator::{SessionValidator, ValidatorStats};
use crate::SessionResult;

/// Result of one [`SessionEngine::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Activity/debounce records dropped after `2 × cache TTL` idle.
    pub activity_removed: usize,
    /// Stale L1 entries dropped.
    pub cache_removed: usize,
    /// Lapsed rate-limit windows dropped.
    pub rate_limit_removed: usize,
}

/// Engine statistics for monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub validator: ValidatorStats,
    pub activity: ActivityStats,
    pub authority_attached: bool,
    pub running: bool,
    /// L2 backend name, or `None` when caching in-process only.
    pub cache_backend: Option<&'static str>,
}

/// Builder for [`SessionEngine`].
pub struct SessionEngineBuilder {
    config: SessionConfig,
    cache_adapter: Option<Arc<dyn CacheAdapter>>,
    authority: Option<Arc<dyn SessionAuthority>>,
    rate_limiter: Option<Arc<dyn RotationRateLimiter>>,
}

impl SessionEngineBuilder {
    /// Sets the L2 cache adapter. Without one, caching is in-process only.
    #[must_use]
    pub fn cache_adapter(mut self, adapter: Arc<dyn CacheAdapter>) -> Self {
        self.cache_adapter = Some(adapter);
        self
    }

    /// Attaches the durable authority up front.
    #[must_use]
    pub fn authority(mut self, authority: Arc<dyn SessionAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Overrides the rate limiter derived from configuration.
    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<dyn RotationRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Validates the configuration and builds the engine.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if the configuration is
    /// inconsistent (for example a rotation threshold not below the session
    /// lifetime).
    pub fn build(self) -> SessionResult<SessionEngine> {
        self.config.validate()?;

        let rate_limiter: Arc<dyn RotationRateLimiter> = match self.rate_limiter {
            Some(limiter) => limiter,
            None if self.config.rate_limiting.enabled => {
                Arc::new(WindowRateLimiter::from_config(&self.config.rate_limiting))
            }
            None => Arc::new(NoRateLimit),
        };

        let activity = Arc::new(ActivityTracker::new());
        let validator = SessionValidator::new(
            self.config.cache.ttl(),
            TenantGuard::new(self.config.tenant_isolation),
            self.cache_adapter.clone(),
            Arc::clone(&activity),
        );
        let rotator = TokenRotator::new(
            self.config.rotation.clone(),
            validator.clone(),
            Arc::clone(&activity),
            rate_limiter,
        );

        Ok(SessionEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                validator,
                rotator,
                activity,
                cache_adapter: self.cache_adapter,
                authority: RwLock::new(self.authority),
                sweeper: Mutex::new(None),
            }),
        })
    }
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct EngineInner {
    config: SessionConfig,
    validator: SessionValidator,
    rotator: TokenRotator,
    activity: Arc<ActivityTracker>,
    cache_adapter: Option<Arc<dyn CacheAdapter>>,
    authority: RwLock<Option<Arc<dyn SessionAuthority>>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl EngineInner {
    fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            activity_removed: self.activity.sweep(self.config.cache.ttl() * 2),
            cache_removed: self.validator.cleanup_expired(),
            rate_limit_removed: self.rotator.rate_limiter().cleanup_expired(),
        };
        tracing::debug!(
            activity_removed = report.activity_removed,
            cache_removed = report.cache_removed,
            rate_limit_removed = report.rate_limit_removed,
            "Session sweep completed"
        );
        report
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.cancel.cancel();
        }
    }
}

/// Session validation, caching and rotation service.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

impl SessionEngine {
    pub fn builder(config: SessionConfig) -> SessionEngineBuilder {
        SessionEngineBuilder {
            config,
            cache_adapter: None,
            authority: None,
            rate_limiter: None,
        }
    }

    /// Builds an engine with the L2 adapter described by `config.redis`.
    ///
    /// An unreachable Redis is logged and the engine runs in-process only.
    pub async fn connect(
        config: SessionConfig,
        authority: Option<Arc<dyn SessionAuthority>>,
    ) -> SessionResult<Self> {
        let mut builder = Self::builder(config);
        if let Some(adapter) = create_cache_adapter(&builder.config.redis).await {
            builder = builder.cache_adapter(adapter);
        }
        if let Some(authority) = authority {
            builder = builder.authority(authority);
        }
        builder.build()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn validator(&self) -> &SessionValidator {
        &self.inner.validator
    }

    /// Attaches (or replaces) the durable authority.
    pub fn attach_authority(&self, authority: Arc<dyn SessionAuthority>) {
        *self.inner.authority.write() = Some(authority);
        tracing::info!("Durable session authority attached");
    }

    /// Detaches the durable authority. Cached sessions keep resolving.
    pub fn detach_authority(&self) -> Option<Arc<dyn SessionAuthority>> {
        let previous = self.inner.authority.write().take();
        if previous.is_some() {
            tracing::info!("Durable session authority detached");
        }
        previous
    }

    fn authority(&self) -> Option<Arc<dyn SessionAuthority>> {
        self.inner.authority.read().clone()
    }

    /// Resolves a session id to its user for a request scoped to `tenant_id`.
    ///
    /// `None` means unauthenticated: unknown, expired, other-tenant, or the
    /// durable store is not available yet.
    pub async fn resolve_user(
        &self,
        session_id: &str,
        tenant_id: Option<&str>,
    ) -> Option<Arc<UserSnapshot>> {
        self.inner
            .validator
            .resolve(session_id, tenant_id, self.authority())
            .await
    }

    /// Runs the rotation policy for a resolved session and reports what
    /// happened.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidSession`] if the session's token data is
    ///   missing, mismatched or expired; the caller should clear its cookie
    /// - [`SessionError::StoreUnavailable`] if no durable authority is attached
    pub async fn rotate(
        &self,
        session_id: &str,
        user: &UserSnapshot,
        ctx: &RequestContext,
    ) -> SessionResult<RotationOutcome> {
        let Some(authority) = self.authority() else {
            return Err(SessionError::store_unavailable(
                "durable session authority is not attached",
            ));
        };
        self.inner
            .rotator
            .rotate(session_id, user, ctx, authority.as_ref())
            .await
    }

    /// Like [`rotate`](Self::rotate) but returns only the session id the
    /// caller should send back (equal to `session_id` if nothing changed).
    pub async fn maybe_rotate(
        &self,
        session_id: &str,
        user: &UserSnapshot,
        ctx: &RequestContext,
    ) -> SessionResult<String> {
        Ok(self.rotate(session_id, user, ctx).await?.into_session_id())
    }

    /// Evicts a session from every cache tier and drops its bookkeeping.
    ///
    /// Does not touch the durable record; revoke it there for a logout.
    pub async fn invalidate(&self, session_id: &str) {
        self.inner.validator.evict(session_id).await;
        self.inner.activity.remove(session_id);
        tracing::debug!(session = %redact_session_id(session_id), "Session invalidated");
    }

    /// Drops idle bookkeeping, stale cache entries and lapsed rate-limit
    /// windows.
    pub fn sweep(&self) -> SweepReport {
        self.inner.sweep()
    }

    /// Starts the periodic sweep. Must be called within a Tokio runtime.
    ///
    /// Idempotent.
    pub fn start(&self) {
        let mut slot = self.inner.sweeper.lock();
        if slot.is_some() {
            return;
        }

        let period = self.inner.config.cache.sweep_interval;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(
            Arc::downgrade(&self.inner),
            period,
            cancel.clone(),
        ));
        *slot = Some(Sweeper { cancel, handle });

        tracing::info!(interval = ?period, "Session engine started");
    }

    /// Stops the sweep task and clears process-local state.
    ///
    /// Idempotent. The L2 backend and the durable store are left untouched.
    pub async fn stop(&self) {
        let sweeper = self.inner.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.cancel.cancel();
            if let Err(e) = sweeper.handle.await {
                tracing::warn!(error = %e, "Session sweep task ended abnormally");
            }
            tracing::info!("Session engine stopped");
        }

        self.inner.validator.clear();
        self.inner.activity.clear();
    }

    pub fn is_running(&self) -> bool {
        self.inner.sweeper.lock().is_some()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            validator: self.inner.validator.stats(),
            activity: self.inner.activity.stats(),
            authority_attached: self.inner.authority.read().is_some(),
            running: self.is_running(),
            cache_backend: self.inner.cache_adapter.as_ref().map(|a| a.name()),
        }
    }
}

async fn run_sweeper(engine: Weak<EngineInner>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.sweep();
            }
        }
    }
}
