//! # octofhir-session
//!
//! Session validation, two-tier caching and token rotation for the OctoFHIR
//! server.
//!
//! This crate provides:
//! - Session lookup through an in-process L1 cache, a shared L2 cache
//!   (Redis or in-memory) and the durable session store
//! - Coalescing of concurrent lookups for the same session id
//! - Tenant isolation on every cache hit
//! - Rotation of session ids nearing expiry, with debounce and rate limiting
//! - A persistence facade that falls back to an in-process map when its
//!   backend is unavailable
//!
//! ## Modules
//!
//! - [`engine`] - The [`SessionEngine`] service object and its lifecycle
//! - [`validator`] - L1 → L2 → durable lookup with coalescing
//! - [`rotation`] - Rotation state machine and [`TokenRotator`]
//! - [`authority`] - The durable store interface and a store-backed implementation
//! - [`store`] - Session persistence facade with backend failover
//! - [`backend`] - Cache adapters (Redis, in-memory)
//! - [`activity`] - Per-session activity and rotation bookkeeping
//! - [`rate_limit`] - Rotation rate limiters
//! - [`tenant`] - Tenant isolation guard
//! - [`config`] - Engine configuration and loading

pub mod activity;
pub mod authority;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pattern;
pub mod rate_limit;
pub mod rotation;
pub mod store;
pub mod tenant;
pub mod types;
pub mod validator;

pub use activity::{
    ActivityRecord, ActivityStats, ActivityTracker, CompletedRotation, RotationGate,
    RotationStatus,
};
pub use authority::{SessionAuthority, StoreAuthority, generate_session_id};
pub use backend::{CacheAdapter, MemoryAdapter, RedisAdapter, create_cache_adapter};
pub use config::{
    CacheSettings, ConfigError, RateLimitingConfig, RedisConfig, RotationConfig, SessionConfig,
};
pub use engine::{EngineStats, SessionEngine, SessionEngineBuilder, SweepReport};
pub use error::{BackendError, SessionError};
pub use pattern::KeyPattern;
pub use rate_limit::{NoRateLimit, RotationRateLimiter, WindowRateLimiter};
pub use rotation::{RotationOutcome, RotationState, TokenRotator};
pub use store::{SessionStore, StoreStats};
pub use tenant::TenantGuard;
pub use types::{
    CacheEntry, RequestContext, SessionRecord, SessionTokenData, UserSnapshot, ValidatedSession,
    redact_session_id,
};
pub use validator::{SessionValidator, ValidatorStats};

/// Type alias for session engine results.
pub type SessionResult<T> = Result<T, SessionError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use octofhir_session::prelude::*;
/// ```
pub mod prelude {
    pub use crate::SessionResult;
    pub use crate::authority::{SessionAuthority, StoreAuthority};
    pub use crate::config::SessionConfig;
    pub use crate::engine::SessionEngine;
    pub use crate::error::SessionError;
    pub use crate::rotation::RotationOutcome;
    pub use crate::store::SessionStore;
    pub use crate::types::{RequestContext, UserSnapshot};
}
