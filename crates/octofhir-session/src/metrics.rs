//! Metrics emitted by the session engine.
//!
//! Recording goes through the `metrics` facade; the host process installs
//! the exporter. Without a recorder every call is a no-op.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const SESSION_CACHE_HITS_TOTAL: &str = "session_cache_hits_total";
    pub const SESSION_CACHE_MISSES_TOTAL: &str = "session_cache_misses_total";
    pub const SESSION_DURABLE_LOOKUPS_TOTAL: &str = "session_durable_lookups_total";
    pub const SESSION_COALESCED_TOTAL: &str = "session_coalesced_lookups_total";
    pub const SESSION_TENANT_MISMATCH_TOTAL: &str = "session_tenant_mismatch_total";
    pub const SESSION_BACKEND_FALLBACKS_TOTAL: &str = "session_backend_fallbacks_total";
    pub const SESSION_ROTATIONS_TOTAL: &str = "session_rotations_total";
    pub const SESSION_TRACKED: &str = "session_tracked";
}

/// Record a cache hit on the given tier (`l1` or `l2`).
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::SESSION_CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::SESSION_CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_durable_lookup() {
    counter!(names::SESSION_DURABLE_LOOKUPS_TOTAL).increment(1);
}

/// Record a caller that joined an in-flight durable lookup.
pub fn record_coalesced_lookup() {
    counter!(names::SESSION_COALESCED_TOTAL).increment(1);
}

pub fn record_tenant_mismatch() {
    counter!(names::SESSION_TENANT_MISMATCH_TOTAL).increment(1);
}

/// Record a backend call that fell through to the in-process tier.
pub fn record_backend_fallback(operation: &'static str) {
    counter!(names::SESSION_BACKEND_FALLBACKS_TOTAL, "operation" => operation).increment(1);
}

/// Record a rotation decision (`rotated`, `debounced`, `rate_limited`, ...).
pub fn record_rotation(outcome: &'static str) {
    counter!(names::SESSION_ROTATIONS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_tracked_sessions(count: usize) {
    gauge!(names::SESSION_TRACKED).set(count as f64);
}
