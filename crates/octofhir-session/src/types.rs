//! Core session types shared across the engine.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Snapshot of the user identity bound to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
    /// User's unique identifier.
    pub id: String,

    /// Username for display/logging.
    pub username: String,

    /// Tenant owning this user. `None` for tenant-less deployments.
    #[serde(default)]
    pub tenant_id: Option<String>,

    /// User's assigned roles.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Additional attributes carried with the identity.
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl UserSnapshot {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            tenant_id: None,
            roles: Vec::new(),
            attributes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    #[must_use]
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Returns `true` if the user has a specific role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// A durable session record as held by the persistence facade.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub user: Arc<UserSnapshot>,
    pub expires_at: OffsetDateTime,
}

impl SessionRecord {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= OffsetDateTime::now_utc()
    }
}

/// Token metadata returned by the durable store for rotation decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTokenData {
    pub expires_at: OffsetDateTime,
    pub user_id: String,
}

/// A session confirmed by the durable store.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSession {
    pub user: UserSnapshot,
    /// Absolute expiry of the durable record, when the store reports it.
    pub expires_at: Option<OffsetDateTime>,
}

/// Derived, disposable copy of a session's user held in L1/L2.
///
/// A hit is honored only while `cached_at + ttl >= now` and the optional
/// durable expiry ceiling has not passed.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub user: Arc<UserSnapshot>,
    pub cached_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
}

impl CacheEntry {
    pub fn new(user: Arc<UserSnapshot>, expires_at: Option<OffsetDateTime>) -> Self {
        Self {
            user,
            cached_at: OffsetDateTime::now_utc(),
            expires_at,
        }
    }

    /// Checks the TTL window and the expiry ceiling.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        let now = OffsetDateTime::now_utc();
        if self.expires_at.is_some_and(|exp| exp <= now) {
            return false;
        }
        self.cached_at + ttl >= now
    }

    /// Same entry with `cached_at` reset to now.
    pub fn refreshed(&self) -> Self {
        Self {
            user: Arc::clone(&self.user),
            cached_at: OffsetDateTime::now_utc(),
            expires_at: self.expires_at,
        }
    }
}

/// Request attributes consumed by the rotation rate limiter.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client_ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Key used to bucket rate-limit counters.
    pub fn client_key(&self) -> String {
        match self.client_ip {
            Some(ip) => ip.to_string(),
            None => "anonymous".to_string(),
        }
    }
}

/// Shortens a session id for log output. Full ids are bearer credentials
/// and must never be logged.
pub fn redact_session_id(session_id: &str) -> String {
    let prefix: String = session_id.chars().take(8).collect();
    if prefix.len() < session_id.len() {
        format!("{prefix}…")
    } else {
        prefix
    }
}

/// Converts a timestamp to Unix milliseconds for wire encoding.
pub(crate) fn to_unix_millis(ts: OffsetDateTime) -> i64 {
    i64::try_from(ts.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

pub(crate) fn from_unix_millis(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_freshness_follows_ttl() {
        let user = Arc::new(UserSnapshot::new("u1", "alice"));
        let mut entry = CacheEntry::new(user, None);
        assert!(entry.is_fresh(Duration::from_secs(60)));

        entry.cached_at -= time::Duration::seconds(120);
        assert!(!entry.is_fresh(Duration::from_secs(60)));
        assert!(entry.refreshed().is_fresh(Duration::from_secs(60)));
    }

    #[test]
    fn test_entry_ceiling_overrides_ttl() {
        let user = Arc::new(UserSnapshot::new("u1", "alice"));
        let past = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        let entry = CacheEntry::new(user, Some(past));
        assert!(!entry.is_fresh(Duration::from_secs(3600)));
        // Refreshing cannot revive an entry past its durable expiry
        assert!(!entry.refreshed().is_fresh(Duration::from_secs(3600)));
    }

    #[test]
    fn test_redact_session_id() {
        assert_eq!(redact_session_id("abcdef0123456789"), "abcdef01…");
        assert_eq!(redact_session_id("short"), "short");
    }

    #[test]
    fn test_client_key() {
        let ctx = RequestContext::new().with_client_ip("10.0.0.7".parse().unwrap());
        assert_eq!(ctx.client_key(), "10.0.0.7");
        assert_eq!(RequestContext::new().client_key(), "anonymous");
    }

    #[test]
    fn test_unix_millis_roundtrip() {
        let now = OffsetDateTime::now_utc();
        let back = from_unix_millis(to_unix_millis(now));
        assert!((now - back).abs() < time::Duration::milliseconds(1));
    }

    #[test]
    fn test_unix_millis_extremes() {
        let far = time::PrimitiveDateTime::MAX.assume_utc();
        assert_eq!(from_unix_millis(to_unix_millis(far)).year(), far.year());

        let early = time::PrimitiveDateTime::MIN.assume_utc();
        assert_eq!(from_unix_millis(to_unix_millis(early)).year(), early.year());
    }
}
