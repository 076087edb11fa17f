//! Tenant isolation guard.

use std::sync::Arc;

use crate::metrics;
use crate::types::{UserSnapshot, redact_session_id};

/// Rejects sessions whose tenant differs from the requesting tenant.
#[derive(Debug, Clone, Copy)]
pub struct TenantGuard {
    enabled: bool,
}

impl TenantGuard {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns `true` when `user` may be served to a request for
    /// `requested_tenant`. Does not log.
    pub fn permits(&self, user: &UserSnapshot, requested_tenant: Option<&str>) -> bool {
        match requested_tenant {
            _ if !self.enabled => true,
            None => true,
            Some(tenant) => user.tenant_id.as_deref() == Some(tenant),
        }
    }

    /// Passes `user` through if permitted; otherwise records a potential
    /// cross-tenant access attempt and returns `None`.
    pub fn admit(
        &self,
        session_id: &str,
        user: Arc<UserSnapshot>,
        requested_tenant: Option<&str>,
    ) -> Option<Arc<UserSnapshot>> {
        if self.permits(&user, requested_tenant) {
            return Some(user);
        }

        metrics::record_tenant_mismatch();
        tracing::warn!(
            security_event = true,
            session = %redact_session_id(session_id),
            user_id = %user.id,
            session_tenant = ?user.tenant_id,
            requested_tenant = ?requested_tenant,
            "Session tenant mismatch, possible cross-tenant access attempt"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme_user() -> Arc<UserSnapshot> {
        Arc::new(UserSnapshot::new("u1", "alice").with_tenant("acme"))
    }

    #[test]
    fn test_matching_tenant_passes() {
        let guard = TenantGuard::new(true);
        assert!(guard.admit("s1", acme_user(), Some("acme")).is_some());
    }

    #[test]
    fn test_mismatched_tenant_is_rejected() {
        let guard = TenantGuard::new(true);
        assert!(guard.admit("s1", acme_user(), Some("globex")).is_none());
    }

    #[test]
    fn test_no_requested_tenant_passes() {
        let guard = TenantGuard::new(true);
        assert!(guard.admit("s1", acme_user(), None).is_some());
    }

    #[test]
    fn test_tenantless_user_rejected_for_tenant_request() {
        let guard = TenantGuard::new(true);
        let user = Arc::new(UserSnapshot::new("u2", "bob"));
        assert!(!guard.permits(&user, Some("acme")));
    }

    #[test]
    fn test_disabled_guard_passes_everything() {
        let guard = TenantGuard::new(false);
        assert!(guard.admit("s1", acme_user(), Some("globex")).is_some());
    }
}
