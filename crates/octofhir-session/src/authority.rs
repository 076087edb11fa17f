//! Durable session authority.
//!
//! [`SessionAuthority`] is the interface the engine consumes from whatever
//! service owns session records (an identity service, a database, or the
//! hybrid [`StoreAuthority`] defined here).
//!
//! # Implementation Notes
//!
//! Implementations should:
//!
//! - Return `Ok(None)` for unknown or expired sessions, and reserve `Err` for
//!   the store itself being unreachable
//! - Make `rotate_token` atomic: after it returns a new id, the old id must
//!   no longer resolve
//! - Never log full session ids

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::RngCore;
use time::OffsetDateTime;

use crate::SessionResult;
use crate::store::SessionStore;
use crate::types::{SessionTokenData, UserSnapshot, ValidatedSession, redact_session_id};

/// Length in bytes of generated session ids (hex-encoded to twice that).
const SESSION_ID_BYTES: usize = 32;

/// Storage-side operations the session engine depends on.
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    /// Resolves a session id to its user, or `None` if unknown or expired.
    async fn validate_session(&self, session_id: &str) -> SessionResult<Option<UserSnapshot>>;

    /// Returns expiry and owner of a session's token.
    async fn get_session_token_data(
        &self,
        session_id: &str,
    ) -> SessionResult<Option<SessionTokenData>>;

    /// Atomically replaces `session_id` with a new id expiring at
    /// `new_expires_at`. Returns `None` if the swap was rejected.
    async fn rotate_token(
        &self,
        session_id: &str,
        new_expires_at: OffsetDateTime,
    ) -> SessionResult<Option<String>>;

    /// Like [`validate_session`](Self::validate_session) but also reports the
    /// record's expiry, which bounds how long caches may serve it.
    ///
    /// The default implementation reports no expiry.
    async fn lookup_session(&self, session_id: &str) -> SessionResult<Option<ValidatedSession>> {
        Ok(self
            .validate_session(session_id)
            .await?
            .map(|user| ValidatedSession {
                user,
                expires_at: None,
            }))
    }
}

/// Generates an opaque, unguessable session id.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// [`SessionAuthority`] backed by the [`SessionStore`] facade.
///
/// Used when session records live in the distributed/in-process hybrid store
/// rather than in a separate identity service.
pub struct StoreAuthority {
    store: Arc<SessionStore>,
    /// Ids with a rotation in progress.
    rotating: DashMap<String, ()>,
}

impl StoreAuthority {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            rotating: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Creates a session for an already authenticated user.
    pub async fn issue(&self, user: UserSnapshot, expires_at: OffsetDateTime) -> String {
        let session_id = generate_session_id();
        self.store
            .set(&session_id, Arc::new(user), expires_at)
            .await;
        tracing::debug!(session = %redact_session_id(&session_id), "Session issued");
        session_id
    }

    /// Destroys a session (logout). Returns `true` if it existed.
    pub async fn revoke(&self, session_id: &str) -> bool {
        self.store.delete(session_id).await
    }
}

/// Releases the per-id rotation guard on drop.
struct RotationGuard<'a> {
    rotating: &'a DashMap<String, ()>,
    session_id: &'a str,
}

impl Drop for RotationGuard<'_> {
    fn drop(&mut self) {
        self.rotating.remove(self.session_id);
    }
}

#[async_trait]
impl SessionAuthority for StoreAuthority {
    async fn validate_session(&self, session_id: &str) -> SessionResult<Option<UserSnapshot>> {
        Ok(self.store.get(session_id).await.map(|u| (*u).clone()))
    }

    async fn get_session_token_data(
        &self,
        session_id: &str,
    ) -> SessionResult<Option<SessionTokenData>> {
        Ok(self
            .store
            .get_record(session_id)
            .await
            .map(|record| SessionTokenData {
                expires_at: record.expires_at,
                user_id: record.user.id.clone(),
            }))
    }

    async fn rotate_token(
        &self,
        session_id: &str,
        new_expires_at: OffsetDateTime,
    ) -> SessionResult<Option<String>> {
        // One rotation per id at a time
        if self.rotating.insert(session_id.to_string(), ()).is_some() {
            tracing::debug!(
                session = %redact_session_id(session_id),
                "Rotation already in progress"
            );
            return Ok(None);
        }
        let _guard = RotationGuard {
            rotating: &self.rotating,
            session_id,
        };

        let Some(record) = self.store.get_record(session_id).await else {
            return Ok(None);
        };

        let new_id = generate_session_id();
        self.store.set(&new_id, record.user, new_expires_at).await;

        // The old id must be gone before the new one is handed out
        if let Err(e) = self.store.try_delete(session_id).await {
            tracing::warn!(
                session = %redact_session_id(session_id),
                error = %e,
                "Could not retire old session id, abandoning rotation"
            );
            self.store.delete(&new_id).await;
            return Ok(None);
        }

        Ok(Some(new_id))
    }

    async fn lookup_session(&self, session_id: &str) -> SessionResult<Option<ValidatedSession>> {
        Ok(self
            .store
            .get_record(session_id)
            .await
            .map(|record| ValidatedSession {
                user: (*record.user).clone(),
                expires_at: Some(record.expires_at),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CacheAdapter, MemoryAdapter};
    use crate::error::BackendError;
    use std::time::Duration;

    fn authority() -> StoreAuthority {
        StoreAuthority::new(Arc::new(SessionStore::in_memory()))
    }

    /// Memory adapter whose deletes always fail.
    struct DeleteFails(MemoryAdapter);

    #[async_trait]
    impl CacheAdapter for DeleteFails {
        fn name(&self) -> &'static str {
            "delete-fails"
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError> {
            self.0.set(key, value, ttl).await
        }

        async fn delete(&self, _key: &str) -> Result<bool, BackendError> {
            Err(BackendError::Command("DEL refused".into()))
        }

        async fn delete_pattern(&self, pattern: &str) -> Result<u64, BackendError> {
            self.0.delete_pattern(pattern).await
        }
    }

    fn in_hours(h: i64) -> OffsetDateTime {
        OffsetDateTime::now_utc() + time::Duration::hours(h)
    }

    #[test]
    fn test_generated_ids_are_unique_hex() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_eq!(a.len(), SESSION_ID_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_issue_and_validate() {
        let authority = authority();
        let id = authority
            .issue(UserSnapshot::new("u1", "alice"), in_hours(1))
            .await;

        let user = authority.validate_session(&id).await.unwrap().unwrap();
        assert_eq!(user.username, "alice");

        let data = authority.get_session_token_data(&id).await.unwrap().unwrap();
        assert_eq!(data.user_id, "u1");

        let validated = authority.lookup_session(&id).await.unwrap().unwrap();
        assert!(validated.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_rotate_replaces_id() {
        let authority = authority();
        let old = authority
            .issue(UserSnapshot::new("u1", "alice"), in_hours(1))
            .await;

        let new = authority
            .rotate_token(&old, in_hours(24))
            .await
            .unwrap()
            .unwrap();

        assert_ne!(old, new);
        assert!(authority.validate_session(&old).await.unwrap().is_none());
        let data = authority.get_session_token_data(&new).await.unwrap().unwrap();
        assert_eq!(data.user_id, "u1");
        assert!(data.expires_at > in_hours(23));
    }

    #[tokio::test]
    async fn test_rotate_fails_when_old_id_cannot_be_deleted() {
        let adapter: Arc<dyn CacheAdapter> = Arc::new(DeleteFails(MemoryAdapter::new()));
        let authority = StoreAuthority::new(Arc::new(SessionStore::with_backend(Some(adapter))));
        let old = authority
            .issue(UserSnapshot::new("u1", "alice"), in_hours(1))
            .await;

        let rotated = authority.rotate_token(&old, in_hours(24)).await.unwrap();

        assert!(rotated.is_none());
        // The swap did not happen, so the old id is still the live one
        assert!(authority.validate_session(&old).await.unwrap().is_some());
        assert!(authority.rotating.is_empty());
    }

    #[tokio::test]
    async fn test_rotate_unknown_session_is_rejected() {
        let authority = authority();
        assert!(
            authority
                .rotate_token("missing", in_hours(1))
                .await
                .unwrap()
                .is_none()
        );
        // Guard released
        assert!(authority.rotating.is_empty());
    }

    #[tokio::test]
    async fn test_revoke() {
        let authority = authority();
        let id = authority
            .issue(UserSnapshot::new("u1", "alice"), in_hours(1))
            .await;
        assert!(authority.revoke(&id).await);
        assert!(authority.validate_session(&id).await.unwrap().is_none());
    }
}
