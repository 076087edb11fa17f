//! Integration tests for the session engine.
//!
//! Sessions live in a [`SessionStore`] fronted by a [`StoreAuthority`]; the
//! tests drive the engine only through its public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use octofhir_session::{
    BackendError, CacheAdapter, MemoryAdapter, RequestContext, RotationOutcome, SessionAuthority,
    SessionConfig, SessionEngine, SessionResult, SessionStore, SessionTokenData, StoreAuthority,
    UserSnapshot, ValidatedSession,
};
use time::OffsetDateTime;

/// Wraps a [`StoreAuthority`] with a delay and call counters.
struct CountingAuthority {
    inner: StoreAuthority,
    delay: Duration,
    lookups: AtomicUsize,
    rotations: AtomicUsize,
}

impl CountingAuthority {
    fn new(delay: Duration) -> Self {
        Self {
            inner: StoreAuthority::new(Arc::new(SessionStore::in_memory())),
            delay,
            lookups: AtomicUsize::new(0),
            rotations: AtomicUsize::new(0),
        }
    }

    fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn rotations(&self) -> usize {
        self.rotations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionAuthority for CountingAuthority {
    async fn validate_session(&self, session_id: &str) -> SessionResult<Option<UserSnapshot>> {
        self.inner.validate_session(session_id).await
    }

    async fn get_session_token_data(
        &self,
        session_id: &str,
    ) -> SessionResult<Option<SessionTokenData>> {
        self.inner.get_session_token_data(session_id).await
    }

    async fn rotate_token(
        &self,
        session_id: &str,
        new_expires_at: OffsetDateTime,
    ) -> SessionResult<Option<String>> {
        self.rotations.fetch_add(1, Ordering::SeqCst);
        self.inner.rotate_token(session_id, new_expires_at).await
    }

    async fn lookup_session(&self, session_id: &str) -> SessionResult<Option<ValidatedSession>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.lookup_session(session_id).await
    }
}

/// Cache backend that fails every call.
struct FailingAdapter;

#[async_trait]
impl CacheAdapter for FailingAdapter {
    fn name(&self) -> &'static str {
        "failing"
    }
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Err(BackendError::Connection("connection refused".into()))
    }
    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), BackendError> {
        Err(BackendError::Timeout(Duration::from_millis(10)))
    }
    async fn delete(&self, _key: &str) -> Result<bool, BackendError> {
        Err(BackendError::Connection("connection refused".into()))
    }
    async fn delete_pattern(&self, _pattern: &str) -> Result<u64, BackendError> {
        Err(BackendError::Connection("connection refused".into()))
    }
}

fn alice() -> UserSnapshot {
    UserSnapshot::new("u1", "alice")
        .with_tenant("tenant-a")
        .with_roles(["practitioner"])
}

fn after(d: time::Duration) -> OffsetDateTime {
    OffsetDateTime::now_utc() + d
}

fn engine_with(authority: Arc<CountingAuthority>) -> SessionEngine {
    SessionEngine::builder(SessionConfig::default())
        .cache_adapter(Arc::new(MemoryAdapter::new()))
        .authority(authority)
        .build()
        .unwrap()
}

#[tokio::test]
async fn resolves_until_durable_expiry() {
    let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
    let engine = engine_with(authority.clone());
    let id = authority
        .inner
        .issue(alice(), after(time::Duration::milliseconds(80)))
        .await;

    let user = engine.resolve_user(&id, None).await.unwrap();
    assert_eq!(*user, alice());
    assert!(engine.resolve_user(&id, None).await.is_some());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(engine.resolve_user(&id, None).await.is_none());
}

#[tokio::test]
async fn cached_session_is_not_served_to_another_tenant() {
    let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
    let engine = engine_with(authority.clone());
    let id = authority
        .inner
        .issue(alice(), after(time::Duration::hours(8)))
        .await;

    assert!(engine.resolve_user(&id, Some("tenant-a")).await.is_some());
    assert!(engine.resolve_user(&id, Some("tenant-b")).await.is_none());
    // Still valid for its own tenant
    assert!(engine.resolve_user(&id, Some("tenant-a")).await.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resolves_share_one_durable_lookup() {
    let authority = Arc::new(CountingAuthority::new(Duration::from_millis(100)));
    let engine = engine_with(authority.clone());
    let id = authority
        .inner
        .issue(alice(), after(time::Duration::hours(8)))
        .await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            engine.resolve_user(&id, Some("tenant-a")).await
        }));
    }

    for handle in handles {
        let user = handle.await.unwrap().unwrap();
        assert_eq!(user.id, "u1");
    }
    assert_eq!(authority.lookups(), 1);

    let stats = engine.stats().validator;
    assert_eq!(stats.durable_lookups, 1);
    assert_eq!(stats.coalesced_lookups, 9);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn sessions_far_from_expiry_keep_their_id() {
    let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
    let engine = engine_with(authority.clone());
    let id = authority
        .inner
        .issue(alice(), after(time::Duration::hours(8)))
        .await;
    let ctx = RequestContext::new();

    for _ in 0..5 {
        let user = engine.resolve_user(&id, None).await.unwrap();
        assert_eq!(engine.maybe_rotate(&id, &user, &ctx).await.unwrap(), id);
    }
    assert_eq!(authority.rotations(), 0);
}

#[tokio::test]
async fn rotation_is_debounced() {
    let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
    let engine = engine_with(authority.clone());
    let old = authority
        .inner
        .issue(alice(), after(time::Duration::minutes(20)))
        .await;
    let ctx = RequestContext::new().with_client_ip("192.0.2.10".parse().unwrap());
    let user = engine.resolve_user(&old, None).await.unwrap();

    let first = engine.rotate(&old, &user, &ctx).await.unwrap();
    let RotationOutcome::Rotated { session_id: new_id, previous } = first else {
        panic!("expected rotation, got {first:?}");
    };
    assert_eq!(previous, old);

    // A request still carrying the old id gets the new one
    assert_eq!(engine.maybe_rotate(&old, &user, &ctx).await.unwrap(), new_id);
    assert_eq!(authority.rotations(), 1);

    // Old id no longer resolves anywhere; the new one does
    assert!(engine.resolve_user(&old, None).await.is_none());
    let rotated = engine.resolve_user(&new_id, Some("tenant-a")).await.unwrap();
    assert_eq!(rotated.id, "u1");
}

#[tokio::test]
async fn rotated_id_is_not_handed_to_another_user() {
    let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
    let engine = engine_with(authority.clone());
    let old = authority
        .inner
        .issue(alice(), after(time::Duration::minutes(20)))
        .await;
    let ctx = RequestContext::new();
    let user = engine.resolve_user(&old, None).await.unwrap();

    let new_id = engine.maybe_rotate(&old, &user, &ctx).await.unwrap();
    assert_ne!(new_id, old);

    let impostor = UserSnapshot::new("u2", "mallory").with_tenant("tenant-a");
    let err = engine.maybe_rotate(&old, &impostor, &ctx).await.unwrap_err();
    assert!(err.is_invalid_session());
    assert_eq!(authority.rotations(), 1);

    // The owner's new session keeps working
    let rotated = engine.resolve_user(&new_id, Some("tenant-a")).await.unwrap();
    assert_eq!(rotated.id, "u1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rotations_swap_the_id_once() {
    let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
    let engine = engine_with(authority.clone());
    let old = authority
        .inner
        .issue(alice(), after(time::Duration::minutes(20)))
        .await;
    let user = engine.resolve_user(&old, None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let old = old.clone();
        let user = Arc::clone(&user);
        handles.push(tokio::spawn(async move {
            engine.rotate(&old, &user, &RequestContext::new()).await
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(authority.rotations(), 1);

    let rotated: Vec<_> = outcomes.iter().filter(|o| o.is_rotated()).collect();
    assert_eq!(rotated.len(), 1);
    let new_id = rotated[0].session_id().to_string();

    for outcome in &outcomes {
        match outcome {
            RotationOutcome::Rotated { session_id, .. } => assert_eq!(*session_id, new_id),
            RotationOutcome::Debounced { session_id } => {
                assert!(*session_id == new_id || *session_id == old);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert!(engine.resolve_user(&old, None).await.is_none());
    assert!(engine.resolve_user(&new_id, None).await.is_some());
}

#[tokio::test]
async fn mismatched_token_owner_invalidates_session() {
    let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
    let engine = engine_with(authority.clone());
    let id = authority
        .inner
        .issue(alice(), after(time::Duration::minutes(20)))
        .await;
    assert!(engine.resolve_user(&id, None).await.is_some());

    let impostor = UserSnapshot::new("u2", "mallory").with_tenant("tenant-a");
    let err = engine
        .maybe_rotate(&id, &impostor, &RequestContext::new())
        .await
        .unwrap_err();

    assert!(err.is_invalid_session());
    assert_eq!(authority.rotations(), 0);
    assert_eq!(engine.stats().validator.l1_entries, 0);
}

#[tokio::test]
async fn store_survives_failing_backend() {
    let store = SessionStore::with_backend(Some(Arc::new(FailingAdapter)));
    let user = Arc::new(alice());

    store
        .set("s1", user.clone(), after(time::Duration::hours(1)))
        .await;
    assert_eq!(store.get("s1").await, Some(user));
    assert!(store.delete("s1").await);
    assert!(store.get("s1").await.is_none());
    assert!(store.stats().fallbacks > 0);
}

#[tokio::test]
async fn engine_survives_failing_cache_backend() {
    let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
    let engine = SessionEngine::builder(SessionConfig::default())
        .cache_adapter(Arc::new(FailingAdapter))
        .authority(authority.clone())
        .build()
        .unwrap();
    let id = authority
        .inner
        .issue(alice(), after(time::Duration::hours(8)))
        .await;

    assert!(engine.resolve_user(&id, None).await.is_some());
    assert!(engine.resolve_user(&id, None).await.is_some());
    assert_eq!(authority.lookups(), 1);
}

#[tokio::test]
async fn pattern_delete_removes_only_matching_keys() {
    let store = SessionStore::with_backend(Some(Arc::new(MemoryAdapter::new())));
    let exp = after(time::Duration::hours(1));

    store.set("user:1", Arc::new(alice()), exp).await;
    store.set("user:2", Arc::new(alice()), exp).await;
    store.set("admin:1", Arc::new(alice()), exp).await;

    assert_eq!(store.delete_pattern("user:*").await.unwrap(), 2);
    assert!(store.get("user:1").await.is_none());
    assert!(store.get("user:2").await.is_none());
    assert!(store.get("admin:1").await.is_some());
}
