//! Session token rotation.
//!
//! A session close to expiry is swapped for a new id with a fresh lifetime.
//! The decision for one call:
//!
//! 1. Rotated within the debounce window: return the id it was rotated to.
//! 2. Token data missing, owned by another user, or expired: the session is
//!    invalid and is evicted ([`SessionError::InvalidSession`]).
//! 3. More than `threshold` left: nothing to do.
//! 4. Otherwise claim the attempt (debounce), consult the rate limiter, and
//!    ask the durable authority for an atomic swap.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::activity::{ActivityTracker, CompletedRotation, RotationGate, RotationStatus};
use crate::authority::SessionAuthority;
use crate::config::RotationConfig;
use crate::error::SessionError;
use crate::metrics;
use crate::rate_limit::RotationRateLimiter;
use crate::types::{RequestContext, SessionTokenData, UserSnapshot, redact_session_id};
use crate::validator::SessionValidator;
use crate::SessionResult;

/// Where a session stands relative to its expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    /// More than the rotation threshold left.
    Active,
    /// Within the threshold and not yet expired.
    RotationEligible,
    /// Rotation was suppressed by the rate limiter.
    RateLimited,
    /// Swapped for a new id.
    Rotated,
    /// Missing, tampered with, or expired.
    Invalidated,
}

impl RotationState {
    /// Classifies a session by its remaining lifetime.
    pub fn classify(expires_at: OffsetDateTime, now: OffsetDateTime, threshold: Duration) -> Self {
        let time_left = expires_at - now;
        if !time_left.is_positive() {
            Self::Invalidated
        } else if time_left > threshold {
            Self::Active
        } else {
            Self::RotationEligible
        }
    }
}

/// Result of a rotation check. Every variant carries the id the caller
/// should use from now on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// No rotation needed.
    Unchanged { session_id: String },
    /// A recent attempt exists; carries the id it produced, if any.
    Debounced { session_id: String },
    /// The rate limiter suppressed the attempt.
    RateLimited { session_id: String },
    /// Rotated from `previous` to `session_id`.
    Rotated { session_id: String, previous: String },
    /// The durable authority rejected or failed the swap.
    Failed { session_id: String },
}

impl RotationOutcome {
    /// The effective session id.
    pub fn session_id(&self) -> &str {
        match self {
            Self::Unchanged { session_id }
            | Self::Debounced { session_id }
            | Self::RateLimited { session_id }
            | Self::Rotated { session_id, .. }
            | Self::Failed { session_id } => session_id,
        }
    }

    pub fn into_session_id(self) -> String {
        match self {
            Self::Unchanged { session_id }
            | Self::Debounced { session_id }
            | Self::RateLimited { session_id }
            | Self::Rotated { session_id, .. }
            | Self::Failed { session_id } => session_id,
        }
    }

    pub fn is_rotated(&self) -> bool {
        matches!(self, Self::Rotated { .. })
    }

    /// State the session was left in.
    pub fn state(&self) -> RotationState {
        match self {
            Self::Unchanged { .. } => RotationState::Active,
            Self::Debounced { .. } | Self::Failed { .. } => RotationState::RotationEligible,
            Self::RateLimited { .. } => RotationState::RateLimited,
            Self::Rotated { .. } => RotationState::Rotated,
        }
    }
}

/// Applies the rotation policy for resolved sessions.
pub struct TokenRotator {
    config: RotationConfig,
    validator: SessionValidator,
    activity: Arc<ActivityTracker>,
    rate_limiter: Arc<dyn RotationRateLimiter>,
}

impl TokenRotator {
    pub fn new(
        config: RotationConfig,
        validator: SessionValidator,
        activity: Arc<ActivityTracker>,
        rate_limiter: Arc<dyn RotationRateLimiter>,
    ) -> Self {
        Self {
            config,
            validator,
            activity,
            rate_limiter,
        }
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &Arc<dyn RotationRateLimiter> {
        &self.rate_limiter
    }

    /// Checks `session_id`, already resolved to `user`, and rotates it if due.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidSession`] when the durable token data is
    /// missing, belongs to another user, or has expired. The id is evicted
    /// from every cache tier and the caller should clear its session cookie.
    pub async fn rotate(
        &self,
        session_id: &str,
        user: &UserSnapshot,
        ctx: &RequestContext,
        authority: &dyn SessionAuthority,
    ) -> SessionResult<RotationOutcome> {
        let unchanged = || RotationOutcome::Unchanged {
            session_id: session_id.to_string(),
        };
        if !self.config.enabled {
            return Ok(unchanged());
        }

        // A second request still carrying the old id
        if let Some(done) = self
            .activity
            .recent_rotation(session_id, self.config.debounce_window)
        {
            return self.replay_rotation(session_id, user, done).await;
        }

        let token = match authority.get_session_token_data(session_id).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(
                    session = %redact_session_id(session_id),
                    error = %e,
                    "Could not load session token data, skipping rotation"
                );
                return Ok(unchanged());
            }
        };
        // The old id may have been swapped out after the check above
        if token.is_none() {
            match self
                .activity
                .rotation_status(session_id, self.config.debounce_window)
            {
                Some(RotationStatus::Completed(done)) => {
                    return self.replay_rotation(session_id, user, done).await;
                }
                Some(RotationStatus::InProgress) => {
                    metrics::record_rotation("debounced");
                    return Ok(RotationOutcome::Debounced {
                        session_id: session_id.to_string(),
                    });
                }
                None => {}
            }
        }
        let token = self.verify_token(session_id, user, token).await?;

        let now = OffsetDateTime::now_utc();
        match RotationState::classify(token.expires_at, now, self.config.threshold) {
            RotationState::Active => return Ok(unchanged()),
            RotationState::Invalidated => {
                return Err(self.invalidate(session_id, "session expired").await);
            }
            _ => {}
        }

        if let RotationGate::Debounced { rotated_to } = self
            .activity
            .begin_rotation(session_id, self.config.debounce_window)
        {
            metrics::record_rotation("debounced");
            return Ok(RotationOutcome::Debounced {
                session_id: rotated_to.unwrap_or_else(|| session_id.to_string()),
            });
        }

        if self.rate_limiter.is_limited(ctx).await {
            self.activity.abandon_rotation(session_id);
            metrics::record_rotation("rate_limited");
            tracing::warn!(
                session = %redact_session_id(session_id),
                client = %ctx.client_key(),
                "Session rotation rate limited"
            );
            return Ok(RotationOutcome::RateLimited {
                session_id: session_id.to_string(),
            });
        }

        let new_expires_at = now + self.config.session_lifetime;
        match authority.rotate_token(session_id, new_expires_at).await {
            Ok(Some(new_id)) => {
                self.validator
                    .store_entry(&new_id, Arc::new(user.clone()), Some(new_expires_at))
                    .await;
                self.validator.evict(session_id).await;
                self.activity.complete_rotation(session_id, &new_id, &user.id);

                metrics::record_rotation("rotated");
                tracing::info!(
                    from = %redact_session_id(session_id),
                    to = %redact_session_id(&new_id),
                    user_id = %user.id,
                    "Session rotated"
                );
                Ok(RotationOutcome::Rotated {
                    session_id: new_id,
                    previous: session_id.to_string(),
                })
            }
            Ok(None) => {
                self.activity.abandon_rotation(session_id);
                metrics::record_rotation("failed");
                tracing::error!(
                    session = %redact_session_id(session_id),
                    "Durable store rejected session rotation"
                );
                Ok(RotationOutcome::Failed {
                    session_id: session_id.to_string(),
                })
            }
            Err(e) => {
                self.activity.abandon_rotation(session_id);
                metrics::record_rotation("failed");
                tracing::error!(
                    session = %redact_session_id(session_id),
                    error = %e,
                    "Session rotation failed"
                );
                Ok(RotationOutcome::Failed {
                    session_id: session_id.to_string(),
                })
            }
        }
    }

    /// Answers a request for an id whose rotation already completed.
    async fn replay_rotation(
        &self,
        session_id: &str,
        user: &UserSnapshot,
        done: CompletedRotation,
    ) -> SessionResult<RotationOutcome> {
        if done.user_id != user.id {
            tracing::warn!(
                security_event = true,
                session = %redact_session_id(session_id),
                resolved_user = %user.id,
                token_user = %done.user_id,
                "Rotated session presented for another user"
            );
            return Err(self.invalidate(session_id, "session owner mismatch").await);
        }
        metrics::record_rotation("debounced");
        Ok(RotationOutcome::Debounced {
            session_id: done.rotated_to,
        })
    }

    async fn verify_token(
        &self,
        session_id: &str,
        user: &UserSnapshot,
        token: Option<SessionTokenData>,
    ) -> SessionResult<SessionTokenData> {
        let Some(token) = token else {
            return Err(self.invalidate(session_id, "session token data not found").await);
        };
        if token.user_id != user.id {
            tracing::warn!(
                security_event = true,
                session = %redact_session_id(session_id),
                resolved_user = %user.id,
                token_user = %token.user_id,
                "Session token owner does not match resolved user"
            );
            return Err(self.invalidate(session_id, "session owner mismatch").await);
        }
        Ok(token)
    }

    async fn invalidate(&self, session_id: &str, reason: &str) -> SessionError {
        self.validator.evict(session_id).await;
        self.activity.remove(session_id);
        metrics::record_rotation("invalidated");
        tracing::warn!(
            session = %redact_session_id(session_id),
            reason,
            "Session invalidated"
        );
        SessionError::invalid_session(reason)
    }
}
