//! Session engine error types.
//!
//! Two layers of errors exist:
//!
//! - [`BackendError`] is returned by every [`CacheAdapter`](crate::backend::CacheAdapter)
//!   call. Callers inside this crate pattern-match on it to pick the next tier;
//!   it never reaches the HTTP layer.
//! - [`SessionError`] is what the engine surfaces to its callers. Only the
//!   conditions that cannot be resolved to "unauthenticated" or "keep the
//!   current session" are represented here.

use std::time::Duration;

/// Errors raised by a backend cache adapter.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Could not obtain a connection to the backend.
    #[error("Backend connection error: {0}")]
    Connection(String),

    /// The backend rejected or failed a command.
    #[error("Backend command error: {0}")]
    Command(String),

    /// The backend did not answer within the configured timeout.
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),

    /// A value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The adapter has been closed.
    #[error("Backend closed")]
    Closed,
}

impl From<redis::RedisError> for BackendError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
            Self::Connection(e.to_string())
        } else if e.is_timeout() {
            Self::Command(format!("timeout: {e}"))
        } else {
            Self::Command(e.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for BackendError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Self::Connection(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BackendError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BackendError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors surfaced by the session engine.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session's token data is missing, expired or belongs to another user.
    ///
    /// The caller must clear its session cookie and drop the user context.
    #[error("Invalid session: {message}")]
    InvalidSession {
        /// Why the session was rejected.
        message: String,
    },

    /// The durable session store is not attached or unreachable.
    #[error("Session store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the failure.
        message: String,
    },

    /// A backend cache call failed and no fallback applied.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The engine configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl SessionError {
    /// Creates a new `InvalidSession` error.
    #[must_use]
    pub fn invalid_session(message: impl Into<String>) -> Self {
        Self::InvalidSession {
            message: message.into(),
        }
    }

    /// Creates a new `StoreUnavailable` error.
    #[must_use]
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if the caller should clear its session identifier.
    #[must_use]
    pub fn is_invalid_session(&self) -> bool {
        matches!(self, Self::InvalidSession { .. })
    }
}

impl From<crate::config::ConfigError> for SessionError {
    fn from(e: crate::config::ConfigError) -> Self {
        Self::configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_session_predicate() {
        assert!(SessionError::invalid_session("gone").is_invalid_session());
        assert!(!SessionError::store_unavailable("detached").is_invalid_session());
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::invalid_session("token data missing");
        assert_eq!(err.to_string(), "Invalid session: token data missing");

        let err: SessionError = BackendError::Closed.into();
        assert_eq!(err.to_string(), "Backend closed");

        let err = BackendError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Backend timed out after 250ms");
    }
}
