//! Session engine configuration.
//!
//! # Example (TOML)
//!
//! ```toml
//! tenant_isolation = true
//!
//! [cache]
//! ttl_ms = 300000
//! sweep_interval = "1m"
//!
//! [rotation]
//! session_lifetime = "24h"
//! threshold = "1h"
//! debounce_window = "5m"
//!
//! [redis]
//! enabled = true
//! url = "redis://localhost:6379"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the session engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reject cached or validated sessions whose tenant differs from the
    /// tenant of the request.
    pub tenant_isolation: bool,

    /// Cache tier settings.
    pub cache: CacheSettings,

    /// Token rotation settings.
    pub rotation: RotationConfig,

    /// Rotation rate limiting.
    pub rate_limiting: RateLimitingConfig,

    /// Redis (L2) connection settings.
    pub redis: RedisConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tenant_isolation: true,
            cache: CacheSettings::default(),
            rotation: RotationConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

/// Cache settings shared by L1 and L2.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Time-to-live of a cache entry in milliseconds.
    pub ttl_ms: u64,

    /// How often the engine sweeps stale bookkeeping.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000, // 5 minutes
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Token rotation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Enable rotation of sessions nearing expiry.
    pub enabled: bool,

    /// Lifetime granted to a freshly rotated session.
    #[serde(with = "humantime_serde")]
    pub session_lifetime: Duration,

    /// Sessions with less time left than this are eligible for rotation.
    #[serde(with = "humantime_serde")]
    pub threshold: Duration,

    /// Minimum time between two rotation attempts for the same session.
    #[serde(with = "humantime_serde")]
    pub debounce_window: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            session_lifetime: Duration::from_secs(24 * 3600), // 24 hours
            threshold: Duration::from_secs(3600),             // 1 hour
            debounce_window: Duration::from_secs(300),        // 5 minutes
        }
    }
}

/// Rotation rate limiting, applied per client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    pub enabled: bool,

    /// Rotations allowed per client within one window.
    pub max_rotations: u32,

    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_rotations: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Redis configuration for the shared L2 tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    /// Default: false (in-process only)
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Per-command and connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// The configuration could not be loaded or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl SessionConfig {
    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` describing the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.ttl_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "cache.ttl_ms must be > 0".to_string(),
            ));
        }
        if self.cache.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "cache.sweep_interval must be > 0".to_string(),
            ));
        }

        if self.rotation.enabled {
            let rotation = &self.rotation;
            if rotation.threshold.is_zero() {
                return Err(ConfigError::InvalidValue(
                    "rotation.threshold must be > 0".to_string(),
                ));
            }
            // Otherwise every request would rotate.
            if rotation.threshold >= rotation.session_lifetime {
                return Err(ConfigError::InvalidValue(
                    "rotation.threshold must be < rotation.session_lifetime".to_string(),
                ));
            }
            if rotation.debounce_window >= rotation.threshold {
                return Err(ConfigError::InvalidValue(
                    "rotation.debounce_window must be < rotation.threshold".to_string(),
                ));
            }
        }

        if self.rate_limiting.enabled {
            if self.rate_limiting.max_rotations == 0 {
                return Err(ConfigError::InvalidValue(
                    "rate_limiting.max_rotations must be > 0".to_string(),
                ));
            }
            if self.rate_limiting.window.is_zero() {
                return Err(ConfigError::InvalidValue(
                    "rate_limiting.window must be > 0".to_string(),
                ));
            }
        }

        if self.redis.enabled {
            if self.redis.url.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "redis.url must not be empty".to_string(),
                ));
            }
            if self.redis.pool_size == 0 {
                return Err(ConfigError::InvalidValue(
                    "redis.pool_size must be > 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

pub mod loader {
    use super::{ConfigError, SessionConfig};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default file looked up when no path is given.
    pub const DEFAULT_CONFIG_FILE: &str = "octofhir-session.toml";

    /// Loads configuration from an optional TOML file plus environment
    /// overrides, e.g. `OCTOFHIR_SESSION__CACHE__TTL_MS=60000`.
    pub fn load_config(path: Option<&str>) -> Result<SessionConfig, ConfigError> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        } else if path.is_some() {
            tracing::warn!(path = %pathbuf.display(), "Config file not found, using defaults");
        }
        builder = builder.add_source(
            Environment::with_prefix("OCTOFHIR_SESSION")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| ConfigError::Load(format!("config build error: {e}")))?;
        let merged: SessionConfig = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::Load(format!("config deserialize error: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }
}
