//! Rotation rate limiting.
//!
//! The engine consults a [`RotationRateLimiter`] before every rotation. A
//! limited attempt is a deliberate no-op: the session keeps its current id.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::RateLimitingConfig;
use crate::types::RequestContext;

/// Decides whether a rotation attempt should be suppressed.
#[async_trait]
pub trait RotationRateLimiter: Send + Sync {
    /// Returns `true` if the attempt described by `ctx` must not proceed.
    ///
    /// Implementations count the attempt as a side effect.
    async fn is_limited(&self, ctx: &RequestContext) -> bool;

    /// Drops expired bookkeeping. Returns the number of entries removed.
    fn cleanup_expired(&self) -> usize {
        0
    }
}

/// Limiter that never limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRateLimit;

#[async_trait]
impl RotationRateLimiter for NoRateLimit {
    async fn is_limited(&self, _ctx: &RequestContext) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window limiter keyed by [`RequestContext::client_key`].
#[derive(Debug)]
pub struct WindowRateLimiter {
    max_attempts: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl WindowRateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self::new(config.max_rotations, config.window)
    }

    /// Number of clients with an open window.
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl RotationRateLimiter for WindowRateLimiter {
    async fn is_limited(&self, ctx: &RequestContext) -> bool {
        let now = Instant::now();
        let key = ctx.client_key();

        let mut window = self.windows.entry(key).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= self.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        if window.count >= self.max_attempts {
            return true;
        }
        window.count += 1;
        false
    }

    fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.duration_since(w.started) < self.window);
        before.saturating_sub(self.windows.len())
    }
}
