//! Sliding-window rate limiting.
//!
//! One limiter type serves every scope: each instance owns a keyspace and a
//! `(limit, window)` pair. Window state lives in the shared [`Store`] so all
//! API and worker processes see the same counts.
//!
//! A limiter that cannot reach its store lets the request through. Losing
//! rate limiting for a while is acceptable; blocking every request is not.
//!
//! [`Store`]: crate::store::Store

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use spendbot_models::SharedClock;

use crate::store::{SharedStore, WindowSpec, WindowState};

/// Limit and window for one limiter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(window_secs),
        }
    }

    /// Read `{prefix}` (limit) and `{prefix}_WINDOW` (seconds) from the
    /// environment, falling back to `default`.
    pub fn from_env(prefix: &str, default: RateLimitConfig) -> Self {
        let limit = std::env::var(prefix)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default.limit);
        let window = std::env::var(format!("{}_WINDOW", prefix))
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(default.window);
        Self { limit, window }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Seconds until a retry can succeed; 0 when allowed
    pub retry_in_secs: u64,
}

impl RateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_in_secs: 0,
        }
    }

    pub fn deny(retry_in_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_in_secs: retry_in_secs.max(1),
        }
    }

    /// Logical AND of two scopes, reporting the longer wait on denial.
    pub fn and(self, other: RateDecision) -> RateDecision {
        if self.allowed && other.allowed {
            RateDecision::allow()
        } else {
            RateDecision::deny(self.retry_in_secs.max(other.retry_in_secs))
        }
    }
}

/// Store-backed sliding-window limiter.
pub struct SlidingWindowLimiter {
    name: String,
    config: RateLimitConfig,
    store: SharedStore,
    clock: SharedClock,
}

impl SlidingWindowLimiter {
    pub fn new(
        name: impl Into<String>,
        config: RateLimitConfig,
        store: SharedStore,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            store,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    fn key(&self, key: &str) -> String {
        format!("ratelimit:{}:{}", self.name, key)
    }

    fn window_ms(&self) -> i64 {
        self.config.window.as_millis() as i64
    }

    /// Admit one call for `key` now.
    pub async fn allow(&self, key: &str) -> RateDecision {
        self.allow_at(key, self.clock.now()).await
    }

    /// Admit one call for `key` at `now`. Only admissions are recorded.
    pub async fn allow_at(&self, key: &str, now: DateTime<Utc>) -> RateDecision {
        let now_ms = now.timestamp_millis();
        match self
            .store
            .window_admit(&self.key(key), now_ms, self.window_ms(), self.config.limit)
            .await
        {
            Ok(state) => self.decide(state, now_ms),
            Err(e) => {
                warn!(limiter = %self.name, key = %key, "Rate limiter store unavailable, failing open: {}", e);
                RateDecision::allow()
            }
        }
    }

    /// Calls left for `key` in the current window. Records nothing.
    pub async fn get_remaining(&self, key: &str) -> u32 {
        let now_ms = self.clock.now_millis();
        match self.store.window_peek(&self.key(key), now_ms, self.window_ms()).await {
            Ok(state) => self.config.limit.saturating_sub(state.count),
            Err(e) => {
                warn!(limiter = %self.name, key = %key, "Rate limiter store unavailable: {}", e);
                self.config.limit
            }
        }
    }

    fn spec(&self, key: &str) -> WindowSpec {
        WindowSpec {
            key: self.key(key),
            window_ms: self.window_ms(),
            limit: self.config.limit,
        }
    }

    fn decide(&self, state: WindowState, now_ms: i64) -> RateDecision {
        if state.admitted {
            return RateDecision::allow();
        }
        self.retry_after(state, now_ms)
    }

    /// Denial for a full window, waiting until its oldest entry ages out.
    fn retry_after(&self, state: WindowState, now_ms: i64) -> RateDecision {
        let window_ms = self.window_ms();
        let remaining_ms = match state.oldest_ms {
            Some(oldest) => window_ms - (now_ms - oldest),
            None => window_ms,
        };
        RateDecision::deny(ceil_secs(remaining_ms))
    }
}

fn ceil_secs(ms: i64) -> u64 {
    if ms <= 0 {
        return 1;
    }
    ((ms + 999) / 1000) as u64
}

/// Per-user and global limiters that must both admit a call.
pub struct DualScopeLimiter {
    per_user: SlidingWindowLimiter,
    global: SlidingWindowLimiter,
}

pub const GLOBAL_SCOPE_KEY: &str = "global";

impl DualScopeLimiter {
    /// Build both scopes over one store, named `{name}:user` and `{name}:global`.
    pub fn with_configs(
        name: &str,
        per_user: RateLimitConfig,
        global: RateLimitConfig,
        store: SharedStore,
        clock: SharedClock,
    ) -> Self {
        Self {
            per_user: SlidingWindowLimiter::new(
                format!("{}:user", name),
                per_user,
                store.clone(),
                clock.clone(),
            ),
            global: SlidingWindowLimiter::new(format!("{}:global", name), global, store, clock),
        }
    }

    pub fn per_user(&self) -> &SlidingWindowLimiter {
        &self.per_user
    }

    pub fn global(&self) -> &SlidingWindowLimiter {
        &self.global
    }

    /// Admit one call for `user_id` in both scopes.
    ///
    /// Both windows are checked and recorded in one store call: the call
    /// counts in both scopes or in neither, so a denial by one scope never
    /// burns a slot in the other.
    pub async fn allow(&self, user_id: &str) -> RateDecision {
        let now_ms = self.per_user.clock.now_millis();
        let scopes = [&self.per_user, &self.global];
        let specs = [self.per_user.spec(user_id), self.global.spec(GLOBAL_SCOPE_KEY)];

        match self.per_user.store.window_admit_all(&specs, now_ms).await {
            Ok(states) if states.iter().all(|state| state.admitted) => RateDecision::allow(),
            // Only full scopes contribute a wait.
            Ok(states) => scopes
                .iter()
                .zip(states)
                .filter(|(scope, state)| state.count >= scope.config.limit)
                .map(|(scope, state)| scope.retry_after(state, now_ms))
                .fold(RateDecision::deny(1), RateDecision::and),
            Err(e) => {
                warn!(user_id = %user_id, "Rate limiter store unavailable, failing open: {}", e);
                RateDecision::allow()
            }
        }
    }
}
