//! Circuit breaker guarding the AI provider.
//!
//! Closed until `failure_threshold` provider failures land inside the rolling
//! window, then open for `timeout`. After the timeout a limited number of
//! trial calls go through (half-open); the first trial result decides between
//! closing and reopening.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use spendbot_models::SharedClock;

use crate::metrics;

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// Rolling window for counting failures
    pub window: Duration,
    /// How long the breaker stays open before probing
    pub timeout: Duration,
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            half_open_max: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        Self {
            failure_threshold: std::env::var("CB_FAILURE_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.failure_threshold),
            window: secs("CB_WINDOW_SECS", defaults.window),
            timeout: secs("CB_TIMEOUT_SECS", defaults.timeout),
            half_open_max: std::env::var("CB_HALF_OPEN_MAX")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.half_open_max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0 closed, 1 half-open, 2 open.
    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct BreakerState {
    state: CircuitState,
    failure_times: VecDeque<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
    half_open_attempts: u32,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        let name = name.into();
        let now = clock.now();
        metrics::set_circuit_state(&name, CircuitState::Closed.gauge_value());
        Self {
            name,
            config,
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_times: VecDeque::new(),
                last_state_change: now,
                half_open_attempts: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, moving open to half-open if the timeout has passed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner, self.clock.now());
        inner.state
    }

    /// Failures currently inside the rolling window.
    pub fn failure_count(&self) -> usize {
        let mut inner = self.lock();
        self.prune(&mut inner, self.clock.now());
        inner.failure_times.len()
    }

    /// Whether a provider call may go ahead. In half-open each `true`
    /// consumes one trial slot.
    pub fn call_allowed(&self) -> bool {
        let mut inner = self.lock();
        let now = self.clock.now();
        self.maybe_half_open(&mut inner, now);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_attempts < self.config.half_open_max {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        let now = self.clock.now();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.failure_times.clear();
                self.transition(&mut inner, CircuitState::Closed, now);
                info!(breaker = %self.name, "Circuit breaker closed after successful trial");
            }
            _ => self.prune(&mut inner, now),
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = self.clock.now();
        match inner.state {
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, now);
                warn!(breaker = %self.name, "Trial call failed, circuit breaker reopened");
            }
            CircuitState::Closed => {
                inner.failure_times.push_back(now);
                self.prune(&mut inner, now);
                let failures = inner.failure_times.len();
                if failures >= self.config.failure_threshold as usize {
                    self.transition(&mut inner, CircuitState::Open, now);
                    warn!(
                        breaker = %self.name,
                        failures = failures,
                        timeout_secs = self.config.timeout.as_secs(),
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::Open => {
                // Late result from a call admitted before the breaker opened.
                inner.failure_times.push_back(now);
                self.prune(&mut inner, now);
            }
        }
    }

    /// Hand back a half-open trial slot whose call ended without a verdict
    /// on provider health (rejected payload, non-transient provider error).
    /// No-op outside half-open.
    pub fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_attempts = inner.half_open_attempts.saturating_sub(1);
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerState, now: DateTime<Utc>) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = now - inner.last_state_change;
        if elapsed >= to_chrono(self.config.timeout) {
            self.transition(inner, CircuitState::HalfOpen, now);
            info!(breaker = %self.name, "Circuit breaker half-open, allowing trial calls");
        }
    }

    fn prune(&self, inner: &mut BreakerState, now: DateTime<Utc>) {
        let cutoff = now - to_chrono(self.config.window);
        while inner.failure_times.front().is_some_and(|t| *t <= cutoff) {
            inner.failure_times.pop_front();
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, now: DateTime<Utc>) {
        inner.state = to;
        inner.last_state_change = now;
        inner.half_open_attempts = 0;
        metrics::set_circuit_state(&self.name, to.gauge_value());
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
