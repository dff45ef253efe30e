//! Per-attempt telemetry.
//!
//! The processor emits exactly one [`JobEvent`] per processing attempt.

use std::fmt;

use serde::Serialize;
use tracing::info;

use spendbot_models::{JobId, JobKind};

use crate::metrics;

/// What happened during one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    /// Rejected by the open circuit breaker without calling the provider
    CircuitOpen,
    /// Deferred by the AI-call rate limiter; does not consume an attempt
    RateLimited,
    /// Provider call failed (timeout, 5xx, rejection, bad response)
    ProviderError,
    /// Failed before reaching the provider (bad payload, no handler)
    InvalidJob,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::CircuitOpen => "circuit_open",
            AttemptOutcome::RateLimited => "rate_limited",
            AttemptOutcome::ProviderError => "provider_error",
            AttemptOutcome::InvalidJob => "invalid_job",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub user_id: String,
    pub attempt: u32,
    pub latency_ms: u64,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the job will be picked up again
    pub will_retry: bool,
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &JobEvent);
}

/// Emits events as structured logs and Prometheus metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: &JobEvent) {
        info!(
            target: "spendbot::telemetry",
            job_id = %event.job_id,
            job_type = %event.kind,
            user_id = %event.user_id,
            attempt = event.attempt,
            latency_ms = event.latency_ms,
            outcome = %event.outcome,
            error = event.error.as_deref().unwrap_or(""),
            will_retry = event.will_retry,
            "job attempt"
        );
        metrics::record_job_attempt(
            event.kind.as_str(),
            event.outcome.as_str(),
            event.latency_ms as f64 / 1000.0,
        );
    }
}
