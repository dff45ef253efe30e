//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Metric names as constants for consistency.
pub mod names {
    // Processing metrics
    pub const JOB_ATTEMPTS_TOTAL: &str = "spendbot_job_attempts_total";
    pub const JOB_LATENCY_SECONDS: &str = "spendbot_job_latency_seconds";
    pub const RESULT_WRITE_FAILURES_TOTAL: &str = "spendbot_result_write_failures_total";

    // Provider protection
    pub const CIRCUIT_BREAKER_STATE: &str = "spendbot_circuit_breaker_state";
    pub const RATE_LIMIT_HITS_TOTAL: &str = "spendbot_rate_limit_hits_total";

    // Queue metrics
    pub const QUEUE_LENGTH: &str = "spendbot_queue_length";
    pub const QUEUE_RETRY_LENGTH: &str = "spendbot_queue_retry_length";
    pub const QUEUE_DLQ_LENGTH: &str = "spendbot_queue_dlq_length";
}

/// Serve `/metrics` for Prometheus on `addr`.
pub fn install_exporter(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()
}

/// Record one processing attempt.
pub fn record_job_attempt(job_type: &str, outcome: &str, latency_secs: f64) {
    let labels = [
        ("type", job_type.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!(names::JOB_ATTEMPTS_TOTAL, &labels).increment(1);

    let labels = [("type", job_type.to_string())];
    histogram!(names::JOB_LATENCY_SECONDS, &labels).record(latency_secs);
}

pub fn record_result_write_failure(job_type: &str) {
    let labels = [("type", job_type.to_string())];
    counter!(names::RESULT_WRITE_FAILURES_TOTAL, &labels).increment(1);
}

pub fn set_circuit_state(breaker: &str, value: f64) {
    let labels = [("breaker", breaker.to_string())];
    gauge!(names::CIRCUIT_BREAKER_STATE, &labels).set(value);
}

pub fn record_rate_limit_hit(scope: &str) {
    let labels = [("scope", scope.to_string())];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

pub fn set_queue_lengths(queue: u64, retry: u64, dlq: u64) {
    gauge!(names::QUEUE_LENGTH).set(queue as f64);
    gauge!(names::QUEUE_RETRY_LENGTH).set(retry as f64);
    gauge!(names::QUEUE_DLQ_LENGTH).set(dlq as f64);
}
