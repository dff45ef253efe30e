//! Single-job processing.
//!
//! For each dequeued job the processor consults the AI-call limiter and the
//! circuit breaker, dispatches to the job kind's handler, classifies the
//! outcome and records it through `complete_job`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use spendbot_models::Job;
use spendbot_queue::{Completion, DualScopeLimiter, JobQueue};
use spendbot_storage::{result_path, SharedResultStore};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::WorkerResult;
use crate::handlers::HandlerRegistry;
use crate::metrics;
use crate::telemetry::{AttemptOutcome, JobEvent, TelemetrySink, TracingTelemetry};

/// Error recorded on jobs rejected by the open breaker.
pub const CIRCUIT_OPEN_ERROR: &str = "circuit breaker open";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The attempt was recorded through `complete_job`
    Completed(Completion),
    /// Deferred by the rate limiter; the attempt was handed back
    Rescheduled { retry_at: DateTime<Utc> },
}

pub struct JobProcessor {
    queue: Arc<JobQueue>,
    breaker: Arc<CircuitBreaker>,
    handlers: HandlerRegistry,
    ai_limiter: Option<Arc<DualScopeLimiter>>,
    results: Option<SharedResultStore>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl JobProcessor {
    pub fn new(queue: Arc<JobQueue>, breaker: Arc<CircuitBreaker>, handlers: HandlerRegistry) -> Self {
        Self {
            queue,
            breaker,
            handlers,
            ai_limiter: None,
            results: None,
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    /// Limit provider calls per user and globally.
    pub fn with_rate_limiter(mut self, limiter: Arc<DualScopeLimiter>) -> Self {
        self.ai_limiter = Some(limiter);
        self
    }

    pub fn with_result_store(mut self, store: SharedResultStore) -> Self {
        self.results = Some(store);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Process one job that this worker dequeued (status `running`).
    pub async fn process(&self, job: Job) -> WorkerResult<ProcessOutcome> {
        let span = info_span!(
            "job",
            job_id = %job.job_id,
            job_type = %job.kind,
            attempt = job.attempts
        );
        self.process_inner(job).instrument(span).await
    }

    async fn process_inner(&self, job: Job) -> WorkerResult<ProcessOutcome> {
        let started = Instant::now();

        // The limiter goes first so a deferred job never holds a half-open
        // trial slot it will not report on.
        if let Some(limiter) = &self.ai_limiter {
            let decision = limiter.allow(&job.user_id).await;
            if !decision.allowed {
                let delay = Duration::from_secs(decision.retry_in_secs);
                let retry_at = self.queue.reschedule(&job.job_id, delay).await?;
                metrics::record_rate_limit_hit("ai_calls");
                info!(
                    user_id = %job.user_id,
                    retry_in_secs = decision.retry_in_secs,
                    "AI call limit reached, job rescheduled"
                );
                self.emit(&job, started, AttemptOutcome::RateLimited, None, true);
                return Ok(ProcessOutcome::Rescheduled { retry_at });
            }
        }

        if !self.breaker.call_allowed() {
            let completion = self
                .queue
                .complete_job(&job.job_id, false, None, Some(CIRCUIT_OPEN_ERROR.to_string()))
                .await?;
            self.emit(
                &job,
                started,
                AttemptOutcome::CircuitOpen,
                Some(CIRCUIT_OPEN_ERROR.to_string()),
                will_retry(&completion),
            );
            return Ok(ProcessOutcome::Completed(completion));
        }

        match self.handlers.dispatch(&job).await {
            Ok(output) => {
                self.breaker.record_success();
                let result_ref = self.persist_result(&job, &output).await;
                let completion = self
                    .queue
                    .complete_job(&job.job_id, true, result_ref, None)
                    .await?;
                self.emit(&job, started, AttemptOutcome::Succeeded, None, false);
                Ok(ProcessOutcome::Completed(completion))
            }
            Err(e) => {
                if e.counts_against_breaker() {
                    self.breaker.record_failure();
                } else {
                    // No verdict on provider health; a half-open trial slot
                    // goes back for the next job.
                    self.breaker.release_trial();
                }
                let outcome = if e.is_provider_error() {
                    AttemptOutcome::ProviderError
                } else {
                    AttemptOutcome::InvalidJob
                };
                let message = e.to_string();
                warn!(outcome = %outcome, "Job attempt failed: {}", message);

                let completion = self
                    .queue
                    .complete_job(&job.job_id, false, None, Some(message.clone()))
                    .await?;
                self.emit(&job, started, outcome, Some(message), will_retry(&completion));
                Ok(ProcessOutcome::Completed(completion))
            }
        }
    }

    /// Write the handler output to the result store. Failures are logged and
    /// the job still succeeds without a reference.
    async fn persist_result(&self, job: &Job, output: &Value) -> Option<String> {
        let store = self.results.as_ref()?;
        let path = result_path(&job.user_id, job.job_id.as_str());
        let document = json!({
            "job_id": job.job_id,
            "type": job.kind,
            "user_id": job.user_id,
            "result": output,
        });
        let body = match serde_json::to_vec(&document) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to serialize result: {}", e);
                return None;
            }
        };

        match store.put(&path, body).await {
            Ok(reference) => {
                debug!(result_ref = %reference, "Stored job result");
                Some(reference)
            }
            Err(e) => {
                warn!(path = %path, "Failed to store job result: {}", e);
                metrics::record_result_write_failure(job.kind.as_str());
                None
            }
        }
    }

    fn emit(
        &self,
        job: &Job,
        started: Instant,
        outcome: AttemptOutcome,
        error: Option<String>,
        will_retry: bool,
    ) {
        self.telemetry.record(&JobEvent {
            job_id: job.job_id.clone(),
            kind: job.kind,
            user_id: job.user_id.clone(),
            attempt: job.attempts,
            latency_ms: started.elapsed().as_millis() as u64,
            outcome,
            error,
            will_retry,
        });
    }
}

fn will_retry(completion: &Completion) -> bool {
    matches!(completion, Completion::RetryScheduled { .. })
}
