//! Job submission and status handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::{Validate, ValidationError};

use spendbot_models::{JobId, JobKind, JobSnapshot, JobStatus};

use crate::error::{ApiError, ApiResult};
use crate::extract::CallerId;
use crate::metrics;
use crate::state::AppState;

/// Largest accepted payload once serialized.
const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

fn validate_job_type(job_type: &str) -> Result<(), ValidationError> {
    job_type
        .parse::<JobKind>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("unknown_job_type").with_message("Unknown job type".into()))
}

fn validate_idempotency_key(key: &str) -> Result<(), ValidationError> {
    if key.trim().is_empty() {
        return Err(ValidationError::new("blank_idempotency_key")
            .with_message("idempotency_key must not be blank".into()));
    }
    Ok(())
}

fn validate_payload_size(payload: &serde_json::Value) -> Result<(), ValidationError> {
    let size = serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(usize::MAX);
    if size > MAX_PAYLOAD_BYTES {
        return Err(ValidationError::new("payload_too_large")
            .with_message(format!("Payload must be at most {} bytes", MAX_PAYLOAD_BYTES).into()));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateJobRequest {
    #[serde(rename = "type", default)]
    #[validate(length(min = 1, message = "type is required"))]
    #[validate(custom(function = "validate_job_type"))]
    pub job_type: String,

    #[serde(default)]
    #[validate(length(min = 1, max = 255, message = "idempotency_key must be 1-255 characters"))]
    #[validate(custom(function = "validate_idempotency_key"))]
    pub idempotency_key: String,

    #[serde(default)]
    #[validate(custom(function = "validate_payload_size"))]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelJobResponse {
    pub job_id: String,
    pub status: JobStatus,
}

/// Submit a job. Returns 202 with the job ID, or the existing job's ID when
/// the idempotency key was already used.
pub async fn create_job(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreateJobResponse>)> {
    let Json(request) = body.map_err(|e| ApiError::validation(e.body_text()))?;
    request
        .validate()
        .map_err(|e| ApiError::validation(e.to_string()))?;
    let kind: JobKind = request
        .job_type
        .parse()
        .map_err(|e: spendbot_models::UnknownJobKind| ApiError::validation(e.to_string()))?;

    let decision = state.job_limiter.allow(&user_id).await;
    if !decision.allowed {
        metrics::record_rate_limit_hit("jobs");
        info!(user_id = %user_id, retry_in_secs = decision.retry_in_secs, "Job submission rate limited");
        return Err(ApiError::RateLimited {
            retry_after_secs: decision.retry_in_secs,
        });
    }

    let job_id = state
        .queue
        .enqueue(kind, request.payload, &user_id, &request.idempotency_key)
        .await?;
    metrics::record_job_enqueued(kind.as_str());

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateJobResponse {
            job_id: job_id.to_string(),
        }),
    ))
}

/// Job status for the caller's own job.
pub async fn get_job(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobSnapshot>> {
    let snapshot = owned_snapshot(&state, &user_id, &job_id).await?;
    Ok(Json(snapshot))
}

/// Cancel a job that has not started yet.
pub async fn cancel_job(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(job_id): Path<String>,
) -> ApiResult<Json<CancelJobResponse>> {
    let snapshot = owned_snapshot(&state, &user_id, &job_id).await?;

    if !state.queue.cancel_job(&snapshot.job_id).await? {
        return Err(ApiError::conflict(format!(
            "Job {} is no longer queued and cannot be cancelled",
            job_id
        )));
    }
    metrics::record_job_cancelled();
    info!(job_id = %job_id, user_id = %user_id, "Job cancelled by caller");

    Ok(Json(CancelJobResponse {
        job_id,
        status: JobStatus::Failed,
    }))
}

/// Other users' jobs are reported as missing.
async fn owned_snapshot(state: &AppState, user_id: &str, job_id: &str) -> ApiResult<JobSnapshot> {
    state
        .queue
        .get_job_status(&JobId::from_string(job_id))
        .await?
        .filter(|snapshot| snapshot.user_id == user_id)
        .ok_or_else(|| ApiError::not_found(format!("Job {} not found", job_id)))
}
