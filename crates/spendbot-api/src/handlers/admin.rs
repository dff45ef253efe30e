//! Queue inspection for operators.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use spendbot_models::DeadLetter;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueStatusResponse {
    pub queue_len: u64,
    /// Jobs a worker has claimed and not yet settled
    pub claimed_len: u64,
    pub retry_len: u64,
    pub dlq_len: u64,
}

pub async fn queue_status(State(state): State<AppState>) -> ApiResult<Json<QueueStatusResponse>> {
    Ok(Json(QueueStatusResponse {
        queue_len: state.queue.queue_len().await?,
        claimed_len: state.queue.claimed_len().await?,
        retry_len: state.queue.retry_len().await?,
        dlq_len: state.queue.dlq_len().await?,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

/// Most recent dead letters, oldest first.
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> ApiResult<Json<Vec<DeadLetter>>> {
    let limit = query.limit.clamp(1, 100);
    Ok(Json(state.queue.dead_letters(limit).await?))
}
