//! Application state.

use std::sync::Arc;

use spendbot_models::SharedClock;
use spendbot_queue::{DualScopeLimiter, JobQueue, QueueConfig, QueueResult, RedisStore, SharedStore};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub queue: Arc<JobQueue>,
    /// Per-user and global limits on job submissions
    pub job_limiter: Arc<DualScopeLimiter>,
}

impl AppState {
    /// Build state over an existing store.
    pub fn new(config: ApiConfig, queue_config: QueueConfig, store: SharedStore, clock: SharedClock) -> Self {
        let job_limiter = DualScopeLimiter::with_configs(
            "jobs",
            config.user_job_limit,
            config.global_job_limit,
            store.clone(),
            clock.clone(),
        );
        Self {
            config,
            queue: Arc::new(JobQueue::new(queue_config, store, clock)),
            job_limiter: Arc::new(job_limiter),
        }
    }

    /// Build state against Redis using `REDIS_URL` and the `QUEUE_*` variables.
    pub fn from_env(config: ApiConfig, clock: SharedClock) -> QueueResult<Self> {
        let queue_config = QueueConfig::from_env();
        let store: SharedStore = Arc::new(RedisStore::new(&queue_config.redis_url)?);
        Ok(Self::new(config, queue_config, store, clock))
    }
}
