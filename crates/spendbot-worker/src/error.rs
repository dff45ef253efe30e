//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Queue error: {0}")]
    Queue(#[from] spendbot_queue::QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] spendbot_storage::StorageError),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// The backing store is unreachable; callers should back off.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, WorkerError::Queue(e) if e.is_unavailable())
    }
}
