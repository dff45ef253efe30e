//! Result store abstraction.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};

/// Shared result store handle.
pub type SharedResultStore = Arc<dyn ResultStore>;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Write `content` at `path`, returning a reference to the stored object.
    async fn put(&self, path: &str, content: Vec<u8>) -> StorageResult<String>;
}

/// Storage path for a job's result document.
pub fn result_path(user_id: &str, job_id: &str) -> String {
    format!("results/{}/{}.json", user_id, job_id)
}

/// Reject keys that could escape the store root.
pub fn validate_key(path: &str) -> StorageResult<()> {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return Err(StorageError::invalid_key(path));
    }
    if path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(StorageError::invalid_key(path));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_path_layout() {
        assert_eq!(result_path("u1", "job-1"), "results/u1/job-1.json");
    }

    #[test]
    fn rejects_traversal() {
        assert!(validate_key("results/u1/job.json").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("results/../secret").is_err());
        assert!(validate_key("results//x").is_err());
        assert!(validate_key("results\\x").is_err());
    }
}
