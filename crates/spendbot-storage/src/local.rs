//! Filesystem result store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageResult;
use crate::store::{validate_key, ResultStore};

/// Writes results below a root directory.
#[derive(Debug, Clone)]
pub struct LocalResultStore {
    root: PathBuf,
}

impl LocalResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ResultStore for LocalResultStore {
    async fn put(&self, path: &str, content: Vec<u8>) -> StorageResult<String> {
        validate_key(path)?;
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial document.
        let tmp = target.with_extension("json.tmp");
        tokio::fs::write(&tmp, &content).await?;
        tokio::fs::rename(&tmp, &target).await?;

        debug!("Wrote {} bytes to {}", content.len(), target.display());
        Ok(path.to_string())
    }
}
