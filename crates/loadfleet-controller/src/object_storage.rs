//! Object storage holding plan scripts and data files.

use async_trait::async_trait;
use loadfleet_core::{LoadfleetError, LoadfleetResult};
use std::path::{Component, Path, PathBuf};

/// Where uploaded test scripts and data files live.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Fetch the object at `path`.
    async fn download(&self, path: &str) -> LoadfleetResult<Vec<u8>>;
    /// Store `content` at `path`, replacing any existing object.
    async fn upload(&self, path: &str, content: &[u8]) -> LoadfleetResult<()>;
}

/// Object storage on the local filesystem.
pub struct FsObjectStorage {
    root: PathBuf,
}

impl FsObjectStorage {
    /// Storage rooted at `root`, created if missing.
    pub async fn new(root: PathBuf) -> LoadfleetResult<Self> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn object_path(&self, path: &str) -> LoadfleetResult<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(LoadfleetError::Storage(format!("invalid object path '{path}'")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn download(&self, path: &str) -> LoadfleetResult<Vec<u8>> {
        let full = self.object_path(path)?;
        tokio::fs::read(&full)
            .await
            .map_err(|e| LoadfleetError::Storage(format!("Could not download {path}: {e}")))
    }

    async fn upload(&self, path: &str, content: &[u8]) -> LoadfleetResult<()> {
        let full = self.object_path(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_then_download() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FsObjectStorage::new(tmp.path().join("objects")).await.unwrap();
        storage.upload("plan/1/test.jmx", b"<x/>").await.unwrap();
        assert_eq!(storage.download("/plan/1/test.jmx").await.unwrap(), b"<x/>");
    }

    #[tokio::test]
    async fn test_missing_and_escaping_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FsObjectStorage::new(tmp.path().to_path_buf()).await.unwrap();
        assert!(storage.download("nope.csv").await.is_err());
        assert!(storage.download("../etc/passwd").await.is_err());
        assert!(storage.upload("a/../../b", b"").await.is_err());
    }
}
