use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::StorageGateway;
use crate::errors::{AppError, Result};

/// Stores archives under a local directory, one file per key.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalStorage { root: root.into() }
    }

    fn path_for(&self, remote_key: &str) -> Result<PathBuf> {
        let relative = Path::new(remote_key);
        let safe = !remote_key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(AppError::Storage(format!("invalid storage key: {}", remote_key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl StorageGateway for LocalStorage {
    async fn upload(&self, bytes: Vec<u8>, remote_key: &str) -> Result<()> {
        let path = self.path_for(remote_key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::Storage(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| AppError::Storage(format!("failed to write {}: {}", path.display(), e)))?;
        debug!(key = remote_key, "Stored archive at {}", path.display());
        Ok(())
    }

    async fn download(&self, remote_key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(remote_key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| AppError::Storage(format!("failed to read {}: {}", path.display(), e)))
    }

    async fn delete(&self, remote_key: &str) -> Result<()> {
        let path = self.path_for(remote_key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!(
                "failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn exists(&self, remote_key: &str) -> Result<bool> {
        let path = self.path_for(remote_key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| AppError::Storage(format!("failed to stat {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_download_delete_cycle() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LocalStorage::new(dir.path());
        let key = "7/mysql/shop_mysql_20250101_000000.zip";

        assert!(!storage.exists(key).await?);
        storage.upload(b"PK-archive".to_vec(), key).await?;
        assert!(storage.exists(key).await?);
        assert_eq!(storage.download(key).await?, b"PK-archive");

        storage.delete(key).await?;
        assert!(!storage.exists(key).await?);
        // Second delete of a missing key still succeeds.
        storage.delete(key).await?;
        Ok(())
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let storage = LocalStorage::new("/tmp/backups-root");
        for key in ["../etc/passwd", "/abs/key.zip", "a/../../b", ""] {
            assert!(matches!(
                storage.download(key).await,
                Err(AppError::Storage(_))
            ));
        }
    }

    #[tokio::test]
    async fn download_of_missing_key_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(matches!(
            storage.download("1/postgresql/none.zip").await,
            Err(AppError::Storage(_))
        ));
    }
}
