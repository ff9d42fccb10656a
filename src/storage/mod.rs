//! Durable storage for backup archives.

mod local;
mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

use async_trait::async_trait;

use crate::errors::Result;
use crate::models::Engine;

#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, remote_key: &str) -> Result<()>;
    async fn download(&self, remote_key: &str) -> Result<Vec<u8>>;
    /// Deleting a key that does not exist succeeds.
    async fn delete(&self, remote_key: &str) -> Result<()>;
    async fn exists(&self, remote_key: &str) -> Result<bool>;
}

/// Storage key of an archive: `{owner}/{engine}/{filename}`.
pub fn remote_key(owner_id: i64, engine: Engine, filename: &str) -> String {
    format!("{}/{}/{}", owner_id, engine.as_str(), filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_key_follows_owner_engine_filename() {
        assert_eq!(
            remote_key(12, Engine::PostgreSql, "app_postgresql_20250101_000000.zip"),
            "12/postgresql/app_postgresql_20250101_000000.zip"
        );
        assert_eq!(remote_key(3, Engine::MySql, "shop.zip"), "3/mysql/shop.zip");
    }
}
