use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use tracing::{debug, info};

use super::StorageGateway;
use crate::config::SpacesConfig;
use crate::errors::{AppError, Result};

/// Archives in an S3-compatible object store (AWS S3, DigitalOcean Spaces, MinIO).
#[derive(Clone)]
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
    folder_prefix: Option<String>,
}

impl S3Storage {
    pub async fn new(spaces_config: &SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        info!(
            endpoint = %spaces_config.endpoint_url,
            bucket = %spaces_config.bucket_name,
            "S3 storage configured"
        );

        S3Storage {
            client: s3::Client::new(&sdk_config),
            bucket: spaces_config.bucket_name.clone(),
            folder_prefix: spaces_config.folder_prefix.clone(),
        }
    }

    fn object_key(&self, remote_key: &str) -> String {
        object_key(self.folder_prefix.as_deref(), remote_key)
    }
}

fn object_key(folder_prefix: Option<&str>, remote_key: &str) -> String {
    match folder_prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, remote_key),
        None => remote_key.to_string(),
    }
}

#[async_trait]
impl StorageGateway for S3Storage {
    async fn upload(&self, bytes: Vec<u8>, remote_key: &str) -> Result<()> {
        let key = self.object_key(remote_key);
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "failed to upload to S3 bucket {} with key {}: {}",
                    self.bucket, key, e
                ))
            })?;

        info!("✓ Uploaded {} bytes to s3://{}/{}", size, self.bucket, key);
        Ok(())
    }

    async fn download(&self, remote_key: &str) -> Result<Vec<u8>> {
        let key = self.object_key(remote_key);
        let mut object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!("failed to get object s3://{}/{}: {}", self.bucket, key, e))
            })?;

        let mut bytes = Vec::new();
        while let Some(chunk) = object.body.try_next().await.map_err(|e| {
            AppError::Storage(format!("failed to read object s3://{}/{}: {}", self.bucket, key, e))
        })? {
            bytes.extend_from_slice(&chunk);
        }

        debug!("Downloaded {} bytes from s3://{}/{}", bytes.len(), self.bucket, key);
        Ok(bytes)
    }

    async fn delete(&self, remote_key: &str) -> Result<()> {
        let key = self.object_key(remote_key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "failed to delete object s3://{}/{}: {}",
                    self.bucket, key, e
                ))
            })?;
        Ok(())
    }

    async fn exists(&self, remote_key: &str) -> Result<bool> {
        let key = self.object_key(remote_key);
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(AppError::Storage(format!(
                "failed to check object s3://{}/{}: {}",
                self.bucket, key, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_prefix_is_joined_without_duplicate_slashes() {
        assert_eq!(object_key(None, "1/mysql/a.zip"), "1/mysql/a.zip");
        assert_eq!(object_key(Some(""), "1/mysql/a.zip"), "1/mysql/a.zip");
        assert_eq!(object_key(Some("backups/"), "1/mysql/a.zip"), "backups/1/mysql/a.zip");
        assert_eq!(object_key(Some("/prod/db/"), "2/postgresql/b.zip"), "prod/db/2/postgresql/b.zip");
    }
}
