//! AWS S3 storage backend.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::{config::Region, primitives::ByteStream, Client};

use super::{
    config_mismatch, DownloadResult, ObjectEntry, StorageBackend, StorageConfig, StorageStats,
    UploadMetadata, UploadResult,
};
use crate::error::{BackupError, Result};

/// AWS S3 (or S3-compatible) storage backend.
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Create a new S3 backend from [`StorageConfig::S3`].
    pub async fn new(config: StorageConfig) -> Result<Self> {
        let (region, bucket, endpoint) = match config {
            StorageConfig::S3 {
                region,
                bucket,
                endpoint,
            } => (region, bucket, endpoint),
            _ => return Err(config_mismatch("s3")),
        };

        let mut builder = aws_config::from_env().region(Region::new(region));
        if let Some(endpoint_url) = endpoint {
            builder = builder.endpoint_url(endpoint_url);
        }

        let aws_config = builder.load().await;
        let client = Client::new(&aws_config);

        Ok(Self { client, bucket })
    }

    fn map_err<E: std::fmt::Display>(err: E) -> BackupError {
        BackupError::Remote(format!("s3: {err}"))
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn upload(
        &self,
        local_path: &Path,
        object_key: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(Self::map_err)?;
        let size = tokio::fs::metadata(local_path).await?.len();

        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .body(body)
            .server_side_encryption(aws_sdk_s3::types::ServerSideEncryption::Aes256)
            .metadata("backupId", &metadata.backup_id)
            .metadata("type", &metadata.backup_type)
            .metadata("createdAt", metadata.created_at.to_rfc3339())
            .metadata("originalSize", metadata.original_size.to_string())
            .send()
            .await
            .map_err(Self::map_err)?;

        Ok(UploadResult {
            key: object_key.to_string(),
            url: Some(format!("s3://{}/{}", self.bucket, object_key)),
            size,
            etag: output.e_tag().map(str::to_string),
        })
    }

    async fn download(&self, object_key: &str, local_path: &Path) -> Result<DownloadResult> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(Self::map_err)?;

        let last_modified = output
            .last_modified()
            .and_then(|dt| {
                chrono::DateTime::parse_from_rfc3339(&dt.to_string())
                    .ok()
                    .map(|dt| dt.with_timezone(&chrono::Utc))
            })
            .unwrap_or_else(chrono::Utc::now);
        let etag = output.e_tag().map(str::to_string);

        let data = output
            .body
            .collect()
            .await
            .map_err(Self::map_err)?
            .into_bytes();
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &data).await?;

        Ok(DownloadResult {
            size: data.len() as u64,
            last_modified,
            etag,
        })
    }

    async fn verify(&self, object_key: &str, local_path: &Path) -> Result<bool> {
        let local_size = tokio::fs::metadata(local_path).await?.len();
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(Self::map_err)?;
        let remote_size = output.content_length().unwrap_or(-1) as u64;
        Ok(remote_size == local_size)
    }

    async fn delete(&self, object_key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .send()
            .await
            .map_err(Self::map_err)?;

        Ok(output
            .contents()
            .iter()
            .filter_map(|obj| {
                Some(ObjectEntry {
                    key: obj.key()?.to_string(),
                    size: obj.size().unwrap_or(0) as u64,
                    last_modified: obj
                        .last_modified()
                        .and_then(|dt| {
                            chrono::DateTime::parse_from_rfc3339(&dt.to_string())
                                .ok()
                                .map(|dt| dt.with_timezone(&chrono::Utc))
                        })
                        .unwrap_or_else(chrono::Utc::now),
                    etag: obj.e_tag().map(str::to_string),
                })
            })
            .collect())
    }

    async fn test_connection(&self) -> bool {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
    }

    async fn stats(&self) -> Result<StorageStats> {
        let entries = self.list("backups/").await?;
        let mut stats = StorageStats {
            count: entries.len() as u64,
            ..Default::default()
        };
        for entry in &entries {
            stats.total_size += entry.size;
            stats.oldest = Some(stats.oldest.map_or(entry.last_modified, |o| o.min(entry.last_modified)));
            stats.newest = Some(stats.newest.map_or(entry.last_modified, |n| n.max(entry.last_modified)));
        }
        Ok(stats)
    }
}
