//! Google Cloud Storage backend.

use std::path::Path;

use async_trait::async_trait;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::{
    delete::DeleteObjectRequest,
    download::Range,
    get::GetObjectRequest,
    list::ListObjectsRequest,
    upload::{Media, UploadObjectRequest, UploadType},
    Object,
};

use super::{
    config_mismatch, DownloadResult, ObjectEntry, StorageBackend, StorageConfig, StorageStats,
    UploadMetadata, UploadResult,
};
use crate::error::{BackupError, Result};

/// Google Cloud Storage backend.
pub struct GcsBackend {
    client: Client,
    bucket: String,
}

impl GcsBackend {
    /// Create a new GCS backend from [`StorageConfig::Gcs`].
    pub async fn new(config: StorageConfig) -> Result<Self> {
        let bucket = match config {
            StorageConfig::Gcs { bucket, .. } => bucket,
            _ => return Err(config_mismatch("gcs")),
        };

        let client_config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(Self::map_err)?;
        let client = Client::new(client_config);

        Ok(Self { client, bucket })
    }

    fn map_err<E: std::fmt::Display>(err: E) -> BackupError {
        BackupError::Remote(format!("gcs: {err}"))
    }

    fn object_to_entry(obj: &Object) -> ObjectEntry {
        ObjectEntry {
            key: obj.name.clone(),
            size: obj.size as u64,
            last_modified: obj
                .updated
                .map(|dt| {
                    chrono::DateTime::<chrono::Utc>::from_timestamp(
                        dt.unix_timestamp(),
                        dt.nanosecond(),
                    )
                    .unwrap_or_else(chrono::Utc::now)
                })
                .unwrap_or_else(chrono::Utc::now),
            etag: Some(obj.etag.clone()),
        }
    }
}

#[async_trait]
impl StorageBackend for GcsBackend {
    async fn upload(
        &self,
        local_path: &Path,
        object_key: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult> {
        let data = tokio::fs::read(local_path).await?;
        let size = data.len() as u64;

        let upload_type = UploadType::Simple(Media::new(object_key.to_string()));
        let request = UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };

        let object = self
            .client
            .upload_object(&request, data, &upload_type)
            .await
            .map_err(Self::map_err)?;

        tracing::debug!(
            backup_id = %metadata.backup_id,
            object_key,
            "uploaded object to gcs"
        );

        Ok(UploadResult {
            key: object_key.to_string(),
            url: Some(format!("gs://{}/{}", self.bucket, object_key)),
            size,
            etag: Some(object.etag),
        })
    }

    async fn download(&self, object_key: &str, local_path: &Path) -> Result<DownloadResult> {
        let request = GetObjectRequest {
            bucket: self.bucket.clone(),
            object: object_key.to_string(),
            ..Default::default()
        };

        let data = self
            .client
            .download_object(&request, &Range::default())
            .await
            .map_err(Self::map_err)?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &data).await?;

        let object = self
            .client
            .get_object(&request)
            .await
            .map_err(Self::map_err)?;

        Ok(DownloadResult {
            size: data.len() as u64,
            last_modified: Self::object_to_entry(&object).last_modified,
            etag: Some(object.etag),
        })
    }

    async fn verify(&self, object_key: &str, local_path: &Path) -> Result<bool> {
        let local_size = tokio::fs::metadata(local_path).await?.len();
        let request = GetObjectRequest {
            bucket: self.bucket.clone(),
            object: object_key.to_string(),
            ..Default::default()
        };
        let object = self
            .client
            .get_object(&request)
            .await
            .map_err(Self::map_err)?;
        Ok(object.size as u64 == local_size)
    }

    async fn delete(&self, object_key: &str) -> Result<()> {
        let request = DeleteObjectRequest {
            bucket: self.bucket.clone(),
            object: object_key.to_string(),
            ..Default::default()
        };
        self.client
            .delete_object(&request)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let request = ListObjectsRequest {
            bucket: self.bucket.clone(),
            prefix: Some(prefix.to_string()),
            ..Default::default()
        };
        let response = self
            .client
            .list_objects(&request)
            .await
            .map_err(Self::map_err)?;

        Ok(response
            .items
            .unwrap_or_default()
            .iter()
            .map(Self::object_to_entry)
            .collect())
    }

    async fn test_connection(&self) -> bool {
        let request = ListObjectsRequest {
            bucket: self.bucket.clone(),
            max_results: Some(1),
            ..Default::default()
        };
        self.client.list_objects(&request).await.is_ok()
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
