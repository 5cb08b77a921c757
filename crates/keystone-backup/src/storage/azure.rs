//! Azure Blob Storage backend.

use std::path::Path;

use async_trait::async_trait;
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use futures::StreamExt;

use super::{
    config_mismatch, DownloadResult, ObjectEntry, StorageBackend, StorageConfig, StorageStats,
    UploadMetadata, UploadResult,
};
use crate::error::{BackupError, Result};

/// Azure Blob Storage backend.
pub struct AzureBackend {
    client: ContainerClient,
    container: String,
}

impl AzureBackend {
    /// Create a new Azure backend from [`StorageConfig::Azure`].
    pub async fn new(config: StorageConfig) -> Result<Self> {
        let (account_name, container, access_key) = match config {
            StorageConfig::Azure {
                account_name,
                container,
                access_key,
            } => (account_name, container, access_key),
            _ => return Err(config_mismatch("azure")),
        };

        let credentials = match access_key {
            Some(key) => StorageCredentials::access_key(account_name.clone(), key),
            None => {
                return Err(BackupError::Config(
                    "azure storage requires an access key".to_string(),
                ))
            }
        };

        let blob_service = BlobServiceClient::new(account_name, credentials);
        let client = blob_service.container_client(&container);

        Ok(Self { client, container })
    }

    fn map_err<E: std::fmt::Display>(err: E) -> BackupError {
        BackupError::Remote(format!("azure: {err}"))
    }
}

#[async_trait]
impl StorageBackend for AzureBackend {
    async fn upload(
        &self,
        local_path: &Path,
        object_key: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult> {
        let data = tokio::fs::read(local_path).await?;
        let size = data.len() as u64;

        let blob_client = self.client.blob_client(object_key);
        let response = blob_client
            .put_block_blob(data)
            .content_type("application/octet-stream")
            .metadata(
                [
                    ("backupId", metadata.backup_id.as_str()),
                    ("type", metadata.backup_type.as_str()),
                ]
                .into_iter()
                .collect::<std::collections::HashMap<_, _>>(),
            )
            .await
            .map_err(Self::map_err)?;

        Ok(UploadResult {
            key: object_key.to_string(),
            url: Some(format!(
                "https://{}.blob.core.windows.net/{}/{}",
                self.container, self.container, object_key
            )),
            size,
            etag: Some(response.etag.to_string()),
        })
    }

    async fn download(&self, object_key: &str, local_path: &Path) -> Result<DownloadResult> {
        let blob_client = self.client.blob_client(object_key);

        let mut stream = blob_client.get().into_stream();
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Self::map_err)?;
            let bytes = chunk.data.collect().await.map_err(Self::map_err)?;
            data.extend_from_slice(&bytes);
        }

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &data).await?;

        let props = blob_client
            .get_properties()
            .await
            .map_err(Self::map_err)?;
        let last_modified = {
            let offset = props.blob.properties.last_modified;
            chrono::DateTime::<chrono::Utc>::from_timestamp(
                offset.unix_timestamp(),
                offset.nanosecond(),
            )
            .unwrap_or_else(chrono::Utc::now)
        };

        Ok(DownloadResult {
            size: data.len() as u64,
            last_modified,
            etag: Some(props.blob.properties.etag.to_string()),
        })
    }

    async fn verify(&self, object_key: &str, local_path: &Path) -> Result<bool> {
        let local_size = tokio::fs::metadata(local_path).await?.len();
        let blob_client = self.client.blob_client(object_key);
        let props = blob_client
            .get_properties()
            .await
            .map_err(Self::map_err)?;
        Ok(props.blob.properties.content_length == local_size)
    }

    async fn delete(&self, object_key: &str) -> Result<()> {
        let blob_client = self.client.blob_client(object_key);
        blob_client.delete().await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let mut stream = self.client.list_blobs().prefix(prefix.to_string()).into_stream();
        let mut entries = Vec::new();
        while let Some(page) = stream.next().await {
            let page = page.map_err(Self::map_err)?;
            for blob in page.blobs.blobs() {
                let last_modified = chrono::DateTime::<chrono::Utc>::from_timestamp(
                    blob.properties.last_modified.unix_timestamp(),
                    blob.properties.last_modified.nanosecond(),
                )
                .unwrap_or_else(chrono::Utc::now);
                entries.push(ObjectEntry {
                    key: blob.name.clone(),
                    size: blob.properties.content_length,
                    last_modified,
                    etag: Some(blob.properties.etag.to_string()),
                });
            }
        }
        Ok(entries)
    }

    async fn test_connection(&self) -> bool {
        self.client.get_properties().await.is_ok()
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
