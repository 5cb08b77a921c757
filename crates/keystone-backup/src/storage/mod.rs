//! Object-store client abstraction for replicating backup artifacts.
//!
//! Provider selection is pluggable but only one provider is active per
//! process; the active provider is chosen out of band (by configuration) and
//! handed to the Engine as a `Box<dyn StorageBackend>`. Missing credentials
//! must surface through [`StorageBackend::test_connection`] returning
//! `false`, not a panic — the Engine degrades to a local-only backup when
//! that happens.

pub mod azure;
pub mod gcs;
pub mod s3;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Result};

/// Object keys follow `backups/YYYY-MM-DD/<backupId>/<basename>`.
pub fn object_key(date: chrono::NaiveDate, backup_id: &str, basename: &str) -> String {
    format!(
        "backups/{}/{}/{}",
        date.format("%Y-%m-%d"),
        backup_id,
        basename
    )
}

/// Metadata attached to every uploaded object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMetadata {
    /// Identifier of the backup run this object belongs to.
    pub backup_id: String,
    /// Backup type (`daily`, `weekly`, `monthly`, `emergency`).
    pub backup_type: String,
    /// Creation timestamp of the artifact.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Size of the artifact before any provider-side transformation.
    pub original_size: u64,
}

/// Outcome of an upload.
#[derive(Debug, Clone)]
pub struct UploadResult {
    /// The object key under which the artifact was stored.
    pub key: String,
    /// Provider URL for the object, if one is meaningful for the provider.
    pub url: Option<String>,
    /// Size in bytes, as reported by the provider.
    pub size: u64,
    /// ETag or equivalent content fingerprint, if the provider returns one.
    pub etag: Option<String>,
}

/// Outcome of a download.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// Size in bytes written to the destination path.
    pub size: u64,
    /// Last-modified timestamp reported by the provider.
    pub last_modified: chrono::DateTime<chrono::Utc>,
    /// ETag or equivalent content fingerprint.
    pub etag: Option<String>,
}

/// One entry returned from [`StorageBackend::list`].
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Last-modified timestamp.
    pub last_modified: chrono::DateTime<chrono::Utc>,
    /// ETag or equivalent content fingerprint.
    pub etag: Option<String>,
}

/// Aggregate statistics over all objects under the backup prefix.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Number of objects.
    pub count: u64,
    /// Sum of object sizes in bytes.
    pub total_size: u64,
    /// Oldest object's last-modified timestamp.
    pub oldest: Option<chrono::DateTime<chrono::Utc>>,
    /// Newest object's last-modified timestamp.
    pub newest: Option<chrono::DateTime<chrono::Utc>>,
}

/// Capability set for replicating backup artifacts to object storage.
///
/// Deliberately narrow: this is not a general-purpose object-storage client
/// (per the Non-goals), only what the Backup Engine and Verification Engine
/// need — upload, download, a size-based verify, delete, list, a
/// connectivity probe, and aggregate stats.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Upload the file at `local_path` under `object_key`, requesting
    /// server-side encryption where the provider supports it.
    async fn upload(
        &self,
        local_path: &Path,
        object_key: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult>;

    /// Download `object_key` to `local_path`.
    async fn download(&self, object_key: &str, local_path: &Path) -> Result<DownloadResult>;

    /// Verify that `object_key` matches the local file at `local_path`.
    /// Size match is required; etag comparison is informational only.
    async fn verify(&self, object_key: &str, local_path: &Path) -> Result<bool>;

    /// Delete an object.
    async fn delete(&self, object_key: &str) -> Result<()>;

    /// List objects under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>>;

    /// Probe whether the backend is reachable and configured.
    async fn test_connection(&self) -> bool;

    /// Aggregate statistics over all backup objects.
    async fn stats(&self) -> Result<StorageStats>;
}

/// Provider-specific connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageConfig {
    /// Amazon S3 or an S3-compatible endpoint.
    S3 {
        /// AWS region.
        region: String,
        /// Bucket name.
        bucket: String,
        /// Override endpoint, for S3-compatible providers.
        endpoint: Option<String>,
    },
    /// Google Cloud Storage.
    Gcs {
        /// GCP project id.
        project_id: String,
        /// Bucket name.
        bucket: String,
    },
    /// Azure Blob Storage.
    Azure {
        /// Storage account name.
        account_name: String,
        /// Container name.
        container: String,
        /// Storage account access key.
        access_key: Option<String>,
    },
}

/// Construct the configured storage backend.
///
/// Returns `None` when `config` is `None` (cloud replication disabled); a
/// missing credential inside a provider is surfaced by that provider's
/// `test_connection` returning `false` rather than by this call failing.
pub async fn create_storage_backend(
    config: Option<StorageConfig>,
) -> Result<Option<Box<dyn StorageBackend>>> {
    let Some(config) = config else {
        return Ok(None);
    };

    let backend: Box<dyn StorageBackend> = match config {
        StorageConfig::S3 { .. } => Box::new(s3::S3Backend::new(config).await?),
        StorageConfig::Gcs { .. } => Box::new(gcs::GcsBackend::new(config).await?),
        StorageConfig::Azure { .. } => Box::new(azure::AzureBackend::new(config).await?),
    };
    Ok(Some(backend))
}

fn config_mismatch(provider: &str) -> BackupError {
    BackupError::Config(format!("storage config does not match provider {provider}"))
}
