//! Runtime configuration, read from the environment (§6) with an optional
//! TOML overlay for local development (layered by `keystone-cli`, not by
//! this crate — environment variables always win).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Result};
use crate::storage::StorageConfig;

/// Cloud provider selected for replication, mirrors `BACKUP_CLOUD_PROVIDER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Amazon S3.
    S3,
    /// Google Cloud Storage.
    Gcs,
    /// Azure Blob Storage.
    Azure,
}

/// Top-level configuration for the backup engine, scheduler, and monitor.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Root directory backups are written under (`backups/` in §6).
    pub base_dir: PathBuf,
    /// Primary application database connection string (`MONGODB_URI`).
    pub primary_db_uri: String,
    /// License-authority database connection string (`LICENSE_DB_URI`).
    pub license_db_uri: String,
    /// Active 32-byte encryption key (`BACKUP_ENCRYPTION_KEY`, hex).
    pub encryption_key: [u8; 32],
    /// Whether the backup subsystem runs at all (`BACKUPS_ENABLED`).
    pub backups_enabled: bool,
    /// Whether cloud replication is attempted (`BACKUP_CLOUD_ENABLED`).
    pub cloud_enabled: bool,
    /// Which cloud backend to use, when enabled.
    pub cloud_provider: Option<CloudProvider>,
    /// Cloud storage configuration, constructed from provider-specific
    /// environment variables once `cloud_provider` is known.
    pub storage: Option<StorageConfig>,
    /// Uploads directory root(s) archived as the `files` component.
    pub uploads_dirs: Vec<PathBuf>,
    /// Root-relative configuration files and directories archived as the
    /// `configuration` component.
    pub config_paths: Vec<PathBuf>,
    /// License-authority key material directory, encrypted as a separate
    /// layer before being folded into the combined archive.
    pub key_material_dir: PathBuf,
    /// Application and subproject source roots archived as the `source`
    /// component.
    pub source_dirs: Vec<PathBuf>,
    /// External dump utility invocation for the primary database, if present.
    pub primary_dump_command: Option<Vec<String>>,
    /// External dump utility invocation for the license-authority database.
    pub license_dump_command: Option<Vec<String>>,
}

impl BackupConfig {
    /// Build configuration from the process environment. Fails with
    /// [`BackupError::Config`] when a required variable is absent or
    /// malformed; `keystone-cli` refuses to start jobs that depend on a
    /// configuration it could not build.
    pub fn from_env() -> Result<Self> {
        let base_dir = PathBuf::from(env_or("KEYSTONE_BASE_DIR", "backups"));

        let primary_db_uri = require_env("MONGODB_URI")?;
        let license_db_uri = require_env("LICENSE_DB_URI")?;

        let key_hex = require_env("BACKUP_ENCRYPTION_KEY")?;
        let key_bytes = hex::decode(&key_hex)
            .map_err(|e| BackupError::Config(format!("BACKUP_ENCRYPTION_KEY not hex: {e}")))?;
        let encryption_key: [u8; 32] = key_bytes.try_into().map_err(|bytes: Vec<u8>| {
            BackupError::Config(format!(
                "BACKUP_ENCRYPTION_KEY must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;

        let backups_enabled = bool_env("BACKUPS_ENABLED", true);
        let cloud_enabled = bool_env("BACKUP_CLOUD_ENABLED", false);

        let cloud_provider = if cloud_enabled {
            match std::env::var("BACKUP_CLOUD_PROVIDER").ok().as_deref() {
                Some("s3") => Some(CloudProvider::S3),
                Some("gcs") => Some(CloudProvider::Gcs),
                Some("azure") => Some(CloudProvider::Azure),
                Some(other) => {
                    return Err(BackupError::Config(format!(
                        "unknown BACKUP_CLOUD_PROVIDER: {other}"
                    )))
                }
                None => None,
            }
        } else {
            None
        };

        let storage = cloud_provider.and_then(|provider| storage_config_for(provider));

        Ok(Self {
            base_dir,
            primary_db_uri,
            license_db_uri,
            encryption_key,
            backups_enabled,
            cloud_enabled,
            cloud_provider,
            storage,
            uploads_dirs: vec![PathBuf::from("uploads")],
            config_paths: vec![PathBuf::from("config")],
            key_material_dir: PathBuf::from("license-authority/keys"),
            source_dirs: vec![PathBuf::from("src"), PathBuf::from("license-authority/src")],
            primary_dump_command: None,
            license_dump_command: None,
        })
    }
}

fn storage_config_for(provider: CloudProvider) -> Option<StorageConfig> {
    match provider {
        CloudProvider::S3 => Some(StorageConfig::S3 {
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            bucket: std::env::var("BACKUP_S3_BUCKET").ok()?,
            endpoint: std::env::var("AWS_ENDPOINT_URL").ok(),
        }),
        CloudProvider::Gcs => Some(StorageConfig::Gcs {
            project_id: std::env::var("GCP_PROJECT_ID").ok()?,
            bucket: std::env::var("BACKUP_GCS_BUCKET").ok()?,
        }),
        CloudProvider::Azure => Some(StorageConfig::Azure {
            account_name: std::env::var("AZURE_STORAGE_ACCOUNT").ok()?,
            container: std::env::var("BACKUP_AZURE_CONTAINER").ok()?,
            access_key: std::env::var("AZURE_STORAGE_ACCESS_KEY").ok(),
        }),
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| BackupError::Config(format!("missing required env var {name}")))
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_env_falls_back_to_default_when_unset() {
        std::env::remove_var("KEYSTONE_TEST_FLAG_NOT_SET");
        assert!(bool_env("KEYSTONE_TEST_FLAG_NOT_SET", true));
        assert!(!bool_env("KEYSTONE_TEST_FLAG_NOT_SET", false));
    }

    #[test]
    fn storage_config_for_s3_requires_bucket() {
        std::env::remove_var("BACKUP_S3_BUCKET");
        assert!(storage_config_for(CloudProvider::S3).is_none());
    }
}
