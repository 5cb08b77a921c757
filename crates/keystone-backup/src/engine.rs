//! Backup Engine: orchestrates one run of the daily/weekly/monthly/emergency
//! backup pipeline (§4.E).
//!
//! Steps 1..12 are strictly sequential within a single run (§5). Any fatal
//! step fails the run: the registry entry is still written for audit, the
//! working directory is removed, and a partially written combined archive
//! (if any) is deleted.

use std::path::Path;
use std::sync::Arc;

use zeroize::Zeroize;

use crate::archive;
use crate::config::BackupConfig;
use crate::db_export::{self, DatabaseSource};
use crate::error::{BackupError, Result};
use crate::registry::{
    BackupRegistry, BackupRun, BackupTrigger, BackupType, CloudState, ComponentKind,
    ComponentRecord, RunMetadata,
};
use crate::retention;
use crate::storage::{StorageBackend, UploadMetadata};

/// Collaborators the engine needs to run a backup; constructed once in the
/// composition root and shared across runs.
pub struct BackupEngine {
    config: BackupConfig,
    registry: Arc<BackupRegistry>,
    storage: Option<Arc<dyn StorageBackend>>,
    primary_db: Arc<dyn DatabaseSource>,
    license_db: Arc<dyn DatabaseSource>,
}

impl BackupEngine {
    /// Construct an engine from its collaborators.
    pub fn new(
        config: BackupConfig,
        registry: Arc<BackupRegistry>,
        storage: Option<Arc<dyn StorageBackend>>,
        primary_db: Arc<dyn DatabaseSource>,
        license_db: Arc<dyn DatabaseSource>,
    ) -> Self {
        Self {
            config,
            registry,
            storage,
            primary_db,
            license_db,
        }
    }

    /// Run the full pipeline for `run_type`, triggered as described by
    /// `trigger`/`triggering_user_id`. Always returns the final
    /// [`BackupRun`] (completed or failed) rather than an error, except for
    /// errors that occur before a registry entry could even be created.
    pub async fn run(
        &self,
        run_type: BackupType,
        trigger: BackupTrigger,
        triggering_user_id: Option<String>,
    ) -> Result<BackupRun> {
        let backup_id = allocate_backup_id(run_type);
        let working_dir = self.config.base_dir.join("daily").join(&backup_id);

        let mut run = BackupRun::start(
            backup_id.clone(),
            run_type,
            trigger,
            triggering_user_id,
            run_metadata(),
        );

        match self.run_pipeline(&backup_id, &working_dir, &mut run).await {
            Ok(()) => {
                run.retention = retention::initial_retention_state(run_type, run.started_at);
                run.complete(run.final_path.clone().unwrap_or_default(), run.total_size);
            }
            Err(e) => {
                tracing::error!(backup_id = %backup_id, error = %e, "backup run failed");
                run.fail(e.to_string());
                let _ = tokio::fs::remove_dir_all(&working_dir).await;
                if let Some(path) = &run.final_path {
                    let _ = tokio::fs::remove_file(path).await;
                }
                run.final_path = None;
                run.final_checksum = None;
            }
        }

        self.registry.put(run.clone()).await?;
        Ok(run)
    }

    async fn run_pipeline(
        &self,
        backup_id: &str,
        working_dir: &Path,
        run: &mut BackupRun,
    ) -> Result<()> {
        tokio::fs::create_dir_all(working_dir).await?;

        // Steps 2-3: export both logical databases.
        let primary = db_export::export_database(
            "primary",
            &working_dir.join("databases"),
            self.config.primary_dump_command.as_deref(),
            self.primary_db.as_ref(),
        )
        .await?;
        run.components.push(component_from_db(primary));

        let license = db_export::export_database(
            "license-authority",
            &working_dir.join("databases"),
            self.config.license_dump_command.as_deref(),
            self.license_db.as_ref(),
        )
        .await?;
        run.components.push(component_from_db(license));

        // Step 4: archive the uploads tree(s).
        let uploads_path = working_dir.join("files.tar.gz");
        let uploads_size = archive::write_archive(&uploads_path, &self.config.uploads_dirs, &[])?;
        run.components.push(ComponentRecord {
            kind: ComponentKind::Files,
            label: "uploads".to_string(),
            artifact_path: uploads_path,
            byte_size: uploads_size,
            timestamp: chrono::Utc::now(),
            method: None,
        });

        // Step 5: archive the configuration set.
        let config_path = working_dir.join("configuration.tar.gz");
        let config_size = archive::write_archive(&config_path, &self.config.config_paths, &[])?;
        run.components.push(ComponentRecord {
            kind: ComponentKind::Configuration,
            label: "configuration".to_string(),
            artifact_path: config_path,
            byte_size: config_size,
            timestamp: chrono::Utc::now(),
            method: None,
        });

        // Step 6: archive the license-authority key material, then encrypt
        // the resulting archive as a separate layer. Key material never
        // leaves the disk unencrypted.
        let keys_plain_path = working_dir.join("keys.tar.gz");
        archive::write_archive(&keys_plain_path, &[self.config.key_material_dir.clone()], &[])?;
        let mut plaintext = tokio::fs::read(&keys_plain_path).await?;
        let ciphertext = keystone_crypto::symmetric::encrypt(&plaintext, &self.config.encryption_key)?;
        plaintext.zeroize();
        let keys_enc_path = working_dir.join("keys.tar.gz.enc");
        tokio::fs::write(&keys_enc_path, &ciphertext).await?;
        tokio::fs::remove_file(&keys_plain_path).await?;
        let keys_size = ciphertext.len() as u64;
        run.components.push(ComponentRecord {
            kind: ComponentKind::EncryptedKeys,
            label: "license-authority-keys".to_string(),
            artifact_path: keys_enc_path,
            byte_size: keys_size,
            timestamp: chrono::Utc::now(),
            method: None,
        });

        // Step 7: archive application and subproject source.
        let source_path = working_dir.join("source.tar.gz");
        let source_size = archive::write_archive(&source_path, &self.config.source_dirs, &[])?;
        run.components.push(ComponentRecord {
            kind: ComponentKind::Source,
            label: "source".to_string(),
            artifact_path: source_path,
            byte_size: source_size,
            timestamp: chrono::Utc::now(),
            method: None,
        });

        // Step 8: per-component checksums.
        for component in &run.components {
            let bytes = tokio::fs::read(&component.artifact_path).await?;
            run.checksums
                .insert(component.label.clone(), keystone_crypto::symmetric::checksum_bytes(&bytes));
        }

        // Step 9: tar-gzip the working directory, then encrypt the combined
        // archive.
        let combined_plain = working_dir.with_extension("tar.gz");
        archive::write_archive(&combined_plain, &[working_dir.to_path_buf()], &[])?;
        let combined_plaintext = tokio::fs::read(&combined_plain).await?;
        let combined_ciphertext =
            keystone_crypto::symmetric::encrypt(&combined_plaintext, &self.config.encryption_key)?;
        tokio::fs::remove_file(&combined_plain).await?;

        let final_path = self
            .config
            .base_dir
            .join(bucket_for(run.run_type))
            .join(format!("{backup_id}.tar.gz.enc"));
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&final_path, &combined_ciphertext).await?;
        run.final_path = Some(final_path.clone());
        run.total_size = combined_ciphertext.len() as u64;
        run.final_checksum = Some(keystone_crypto::symmetric::checksum_bytes(&combined_ciphertext));

        // Step 11: cloud upload, if enabled. Failure is recorded but does
        // not fail the run.
        if let Some(storage) = &self.storage {
            self.upload_to_cloud(storage.as_ref(), backup_id, run, &final_path)
                .await;
        }

        // Step 12: delete the working directory (the combined archive now
        // lives solely at `final_path`).
        tokio::fs::remove_dir_all(working_dir).await?;

        Ok(())
    }

    async fn upload_to_cloud(
        &self,
        storage: &dyn StorageBackend,
        backup_id: &str,
        run: &mut BackupRun,
        final_path: &Path,
    ) {
        let date = chrono::Utc::now().date_naive();
        let object_key = crate::storage::object_key(date, backup_id, "archive.tar.gz.enc");
        let metadata = UploadMetadata {
            backup_id: backup_id.to_string(),
            backup_type: format!("{:?}", run.run_type).to_lowercase(),
            created_at: chrono::Utc::now(),
            original_size: run.total_size,
        };

        match storage.upload(final_path, &object_key, &metadata).await {
            Ok(result) => {
                let verified = storage.verify(&object_key, final_path).await.unwrap_or(false);
                run.cloud = CloudState {
                    uploaded: true,
                    provider: Some("configured".to_string()),
                    bucket: None,
                    object_key: Some(result.key),
                    uploaded_at: Some(chrono::Utc::now()),
                    upload_error: None,
                    url: result.url,
                };
                if !verified {
                    tracing::warn!(backup_id, "cloud upload completed but post-upload verify failed");
                }
            }
            Err(e) => {
                tracing::warn!(backup_id, error = %e, "cloud upload failed, keeping local artifact");
                run.cloud = CloudState {
                    uploaded: false,
                    upload_error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        }
    }
}

fn component_from_db(record: crate::db_export::DbExportRecord) -> ComponentRecord {
    let kind = if record.kind == "db-native" {
        ComponentKind::DbNative
    } else {
        ComponentKind::DbFallback
    };
    ComponentRecord {
        kind,
        label: record.label,
        artifact_path: record.artifact_path,
        byte_size: record.byte_size,
        timestamp: chrono::Utc::now(),
        method: Some(record.method),
    }
}

fn bucket_for(run_type: BackupType) -> &'static str {
    match run_type {
        BackupType::Daily => "daily",
        BackupType::Weekly => "weekly",
        BackupType::Monthly => "monthly",
        BackupType::Emergency => "daily",
    }
}

/// `"daily-backup-" + ISO8601(now) with ':' and '.' replaced by '-'`.
fn allocate_backup_id(run_type: BackupType) -> String {
    let prefix = match run_type {
        BackupType::Daily => "daily-backup",
        BackupType::Weekly => "weekly-backup",
        BackupType::Monthly => "monthly-backup",
        BackupType::Emergency => "emergency-backup",
    };
    let stamp = chrono::Utc::now()
        .to_rfc3339()
        .replace(':', "-")
        .replace('.', "-");
    format!("{prefix}-{stamp}")
}

fn run_metadata() -> RunMetadata {
    RunMetadata {
        hostname: hostname_or_unknown(),
        platform: std::env::consts::OS.to_string(),
        runtime_version: std::env::var("CARGO_PKG_RUST_VERSION").unwrap_or_else(|_| "unknown".to_string()),
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DownloadResult, ObjectEntry, StorageStats, UploadResult};
    use async_trait::async_trait;
    use serde_json::Value;

    struct EmptyDb;

    #[async_trait]
    impl DatabaseSource for EmptyDb {
        async fn list_collections(&self) -> Result<Vec<String>> {
            Ok(vec!["docs".to_string()])
        }

        async fn documents(&self, _collection: &str) -> Result<Vec<Value>> {
            Ok(vec![serde_json::json!({"_id": 1})])
        }
    }

    struct NullStorage;

    #[async_trait]
    impl StorageBackend for NullStorage {
        async fn upload(
            &self,
            _local_path: &Path,
            object_key: &str,
            _metadata: &UploadMetadata,
        ) -> Result<UploadResult> {
            Ok(UploadResult {
                key: object_key.to_string(),
                url: None,
                size: 0,
                etag: None,
            })
        }

        async fn download(&self, _object_key: &str, _local_path: &Path) -> Result<DownloadResult> {
            Ok(DownloadResult {
                size: 0,
                last_modified: chrono::Utc::now(),
                etag: None,
            })
        }

        async fn verify(&self, _object_key: &str, _local_path: &Path) -> Result<bool> {
            Ok(true)
        }

        async fn delete(&self, _object_key: &str) -> Result<()> {
            Ok(())
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<ObjectEntry>> {
            Ok(vec![])
        }

        async fn test_connection(&self) -> bool {
            true
        }

        async fn stats(&self) -> Result<StorageStats> {
            Ok(StorageStats::default())
        }
    }

    fn test_config(base: &Path) -> BackupConfig {
        let uploads = base.join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        std::fs::write(uploads.join("a.txt"), b"hello").unwrap();

        let config_dir = base.join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("app.toml"), b"key=1").unwrap();

        let keys_dir = base.join("keys");
        std::fs::create_dir_all(&keys_dir).unwrap();
        std::fs::write(keys_dir.join("private.pem"), b"-----KEY-----").unwrap();

        let source_dir = base.join("src");
        std::fs::create_dir_all(&source_dir).unwrap();
        std::fs::write(source_dir.join("main.rs"), b"fn main() {}").unwrap();

        BackupConfig {
            base_dir: base.join("backups"),
            primary_db_uri: "mock://primary".to_string(),
            license_db_uri: "mock://license".to_string(),
            encryption_key: keystone_crypto::symmetric::generate_key(),
            backups_enabled: true,
            cloud_enabled: false,
            cloud_provider: None,
            storage: None,
            uploads_dirs: vec![uploads],
            config_paths: vec![config_dir],
            key_material_dir: keys_dir,
            source_dirs: vec![source_dir],
            primary_dump_command: None,
            license_dump_command: None,
        }
    }

    #[tokio::test]
    async fn daily_run_completes_with_six_components_and_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let registry = Arc::new(BackupRegistry::open(config.base_dir.join("metadata")).await.unwrap());
        let engine = BackupEngine::new(
            config,
            registry.clone(),
            None,
            Arc::new(EmptyDb),
            Arc::new(EmptyDb),
        );

        let run = engine
            .run(BackupType::Daily, BackupTrigger::Scheduled, None)
            .await
            .unwrap();

        assert_eq!(run.status, crate::registry::RunStatus::Completed);
        assert_eq!(run.components.len(), 6);
        assert_eq!(run.checksums.len(), 6);
        assert!(run.total_size > 0);
        let final_path = run.final_path.clone().unwrap();
        assert!(final_path.exists());

        let final_bytes = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(
            run.final_checksum.as_deref(),
            Some(keystone_crypto::symmetric::checksum_bytes(&final_bytes).as_str())
        );

        let fetched = registry.get(&run.backup_id).await.unwrap();
        assert_eq!(fetched.status, crate::registry::RunStatus::Completed);
    }

    #[tokio::test]
    async fn cloud_upload_failure_does_not_fail_the_run() {
        struct FailingStorage;
        #[async_trait]
        impl StorageBackend for FailingStorage {
            async fn upload(
                &self,
                _local_path: &Path,
                _object_key: &str,
                _metadata: &UploadMetadata,
            ) -> Result<UploadResult> {
                Err(BackupError::Remote("connection refused".to_string()))
            }
            async fn download(&self, _: &str, _: &Path) -> Result<DownloadResult> {
                unreachable!()
            }
            async fn verify(&self, _: &str, _: &Path) -> Result<bool> {
                Ok(false)
            }
            async fn delete(&self, _: &str) -> Result<()> {
                Ok(())
            }
            async fn list(&self, _: &str) -> Result<Vec<ObjectEntry>> {
                Ok(vec![])
            }
            async fn test_connection(&self) -> bool {
                false
            }
            async fn stats(&self) -> Result<StorageStats> {
                Ok(StorageStats::default())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let registry = Arc::new(BackupRegistry::open(config.base_dir.join("metadata")).await.unwrap());
        let engine = BackupEngine::new(
            config,
            registry,
            Some(Arc::new(FailingStorage)),
            Arc::new(EmptyDb),
            Arc::new(EmptyDb),
        );

        let run = engine
            .run(BackupType::Daily, BackupTrigger::Manual, Some("alice".to_string()))
            .await
            .unwrap();

        assert_eq!(run.status, crate::registry::RunStatus::Completed);
        assert!(!run.cloud.uploaded);
        assert!(run.cloud.upload_error.is_some());
    }
}
