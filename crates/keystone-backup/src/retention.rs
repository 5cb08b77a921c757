//! Retention: daily keeps 30 days, weekly keeps 12 weeks, monthly keeps 12
//! months. Applied by walking each bucket and deleting artifacts whose
//! horizon has passed; a second application in a row must be a no-op.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::registry::{BackupRegistry, BackupType, RetentionPolicy, RetentionState};
use crate::storage::StorageBackend;

/// Horizon, in days, for each retention bucket.
pub fn horizon_days(policy: RetentionPolicy) -> i64 {
    match policy {
        RetentionPolicy::Daily => 30,
        RetentionPolicy::Weekly => 12 * 7,
        RetentionPolicy::Monthly => 12 * 30,
    }
}

/// Map a run type to its retention bucket. Emergency runs are never
/// auto-expired by this policy.
pub fn policy_for(run_type: BackupType) -> Option<RetentionPolicy> {
    match run_type {
        BackupType::Daily => Some(RetentionPolicy::Daily),
        BackupType::Weekly => Some(RetentionPolicy::Weekly),
        BackupType::Monthly => Some(RetentionPolicy::Monthly),
        BackupType::Emergency => None,
    }
}

/// Compute the retention state a freshly completed run of `run_type` should
/// carry, relative to `started_at`.
pub fn initial_retention_state(
    run_type: BackupType,
    started_at: chrono::DateTime<chrono::Utc>,
) -> Option<RetentionState> {
    let policy = policy_for(run_type)?;
    Some(RetentionState {
        policy,
        expires_at: started_at + chrono::Duration::days(horizon_days(policy)),
        deleted_at: None,
    })
}

/// Report of one retention pass.
#[derive(Debug, Default)]
pub struct RetentionReport {
    /// Backup ids whose artifact was deleted this pass.
    pub deleted: Vec<String>,
    /// Backup ids that were eligible but whose artifact was already gone.
    pub already_gone: Vec<String>,
    /// Errors encountered deleting individual artifacts; does not abort the pass.
    pub errors: Vec<String>,
}

/// Apply retention: delete expired local artifacts (and their cloud copies,
/// when present) and mark the registry entries `deletedAt = now`.
///
/// Idempotent: entries with `deletedAt` already set are skipped by
/// [`BackupRegistry::expired`], so calling this twice in a row does not
/// delete anything the second time.
pub async fn apply_retention(
    registry: &BackupRegistry,
    storage: Option<&Arc<dyn StorageBackend>>,
) -> Result<RetentionReport> {
    let now = chrono::Utc::now();
    let expired = registry.expired(now).await;
    let mut report = RetentionReport::default();

    for run in expired {
        if let Some(path) = &run.final_path {
            match delete_artifact(path, &run, storage).await {
                Ok(true) => report.deleted.push(run.backup_id.clone()),
                Ok(false) => report.already_gone.push(run.backup_id.clone()),
                Err(e) => {
                    report
                        .errors
                        .push(format!("{}: {e}", run.backup_id));
                    continue;
                }
            }
        } else {
            report.already_gone.push(run.backup_id.clone());
        }

        registry
            .update(&run.backup_id, |r| {
                if let Some(retention) = r.retention.as_mut() {
                    retention.deleted_at = Some(now);
                }
            })
            .await?;
    }

    Ok(report)
}

/// Report of one cloud cleanup pass (`cloud_cleanup`, §4.I).
#[derive(Debug, Default)]
pub struct CloudCleanupReport {
    /// Object keys deleted that no registry entry referenced at all (e.g. an
    /// upload that completed after a crash before `registry.put` recorded it).
    pub orphaned: Vec<String>,
    /// Object keys deleted whose registry entry was already retired locally
    /// but whose cloud delete previously failed (`delete_artifact` discards
    /// that error) and so the copy survived.
    pub stale: Vec<String>,
    /// Errors encountered deleting individual objects; does not abort the pass.
    pub errors: Vec<String>,
}

/// Reconcile cloud storage against the registry: delete every object under
/// the backup prefix that no run references, and every object whose run was
/// already retired locally (`retention.deletedAt` set) but whose cloud copy
/// a prior retention pass failed to remove.
pub async fn cleanup_cloud(
    registry: &BackupRegistry,
    storage: &Arc<dyn StorageBackend>,
) -> Result<CloudCleanupReport> {
    let mut known_retired = std::collections::HashMap::new();
    for run_type in [
        BackupType::Daily,
        BackupType::Weekly,
        BackupType::Monthly,
        BackupType::Emergency,
    ] {
        for run in registry.by_type(run_type).await {
            if let Some(key) = run.cloud.object_key {
                let retired = run.retention.is_some_and(|r| r.deleted_at.is_some());
                known_retired.insert(key, retired);
            }
        }
    }

    let objects = storage.list("backups").await?;
    let mut report = CloudCleanupReport::default();

    for object in objects {
        let is_stale = known_retired.get(&object.key).copied().unwrap_or(false);
        let is_orphan = !known_retired.contains_key(&object.key);
        if !is_stale && !is_orphan {
            continue;
        }

        match storage.delete(&object.key).await {
            Ok(()) => {
                if is_stale {
                    report.stale.push(object.key);
                } else {
                    report.orphaned.push(object.key);
                }
            }
            Err(e) => report.errors.push(format!("{}: {e}", object.key)),
        }
    }

    Ok(report)
}

async fn delete_artifact(
    path: &PathBuf,
    run: &crate::registry::BackupRun,
    storage: Option<&Arc<dyn StorageBackend>>,
) -> Result<bool> {
    let existed = path.exists();
    if existed {
        tokio::fs::remove_file(path).await?;
    }

    if run.cloud.uploaded {
        if let (Some(storage), Some(key)) = (storage, &run.cloud.object_key) {
            let _ = storage.delete(key).await;
        }
    }

    Ok(existed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BackupRun, BackupTrigger, RunMetadata};

    fn metadata() -> RunMetadata {
        RunMetadata {
            hostname: "h".to_string(),
            platform: "linux".to_string(),
            runtime_version: "1".to_string(),
            tool_version: "0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn retention_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BackupRegistry::open(dir.path().join("metadata")).await.unwrap();

        let artifact_path = dir.path().join("daily/run.tar.gz.enc");
        tokio::fs::create_dir_all(artifact_path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&artifact_path, b"data").await.unwrap();

        let mut run = BackupRun::start(
            "daily-backup-old".to_string(),
            BackupType::Daily,
            BackupTrigger::Scheduled,
            None,
            metadata(),
        );
        run.complete(artifact_path.clone(), 4);
        run.retention = Some(RetentionState {
            policy: RetentionPolicy::Daily,
            expires_at: chrono::Utc::now() - chrono::Duration::days(1),
            deleted_at: None,
        });
        registry.put(run).await.unwrap();

        let first = apply_retention(&registry, None).await.unwrap();
        assert_eq!(first.deleted.len(), 1);
        assert!(!artifact_path.exists());

        let second = apply_retention(&registry, None).await.unwrap();
        assert!(second.deleted.is_empty());
        assert!(second.already_gone.is_empty());
    }

    #[test]
    fn horizons_match_spec_buckets() {
        assert_eq!(horizon_days(RetentionPolicy::Daily), 30);
        assert_eq!(horizon_days(RetentionPolicy::Weekly), 84);
        assert_eq!(horizon_days(RetentionPolicy::Monthly), 360);
    }

    struct ListOnlyStorage {
        objects: Vec<crate::storage::ObjectEntry>,
        deleted: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl StorageBackend for ListOnlyStorage {
        async fn upload(
            &self,
            _: &std::path::Path,
            _: &str,
            _: &crate::storage::UploadMetadata,
        ) -> Result<crate::storage::UploadResult> {
            unreachable!()
        }
        async fn download(&self, _: &str, _: &std::path::Path) -> Result<crate::storage::DownloadResult> {
            unreachable!()
        }
        async fn verify(&self, _: &str, _: &std::path::Path) -> Result<bool> {
            unreachable!()
        }
        async fn delete(&self, object_key: &str) -> Result<()> {
            self.deleted.lock().unwrap().push(object_key.to_string());
            Ok(())
        }
        async fn list(&self, _: &str) -> Result<Vec<crate::storage::ObjectEntry>> {
            let deleted = self.deleted.lock().unwrap();
            Ok(self
                .objects
                .iter()
                .filter(|o| !deleted.contains(&o.key))
                .cloned()
                .collect())
        }
        async fn test_connection(&self) -> bool {
            true
        }
        async fn stats(&self) -> Result<crate::storage::StorageStats> {
            Ok(crate::storage::StorageStats::default())
        }
    }

    fn object(key: &str) -> crate::storage::ObjectEntry {
        crate::storage::ObjectEntry {
            key: key.to_string(),
            size: 4,
            last_modified: chrono::Utc::now(),
            etag: None,
        }
    }

    #[tokio::test]
    async fn cleanup_cloud_deletes_orphans_and_stale_objects_but_keeps_live_ones() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BackupRegistry::open(dir.path().join("metadata")).await.unwrap();

        let mut live = BackupRun::start(
            "daily-backup-live".to_string(),
            BackupType::Daily,
            BackupTrigger::Scheduled,
            None,
            metadata(),
        );
        live.complete(PathBuf::from("live.tar.gz.enc"), 4);
        live.cloud.uploaded = true;
        live.cloud.object_key = Some("backups/2026-01-01/daily-backup-live/archive.tar.gz.enc".to_string());
        registry.put(live).await.unwrap();

        let mut retired = BackupRun::start(
            "daily-backup-retired".to_string(),
            BackupType::Daily,
            BackupTrigger::Scheduled,
            None,
            metadata(),
        );
        retired.complete(PathBuf::from("retired.tar.gz.enc"), 4);
        retired.cloud.uploaded = true;
        retired.cloud.object_key = Some("backups/2025-01-01/daily-backup-retired/archive.tar.gz.enc".to_string());
        retired.retention = Some(RetentionState {
            policy: RetentionPolicy::Daily,
            expires_at: chrono::Utc::now() - chrono::Duration::days(1),
            deleted_at: Some(chrono::Utc::now()),
        });
        registry.put(retired).await.unwrap();

        let storage: Arc<dyn StorageBackend> = Arc::new(ListOnlyStorage {
            objects: vec![
                object("backups/2026-01-01/daily-backup-live/archive.tar.gz.enc"),
                object("backups/2025-01-01/daily-backup-retired/archive.tar.gz.enc"),
                object("backups/2025-01-02/unknown-run/archive.tar.gz.enc"),
            ],
            deleted: std::sync::Mutex::new(Vec::new()),
        });

        let report = cleanup_cloud(&registry, &storage).await.unwrap();

        assert_eq!(report.orphaned, vec!["backups/2025-01-02/unknown-run/archive.tar.gz.enc".to_string()]);
        assert_eq!(report.stale, vec!["backups/2025-01-01/daily-backup-retired/archive.tar.gz.enc".to_string()]);
        assert!(report.errors.is_empty());

        let second = cleanup_cloud(&registry, &storage).await.unwrap();
        assert!(second.orphaned.is_empty());
        assert!(second.stale.is_empty());
    }
}
