//! Backup Registry: a persisted, queryable log of every backup run.
//!
//! The registry is a transactional store in the narrow sense the design
//! notes call for: each update is a single transition on one entry, never a
//! multi-entry transaction. Entries are mirrored to
//! `metadata/<backupId>.json` by the Engine; the registry itself owns only
//! the in-memory/on-disk index used for queries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{BackupError, Result};

/// Kind of backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Nightly run.
    Daily,
    /// Weekly run.
    Weekly,
    /// Monthly run.
    Monthly,
    /// Ad hoc, out-of-band run.
    Emergency,
}

/// What triggered a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupTrigger {
    /// Fired by the scheduler.
    Scheduled,
    /// Started by an operator.
    Manual,
    /// Started out-of-band in response to an incident.
    Emergency,
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The engine is still executing the pipeline.
    InProgress,
    /// The pipeline finished successfully.
    Completed,
    /// The pipeline aborted on a fatal step.
    Failed,
}

/// Which logical part of the backup a component represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    /// Native dump of a logical database.
    DbNative,
    /// Document-level fallback export of a logical database.
    DbFallback,
    /// Archive of an uploads/file tree.
    Files,
    /// Archive of configuration files.
    Configuration,
    /// Encrypted archive of key material.
    EncryptedKeys,
    /// Archive of application source.
    Source,
}

/// One artifact contributed to a backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentRecord {
    /// Which kind of component this is.
    pub kind: ComponentKind,
    /// Human-readable label, usually the database or archive name.
    pub label: String,
    /// Path of the artifact on disk, relative to the run's working directory.
    pub artifact_path: PathBuf,
    /// Size in bytes.
    pub byte_size: u64,
    /// When the component was produced.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Export method, for database components (`native-dump` / `javascript-export`).
    pub method: Option<String>,
}

/// Cloud-replication state of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudState {
    /// Whether the final artifact was uploaded.
    pub uploaded: bool,
    /// Provider name, when uploaded.
    pub provider: Option<String>,
    /// Bucket/container name, when uploaded.
    pub bucket: Option<String>,
    /// Object key, when uploaded.
    pub object_key: Option<String>,
    /// Upload timestamp.
    pub uploaded_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Error encountered during upload, if any.
    pub upload_error: Option<String>,
    /// Provider URL for the object, if one exists.
    pub url: Option<String>,
}

/// Categorical outcome of a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// All phases passed cleanly.
    Excellent,
    /// Minor warnings only.
    Good,
    /// Meaningful warnings.
    Warning,
    /// A phase failed outright.
    Failed,
    /// Verification itself could not complete.
    Error,
}

/// Verification state of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationState {
    /// Whether verification has been attempted.
    pub verified: bool,
    /// When verification last ran.
    pub verified_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Categorical outcome.
    pub verdict: Option<Verdict>,
    /// Errors surfaced during verification.
    pub errors: Vec<String>,
}

/// Restoration-drill state of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestorationState {
    /// Whether a restoration drill has succeeded.
    pub restored: bool,
    /// When the restoration happened.
    pub restored_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Who performed the restoration.
    pub restored_by: Option<String>,
    /// Free-form operator notes.
    pub notes: Option<String>,
}

/// Which retention bucket a run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// 30-day horizon.
    Daily,
    /// 12-week horizon.
    Weekly,
    /// 12-month horizon.
    Monthly,
}

/// Retention state of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionState {
    /// Bucket this run's horizon is computed from.
    pub policy: RetentionPolicy,
    /// When this run's artifact becomes eligible for deletion.
    pub expires_at: chrono::DateTime<chrono::Utc>,
    /// When the artifact was actually deleted, if it has been.
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Environment metadata captured at run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Hostname of the machine that ran the backup.
    pub hostname: String,
    /// Operating system platform string.
    pub platform: String,
    /// Runtime version (e.g. the Rust compiler or tokio version string).
    pub runtime_version: String,
    /// Version of this tool.
    pub tool_version: String,
}

/// A single recorded execution of the backup pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRun {
    /// Human-sortable unique identifier, e.g. `daily-backup-2026-07-28T02-30-00`.
    pub backup_id: String,
    /// Kind of run.
    pub run_type: BackupType,
    /// What triggered the run.
    pub trigger: BackupTrigger,
    /// User id that triggered a manual run, if any.
    pub triggering_user_id: Option<String>,
    /// Lifecycle state.
    pub status: RunStatus,
    /// When the run started.
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// When the run ended.
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Components produced by this run, in pipeline order.
    pub components: Vec<ComponentRecord>,
    /// Component label to hex SHA-256 of that component's artifact bytes.
    pub checksums: HashMap<String, String>,
    /// Path of the single combined encrypted archive.
    pub final_path: Option<PathBuf>,
    /// Total size of the combined archive.
    pub total_size: u64,
    /// Hex SHA-256 of the combined archive's ciphertext bytes, recorded at
    /// archive time. Recovery and verification MUST recompute and compare
    /// this before decrypting (spec.md's "MUST verify checksums before
    /// decrypting"), since AES-256-CBC without an authentication tag can
    /// leave corruption or tampering confined to non-final blocks
    /// undetected by padding alone.
    pub final_checksum: Option<String>,
    /// Always true once the pipeline reaches the combine step.
    pub compressed: bool,
    /// Always true once the pipeline reaches the combine step.
    pub encrypted: bool,
    /// Cloud-replication state.
    pub cloud: CloudState,
    /// Verification state.
    pub verification: VerificationState,
    /// Restoration-drill state.
    pub restoration: RestorationState,
    /// Retention state.
    pub retention: Option<RetentionState>,
    /// Environment metadata.
    pub metadata: RunMetadata,
    /// Error recorded when `status == Failed`.
    pub error: Option<String>,
}

impl BackupRun {
    /// Start a new in-progress run.
    pub fn start(
        backup_id: String,
        run_type: BackupType,
        trigger: BackupTrigger,
        triggering_user_id: Option<String>,
        metadata: RunMetadata,
    ) -> Self {
        Self {
            backup_id,
            run_type,
            trigger,
            triggering_user_id,
            status: RunStatus::InProgress,
            started_at: chrono::Utc::now(),
            ended_at: None,
            components: Vec::new(),
            checksums: HashMap::new(),
            final_path: None,
            total_size: 0,
            final_checksum: None,
            compressed: false,
            encrypted: false,
            cloud: CloudState::default(),
            verification: VerificationState::default(),
            restoration: RestorationState::default(),
            retention: None,
            metadata,
            error: None,
        }
    }

    /// Mark the run completed. Mutates `status`/`endedAt` exactly once.
    pub fn complete(&mut self, final_path: PathBuf, total_size: u64) {
        self.status = RunStatus::Completed;
        self.ended_at = Some(chrono::Utc::now());
        self.final_path = Some(final_path);
        self.total_size = total_size;
        self.compressed = true;
        self.encrypted = true;
    }

    /// Mark the run failed. Mutates `status`/`endedAt` exactly once.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.ended_at = Some(chrono::Utc::now());
        self.error = Some(error.into());
    }

    /// Record a verification outcome.
    pub fn mark_as_verified(&mut self, verdict: Verdict, errors: Vec<String>) {
        self.verification = VerificationState {
            verified: true,
            verified_at: Some(chrono::Utc::now()),
            verdict: Some(verdict),
            errors,
        };
    }

    /// Record a successful restoration drill.
    pub fn mark_as_restored(&mut self, user: impl Into<String>, notes: impl Into<String>) {
        self.restoration = RestorationState {
            restored: true,
            restored_at: Some(chrono::Utc::now()),
            restored_by: Some(user.into()),
            notes: Some(notes.into()),
        };
    }
}

/// Aggregate statistics grouped by run type over a time range.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunStatistics {
    /// Total runs in range.
    pub count: u64,
    /// Runs with `status == Completed`.
    pub success_count: u64,
    /// Average `total_size` of completed runs.
    pub average_size: f64,
    /// Average duration of completed runs, in seconds.
    pub average_duration_secs: f64,
}

/// Persisted, queryable log of `BackupRun`s, mirrored as JSON under
/// `metadata/<backupId>.json` by the Engine.
pub struct BackupRegistry {
    entries: Arc<RwLock<HashMap<String, BackupRun>>>,
    metadata_dir: PathBuf,
}

impl BackupRegistry {
    /// Create a registry rooted at `metadata_dir`, loading any existing
    /// entries found there.
    pub async fn open(metadata_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&metadata_dir).await?;
        let mut entries = HashMap::new();

        let mut dir = tokio::fs::read_dir(&metadata_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            if let Ok(run) = serde_json::from_slice::<BackupRun>(&bytes) {
                entries.insert(run.backup_id.clone(), run);
            }
        }

        Ok(Self {
            entries: Arc::new(RwLock::new(entries)),
            metadata_dir,
        })
    }

    /// Insert or overwrite a run and mirror it to disk.
    pub async fn put(&self, run: BackupRun) -> Result<()> {
        let path = self.sidecar_path(&run.backup_id);
        let bytes = serde_json::to_vec_pretty(&run)?;
        tokio::fs::write(&path, bytes).await?;

        let mut entries = self.entries.write().await;
        entries.insert(run.backup_id.clone(), run);
        Ok(())
    }

    /// Apply `mutate` to the stored run for `backup_id`, persisting the result.
    pub async fn update<F>(&self, backup_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut BackupRun),
    {
        let mut entries = self.entries.write().await;
        let run = entries
            .get_mut(backup_id)
            .ok_or_else(|| BackupError::NotFound(backup_id.to_string()))?;
        mutate(run);

        let bytes = serde_json::to_vec_pretty(run)?;
        let path = self.sidecar_path(backup_id);
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    /// Fetch one run by id.
    pub async fn get(&self, backup_id: &str) -> Result<BackupRun> {
        let entries = self.entries.read().await;
        entries
            .get(backup_id)
            .cloned()
            .ok_or_else(|| BackupError::NotFound(backup_id.to_string()))
    }

    /// Most recent `limit` runs, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<BackupRun> {
        let entries = self.entries.read().await;
        let mut runs: Vec<_> = entries.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        runs
    }

    /// All runs of a given type, newest first.
    pub async fn by_type(&self, run_type: BackupType) -> Vec<BackupRun> {
        let entries = self.entries.read().await;
        let mut runs: Vec<_> = entries
            .values()
            .filter(|r| r.run_type == run_type)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    /// Statistics for runs of `run_type` started within `[since, now)`.
    pub async fn statistics(
        &self,
        run_type: BackupType,
        since: chrono::DateTime<chrono::Utc>,
    ) -> RunStatistics {
        let entries = self.entries.read().await;
        let runs: Vec<_> = entries
            .values()
            .filter(|r| r.run_type == run_type && r.started_at >= since)
            .collect();

        let count = runs.len() as u64;
        let completed: Vec<_> = runs
            .iter()
            .filter(|r| r.status == RunStatus::Completed)
            .collect();
        let success_count = completed.len() as u64;

        let average_size = if completed.is_empty() {
            0.0
        } else {
            completed.iter().map(|r| r.total_size as f64).sum::<f64>() / completed.len() as f64
        };

        let average_duration_secs = if completed.is_empty() {
            0.0
        } else {
            completed
                .iter()
                .filter_map(|r| r.ended_at.map(|e| (e - r.started_at).num_seconds() as f64))
                .sum::<f64>()
                / completed.len() as f64
        };

        RunStatistics {
            count,
            success_count,
            average_size,
            average_duration_secs,
        }
    }

    /// Runs whose retention horizon has passed but have not yet been
    /// marked `deletedAt`.
    pub async fn expired(&self, now: chrono::DateTime<chrono::Utc>) -> Vec<BackupRun> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|r| {
                r.retention
                    .as_ref()
                    .is_some_and(|ret| ret.expires_at <= now && ret.deleted_at.is_none())
            })
            .cloned()
            .collect()
    }

    fn sidecar_path(&self, backup_id: &str) -> PathBuf {
        self.metadata_dir.join(format!("{backup_id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> RunMetadata {
        RunMetadata {
            hostname: "test-host".to_string(),
            platform: "linux".to_string(),
            runtime_version: "1.0".to_string(),
            tool_version: "0.1.0".to_string(),
        }
    }

    #[tokio::test]
    async fn put_get_and_update_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BackupRegistry::open(dir.path().to_path_buf()).await.unwrap();

        let mut run = BackupRun::start(
            "daily-backup-2026-07-28T02-30-00".to_string(),
            BackupType::Daily,
            BackupTrigger::Scheduled,
            None,
            metadata(),
        );
        run.complete(PathBuf::from("daily/run.tar.gz.enc"), 1024);
        registry.put(run.clone()).await.unwrap();

        let fetched = registry.get(&run.backup_id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Completed);

        registry
            .update(&run.backup_id, |r| r.mark_as_verified(Verdict::Good, vec![]))
            .await
            .unwrap();
        let verified = registry.get(&run.backup_id).await.unwrap();
        assert!(verified.verification.verified);
    }

    #[tokio::test]
    async fn reopening_reloads_entries_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = BackupRegistry::open(dir.path().to_path_buf()).await.unwrap();
            let run = BackupRun::start(
                "daily-backup-1".to_string(),
                BackupType::Daily,
                BackupTrigger::Scheduled,
                None,
                metadata(),
            );
            registry.put(run).await.unwrap();
        }

        let reopened = BackupRegistry::open(dir.path().to_path_buf()).await.unwrap();
        assert!(reopened.get("daily-backup-1").await.is_ok());
    }

    #[tokio::test]
    async fn expired_only_returns_runs_past_horizon_without_deleted_at() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BackupRegistry::open(dir.path().to_path_buf()).await.unwrap();

        let now = chrono::Utc::now();
        let mut expired_run = BackupRun::start(
            "daily-backup-old".to_string(),
            BackupType::Daily,
            BackupTrigger::Scheduled,
            None,
            metadata(),
        );
        expired_run.retention = Some(RetentionState {
            policy: RetentionPolicy::Daily,
            expires_at: now - chrono::Duration::days(1),
            deleted_at: None,
        });
        registry.put(expired_run).await.unwrap();

        let mut fresh_run = BackupRun::start(
            "daily-backup-new".to_string(),
            BackupType::Daily,
            BackupTrigger::Scheduled,
            None,
            metadata(),
        );
        fresh_run.retention = Some(RetentionState {
            policy: RetentionPolicy::Daily,
            expires_at: now + chrono::Duration::days(1),
            deleted_at: None,
        });
        registry.put(fresh_run).await.unwrap();

        let expired = registry.expired(now).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].backup_id, "daily-backup-old");
    }
}
