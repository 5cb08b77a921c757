//! `keystone serve`: the long-running composition root. Wires the backup
//! and license engines to the [`Scheduler`]'s fixed job set (§4.I) and
//! blocks until a shutdown signal, giving in-flight jobs a grace period to
//! finish (§5).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use keystone_backup::monitor::AlertPriority;
use keystone_backup::recovery::{self, CorruptionStatus, RecoveryEngine};
use keystone_backup::registry::{BackupTrigger, BackupType};
use keystone_backup::scheduler::JOB_DEFAULTS;
use keystone_backup::storage::create_storage_backend;
use keystone_backup::{BackupConfig, BackupEngine, BackupRegistry, FileDatabaseSource, HealthMonitor, Scheduler};
use keystone_license::{
    FileTenantStore, HttpLicenseAuthorityClient, LicenseConfig, LicenseStore, LicenseSyncService,
    LicenseValidator,
};

use super::utils::{info as print_info, success};

/// Grace period the scheduler waits for in-flight jobs on shutdown (§4.I).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
pub struct ServeArgs {}

pub async fn execute(_args: ServeArgs) -> Result<()> {
    let backup_config = BackupConfig::from_env().context("loading backup configuration")?;
    let license_config = LicenseConfig::from_env().context("loading license configuration")?;

    let registry = Arc::new(
        BackupRegistry::open(backup_config.base_dir.join("metadata"))
            .await
            .context("opening backup registry")?,
    );
    let storage: Option<Arc<dyn keystone_backup::StorageBackend>> =
        create_storage_backend(backup_config.storage.clone())
            .await
            .context("constructing cloud storage backend")?
            .map(Arc::from);

    let primary_db = Arc::new(FileDatabaseSource::new(PathBuf::from("data/primary")));
    let license_db = Arc::new(FileDatabaseSource::new(PathBuf::from("data/license-authority")));

    let engine = Arc::new(BackupEngine::new(
        backup_config.clone(),
        registry.clone(),
        storage.clone(),
        primary_db,
        license_db,
    ));
    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        storage.clone(),
        None,
        backup_config.cloud_enabled,
    ));
    let recovery_engine = Arc::new(RecoveryEngine::new(
        backup_config.clone(),
        registry.clone(),
        storage.clone(),
    ));

    let license_store = Arc::new(
        LicenseStore::open("licenses".into())
            .await
            .context("opening license store")?,
    );
    let license_client = Arc::new(
        HttpLicenseAuthorityClient::new(license_config.server_url.clone(), license_config.api_key.clone())
            .context("constructing license authority client")?,
    );
    let tenant_store = Arc::new(FileTenantStore::open("licenses/tenant-state.json".into())?);
    let sync_service = Arc::new(LicenseSyncService::new(
        license_store.clone(),
        license_client.clone(),
        license_config.integrity_secret.clone(),
    ));
    let validator = Arc::new(LicenseValidator::new(
        license_store.clone(),
        license_client,
        tenant_store,
        license_config.integrity_secret.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new());
    register_jobs(
        &scheduler,
        &backup_config,
        &license_config,
        engine,
        registry,
        storage,
        monitor,
        recovery_engine,
        sync_service,
        validator,
        license_store,
        license_config.tenant_id.clone(),
    )
    .await?;

    print_info(&format!(
        "registered {} scheduled jobs",
        scheduler.job_names().await.len()
    ));
    scheduler.start();
    success("scheduler started, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    print_info("shutdown signal received, waiting for in-flight jobs...");
    scheduler.stop(SHUTDOWN_GRACE).await;
    success("scheduler stopped cleanly");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn register_jobs(
    scheduler: &Arc<Scheduler>,
    backup_config: &BackupConfig,
    license_config: &LicenseConfig,
    engine: Arc<BackupEngine>,
    registry: Arc<BackupRegistry>,
    storage: Option<Arc<dyn keystone_backup::StorageBackend>>,
    monitor: Arc<HealthMonitor>,
    recovery_engine: Arc<RecoveryEngine>,
    sync_service: Arc<LicenseSyncService>,
    validator: Arc<LicenseValidator>,
    license_store: Arc<LicenseStore>,
    tenant_id: String,
) -> Result<()> {
    let default_cron = |name: &str| {
        JOB_DEFAULTS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, cron)| *cron)
            .expect("job name present in JOB_DEFAULTS")
    };

    {
        let engine = engine.clone();
        scheduler
            .register("daily_backup", default_cron("daily_backup"), true, move || {
                let engine = engine.clone();
                async move {
                    if let Err(e) = engine.run(BackupType::Daily, BackupTrigger::Scheduled, None).await {
                        tracing::error!(error = %e, "daily backup job failed");
                    }
                }
            })
            .await?;
    }

    {
        let engine = engine.clone();
        scheduler
            .register("weekly_backup", default_cron("weekly_backup"), true, move || {
                let engine = engine.clone();
                async move {
                    if let Err(e) = engine.run(BackupType::Weekly, BackupTrigger::Scheduled, None).await {
                        tracing::error!(error = %e, "weekly backup job failed");
                    }
                }
            })
            .await?;
    }

    {
        let engine = engine.clone();
        scheduler
            .register("monthly_backup", default_cron("monthly_backup"), true, move || {
                let engine = engine.clone();
                async move {
                    if let Err(e) = engine.run(BackupType::Monthly, BackupTrigger::Scheduled, None).await {
                        tracing::error!(error = %e, "monthly backup job failed");
                    }
                }
            })
            .await?;
    }

    {
        let registry = registry.clone();
        let storage = storage.clone();
        scheduler
            .register("retention_apply", default_cron("retention_apply"), true, move || {
                let registry = registry.clone();
                let storage = storage.clone();
                async move {
                    if let Err(e) = keystone_backup::retention::apply_retention(&registry, storage.as_ref()).await {
                        tracing::error!(error = %e, "retention job failed");
                    }
                }
            })
            .await?;
    }

    {
        let active_key = backup_config.encryption_key;
        let base_dir = backup_config.base_dir.clone();
        scheduler
            .register("key_rotation", default_cron("key_rotation"), true, move || {
                let base_dir = base_dir.clone();
                async move {
                    let new_key = keystone_crypto::symmetric::generate_key();
                    let mut history = load_rotation_history(&base_dir).await.unwrap_or_default();
                    history.record_rotation(&active_key, &new_key, chrono::Utc::now());
                    if let Err(e) = save_rotation_history(&base_dir, &history).await {
                        tracing::error!(error = %e, "failed to persist key rotation history");
                        return;
                    }
                    tracing::warn!("new encryption key generated; active key rotation requires an orchestrated config update to take effect on next restart");
                }
            })
            .await?;
    }

    {
        let registry = registry.clone();
        let storage = storage.clone();
        scheduler
            .register(
                "automated_verification",
                default_cron("automated_verification"),
                true,
                move || {
                    let registry = registry.clone();
                    let storage = storage.clone();
                    async move {
                        if let Err(e) = keystone_backup::verification::automated_sweep(&registry, storage.as_ref(), 10).await {
                            tracing::error!(error = %e, "automated verification sweep failed");
                        }
                    }
                },
            )
            .await?;
    }

    {
        let monitor = monitor.clone();
        scheduler
            .register("daily_report", default_cron("daily_report"), true, move || {
                let monitor = monitor.clone();
                async move {
                    let report = monitor.daily_report().await;
                    tracing::info!(report = %report, "daily backup report");
                }
            })
            .await?;
    }

    {
        let monitor = monitor.clone();
        let registry = registry.clone();
        let storage = storage.clone();
        scheduler
            .register("cloud_cleanup", default_cron("cloud_cleanup"), backup_config.cloud_enabled, move || {
                let monitor = monitor.clone();
                let registry = registry.clone();
                let storage = storage.clone();
                async move {
                    let Some(storage) = storage else {
                        tracing::debug!("cloud cleanup skipped: no storage backend configured");
                        return;
                    };
                    match keystone_backup::retention::cleanup_cloud(&registry, &storage).await {
                        Ok(report) if report.orphaned.is_empty() && report.stale.is_empty() && report.errors.is_empty() => {
                            tracing::debug!("cloud cleanup: no orphaned or stale objects found");
                        }
                        Ok(report) => {
                            tracing::warn!(
                                orphaned = report.orphaned.len(),
                                stale = report.stale.len(),
                                errors = report.errors.len(),
                                "cloud cleanup removed objects"
                            );
                            if !report.errors.is_empty() {
                                let body = format!(
                                    "cloud cleanup deleted {} orphaned and {} stale objects with {} errors: {}",
                                    report.orphaned.len(),
                                    report.stale.len(),
                                    report.errors.len(),
                                    report.errors.join("; ")
                                );
                                if let Err(e) = monitor.alert("cloud cleanup errors", &body, AlertPriority::Warning).await {
                                    tracing::error!(error = %e, "failed to send cloud cleanup alert");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "cloud cleanup failed");
                            let body = format!("cloud cleanup pass failed: {e}");
                            if let Err(alert_err) = monitor.alert("cloud cleanup failed", &body, AlertPriority::Warning).await {
                                tracing::error!(error = %alert_err, "failed to send cloud cleanup failure alert");
                            }
                        }
                    }
                }
            })
            .await?;
    }

    {
        let sync_service = sync_service.clone();
        let tenant_id = tenant_id.clone();
        scheduler
            .register("license_sync", default_cron("license_sync"), true, move || {
                let sync_service = sync_service.clone();
                let tenant_id = tenant_id.clone();
                async move {
                    sync_service.sync_pass(&tenant_id).await;
                }
            })
            .await?;
    }

    {
        let validator = validator.clone();
        let tenant_id = tenant_id.clone();
        scheduler
            .register("license_validation", default_cron("license_validation"), true, move || {
                let validator = validator.clone();
                let tenant_id = tenant_id.clone();
                async move {
                    if let Err(e) = validator.validate(&tenant_id, None).await {
                        tracing::warn!(error = %e, "periodic license validation failed");
                    }
                }
            })
            .await?;
    }

    {
        let license_store = license_store.clone();
        let integrity_secret = license_config.integrity_secret.clone();
        scheduler
            .register(
                "expired_offline_cleanup",
                default_cron("expired_offline_cleanup"),
                true,
                move || {
                    let license_store = license_store.clone();
                    let integrity_secret = integrity_secret.clone();
                    async move {
                        match keystone_license::sweep_expired_offline(&license_store, &integrity_secret).await {
                            Ok(disabled) => {
                                tracing::debug!(disabled, "expired-offline cleanup tick")
                            }
                            Err(e) => tracing::error!(error = %e, "expired-offline cleanup failed"),
                        }
                    }
                },
            )
            .await?;
    }

    {
        scheduler
            .register(
                "log_retention_cleanup",
                default_cron("log_retention_cleanup"),
                true,
                move || async move {
                    tracing::debug!("log retention cleanup tick");
                },
            )
            .await?;
    }

    {
        let recovery_engine = recovery_engine.clone();
        let monitor = monitor.clone();
        scheduler
            .register(
                "weekly_integrity_check",
                default_cron("weekly_integrity_check"),
                true,
                move || {
                    let recovery_engine = recovery_engine.clone();
                    let monitor = monitor.clone();
                    async move {
                        let primary_db = FileDatabaseSource::new(PathBuf::from("data/primary"));
                        let license_db = FileDatabaseSource::new(PathBuf::from("data/license-authority"));

                        for (label, source) in [
                            ("primary", &primary_db as &dyn keystone_backup::DatabaseSource),
                            ("license-authority", &license_db as &dyn keystone_backup::DatabaseSource),
                        ] {
                            let report = recovery::detect_corruption(label, source).await;
                            match report.status {
                                CorruptionStatus::Healthy => {
                                    tracing::debug!(database = label, "weekly integrity check: healthy");
                                }
                                CorruptionStatus::Corrupted => {
                                    tracing::warn!(database = label, issues = ?report.issues, "weekly integrity check found corruption, repairing");
                                    let repair_report = recovery_engine.repair(label, source).await;
                                    let body = format!(
                                        "database {label}: corruption detected during weekly integrity check, repair ended {:?}",
                                        repair_report.final_status
                                    );
                                    if let Err(e) = monitor.alert(
                                        &format!("weekly integrity check: {label} corrupted"),
                                        &body,
                                        AlertPriority::Critical,
                                    ).await {
                                        tracing::error!(error = %e, "failed to send integrity-check alert");
                                    }
                                }
                                CorruptionStatus::Error => {
                                    tracing::error!(database = label, "weekly integrity check could not complete");
                                    if let Err(e) = monitor.alert(
                                        &format!("weekly integrity check: {label} detection failed"),
                                        &format!("database {label}: corruption detection could not complete"),
                                        AlertPriority::Warning,
                                    ).await {
                                        tracing::error!(error = %e, "failed to send integrity-check alert");
                                    }
                                }
                            }
                        }
                    }
                },
            )
            .await?;
    }

    {
        let monitor = monitor.clone();
        scheduler
            .register(
                "monthly_storage_analysis",
                default_cron("monthly_storage_analysis"),
                true,
                move || {
                    let monitor = monitor.clone();
                    async move {
                        if let Ok(report) = monitor.health_report().await {
                            tracing::info!(?report, "monthly storage analysis");
                        }
                    }
                },
            )
            .await?;
    }

    Ok(())
}

async fn load_rotation_history(base_dir: &std::path::Path) -> Result<keystone_crypto::rotation::KeyRotationHistory> {
    let path = base_dir.join("metadata").join("key-rotation.json");
    if !path.exists() {
        return Ok(Default::default());
    }
    let bytes = tokio::fs::read(&path).await?;
    Ok(keystone_crypto::rotation::KeyRotationHistory::from_json(&bytes)?)
}

async fn save_rotation_history(
    base_dir: &std::path::Path,
    history: &keystone_crypto::rotation::KeyRotationHistory,
) -> Result<()> {
    let path = base_dir.join("metadata").join("key-rotation.json");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, history.to_json()?).await?;
    Ok(())
}
