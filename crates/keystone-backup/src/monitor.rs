//! Monitor: computes a health report from the last 7 days of registry
//! entries and current cloud state, and emits classified alerts (§4.J).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registry::{BackupRegistry, BackupType, RunStatus};
use crate::storage::StorageBackend;

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Within all thresholds.
    Healthy,
    /// One or more warning-level thresholds crossed.
    Warning,
    /// One or more critical-level thresholds crossed.
    Critical,
}

/// Priority an alert is emitted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPriority {
    /// Informational, no action required.
    System,
    /// Needs attention but not urgent.
    Warning,
    /// Needs immediate attention.
    Critical,
}

/// Health report covering the last 7 days of registry entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,
    /// Hours since the last completed run, if any exists.
    pub hours_since_last_successful: Option<f64>,
    /// Fraction of runs in the window that failed, 0.0..=1.0.
    pub failure_rate: f64,
    /// Count of failed runs in the last 24 hours.
    pub failures_last_24h: u64,
    /// Size in bytes of the most recent successful run, if any.
    pub last_successful_size: Option<u64>,
    /// Number of objects in cloud storage, when cloud replication is enabled.
    pub cloud_object_count: Option<u64>,
    /// Individual conditions that contributed to `status`, for the daily report.
    pub reasons: Vec<String>,
}

/// Capability set for delivering alerts, implemented per notification
/// backend (email, Slack, PagerDuty, ...) and selected by configuration.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one alert.
    async fn send(&self, subject: &str, body: &str, priority: AlertPriority) -> Result<()>;
}

/// Computes health reports and drives alerting off the backup registry and
/// (optionally) cloud storage state.
pub struct HealthMonitor {
    registry: std::sync::Arc<BackupRegistry>,
    storage: Option<std::sync::Arc<dyn StorageBackend>>,
    notifier: Option<std::sync::Arc<dyn Notifier>>,
    cloud_enabled: bool,
}

impl HealthMonitor {
    /// Construct a monitor from its collaborators.
    pub fn new(
        registry: std::sync::Arc<BackupRegistry>,
        storage: Option<std::sync::Arc<dyn StorageBackend>>,
        notifier: Option<std::sync::Arc<dyn Notifier>>,
        cloud_enabled: bool,
    ) -> Self {
        Self {
            registry,
            storage,
            notifier,
            cloud_enabled,
        }
    }

    /// Compute the current health report from the last 7 days of entries
    /// across every run type, applying the thresholds from §4.J.
    pub async fn health_report(&self) -> Result<HealthReport> {
        let now = chrono::Utc::now();
        let window_start = now - chrono::Duration::days(7);

        let mut runs = Vec::new();
        for run_type in [
            BackupType::Daily,
            BackupType::Weekly,
            BackupType::Monthly,
            BackupType::Emergency,
        ] {
            runs.extend(self.registry.by_type(run_type).await);
        }
        runs.retain(|r| r.started_at >= window_start);

        let total = runs.len() as f64;
        let failed: Vec<_> = runs.iter().filter(|r| r.status == RunStatus::Failed).collect();
        let failure_rate = if total > 0.0 { failed.len() as f64 / total } else { 0.0 };

        let failures_last_24h = failed
            .iter()
            .filter(|r| r.started_at >= now - chrono::Duration::hours(24))
            .count() as u64;

        let last_successful = runs
            .iter()
            .filter(|r| r.status == RunStatus::Completed)
            .max_by_key(|r| r.started_at);

        let hours_since_last_successful = last_successful
            .map(|r| (now - r.started_at).num_minutes() as f64 / 60.0);

        let last_successful_size = last_successful.map(|r| r.total_size);

        let cloud_object_count = if self.cloud_enabled {
            match &self.storage {
                Some(storage) => storage.stats().await.ok().map(|s| s.count),
                None => Some(0),
            }
        } else {
            None
        };

        let mut reasons = Vec::new();
        let mut status = HealthStatus::Healthy;

        let stale_critical = hours_since_last_successful.is_some_and(|h| h > 26.0);
        let failure_rate_critical = failure_rate > 0.30;
        let failures_critical = failures_last_24h > 3;
        let cloud_empty_critical = self.cloud_enabled && cloud_object_count == Some(0);

        if stale_critical {
            reasons.push("no successful backup in over 26 hours".to_string());
        }
        if failure_rate_critical {
            reasons.push(format!("failure rate {:.0}% exceeds 30%", failure_rate * 100.0));
        }
        if failures_critical {
            reasons.push(format!("{failures_last_24h} failures in the last 24 hours"));
        }
        if cloud_empty_critical {
            reasons.push("cloud replication enabled but 0 objects in storage".to_string());
        }

        if stale_critical || failure_rate_critical || failures_critical || cloud_empty_critical {
            status = HealthStatus::Critical;
        } else {
            let stale_warning = hours_since_last_successful.is_some_and(|h| h > 24.0);
            let failure_rate_warning = failure_rate > 0.10;
            let size_warning = last_successful_size.is_some_and(|s| s < 1024 * 1024);

            if stale_warning {
                reasons.push("no successful backup in over 24 hours".to_string());
            }
            if failure_rate_warning {
                reasons.push(format!("failure rate {:.0}% exceeds 10%", failure_rate * 100.0));
            }
            if size_warning {
                reasons.push("most recent successful backup is under 1 MiB".to_string());
            }

            if stale_warning || failure_rate_warning || size_warning {
                status = HealthStatus::Warning;
            }
        }

        Ok(HealthReport {
            status,
            hours_since_last_successful,
            failure_rate,
            failures_last_24h,
            last_successful_size,
            cloud_object_count,
            reasons,
        })
    }

    /// Compute the health report and, if its status is not healthy, emit an
    /// alert through the configured notifier.
    pub async fn check_and_alert(&self) -> Result<HealthReport> {
        let report = self.health_report().await?;
        if report.status == HealthStatus::Healthy {
            return Ok(report);
        }

        let priority = match report.status {
            HealthStatus::Critical => AlertPriority::Critical,
            HealthStatus::Warning => AlertPriority::Warning,
            HealthStatus::Healthy => AlertPriority::System,
        };

        if let Some(notifier) = &self.notifier {
            let subject = format!("backup health: {:?}", report.status);
            let body = report.reasons.join("; ");
            notifier.send(&subject, &body, priority).await?;
        }

        Ok(report)
    }

    /// Emit one alert through the configured notifier, if any. Shared by
    /// any job that needs to raise an alert outside of `check_and_alert`'s
    /// own registry-derived health report (e.g. the weekly corruption
    /// sweep in §4.I).
    pub async fn alert(&self, subject: &str, body: &str, priority: AlertPriority) -> Result<()> {
        if let Some(notifier) = &self.notifier {
            notifier.send(subject, body, priority).await?;
        }
        Ok(())
    }

    /// Generate a plain-text daily report summarizing the previous day's
    /// runs across all types.
    pub async fn daily_report(&self) -> String {
        let now = chrono::Utc::now();
        let since = now - chrono::Duration::hours(24);

        let mut lines = vec![format!("Backup daily report for {}", now.format("%Y-%m-%d"))];
        for run_type in [
            BackupType::Daily,
            BackupType::Weekly,
            BackupType::Monthly,
            BackupType::Emergency,
        ] {
            let stats = self.registry.statistics(run_type, since).await;
            if stats.count == 0 {
                continue;
            }
            lines.push(format!(
                "{run_type:?}: {} runs, {} succeeded, avg size {:.0} bytes, avg duration {:.0}s",
                stats.count, stats.success_count, stats.average_size, stats.average_duration_secs
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BackupTrigger, RunMetadata};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn metadata() -> RunMetadata {
        RunMetadata {
            hostname: "h".to_string(),
            platform: "linux".to_string(),
            runtime_version: "1".to_string(),
            tool_version: "0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn healthy_when_recent_success_and_no_failures() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(BackupRegistry::open(dir.path().to_path_buf()).await.unwrap());

        let mut run = crate::registry::BackupRun::start(
            "daily-backup-ok".to_string(),
            BackupType::Daily,
            BackupTrigger::Scheduled,
            None,
            metadata(),
        );
        run.complete(PathBuf::from("ok.tar.gz.enc"), 5 * 1024 * 1024);
        registry.put(run).await.unwrap();

        let monitor = HealthMonitor::new(registry, None, None, false);
        let report = monitor.health_report().await.unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn critical_when_no_successful_backup_ever() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(BackupRegistry::open(dir.path().to_path_buf()).await.unwrap());

        for i in 0..4 {
            let mut run = crate::registry::BackupRun::start(
                format!("daily-backup-fail-{i}"),
                BackupType::Daily,
                BackupTrigger::Scheduled,
                None,
                metadata(),
            );
            run.fail("export failed");
            registry.put(run).await.unwrap();
        }

        let monitor = HealthMonitor::new(registry, None, None, false);
        let report = monitor.health_report().await.unwrap();
        assert_eq!(report.status, HealthStatus::Critical);
        assert!(report.failures_last_24h > 3 || report.failure_rate > 0.30);
    }

    #[tokio::test]
    async fn cloud_enabled_with_zero_objects_is_critical() {
        struct ZeroObjectStorage;
        #[async_trait]
        impl StorageBackend for ZeroObjectStorage {
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
            async fn delete(&self, _: &str) -> Result<()> {
                unreachable!()
            }
            async fn list(&self, _: &str) -> Result<Vec<crate::storage::ObjectEntry>> {
                Ok(vec![])
            }
            async fn test_connection(&self) -> bool {
                true
            }
            async fn stats(&self) -> Result<crate::storage::StorageStats> {
                Ok(crate::storage::StorageStats::default())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(BackupRegistry::open(dir.path().to_path_buf()).await.unwrap());
        let mut run = crate::registry::BackupRun::start(
            "daily-backup-ok".to_string(),
            BackupType::Daily,
            BackupTrigger::Scheduled,
            None,
            metadata(),
        );
        run.complete(PathBuf::from("ok.tar.gz.enc"), 5 * 1024 * 1024);
        registry.put(run).await.unwrap();

        let monitor = HealthMonitor::new(registry, Some(Arc::new(ZeroObjectStorage)), None, true);
        let report = monitor.health_report().await.unwrap();
        assert_eq!(report.status, HealthStatus::Critical);
    }
}
