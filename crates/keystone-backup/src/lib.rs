//! # Keystone Backup
//!
//! Backup, verification, recovery, scheduling, and health-monitoring
//! subsystem for a multi-tenant enterprise application's primary database,
//! license-authority database, uploads, configuration, and source tree.
//!
//! ## Architecture
//!
//! - [`config`]: environment-driven runtime configuration
//! - [`db_export`]: native-dump-then-document-export of a logical database
//! - [`archive`]: tar/gzip assembly of file trees and explicit files
//! - [`engine`]: the backup pipeline itself, producing one [`registry::BackupRun`]
//! - [`registry`]: the persisted, queryable log of backup runs
//! - [`retention`]: daily/weekly/monthly expiry policy and cleanup
//! - [`storage`]: pluggable S3/GCS/Azure object-store replication
//! - [`verification`]: multi-phase integrity and restoration scoring
//! - [`recovery`]: corruption detection, repair, and restore-from-backup
//! - [`scheduler`]: the cron-driven dispatcher for the fixed set of named jobs
//! - [`monitor`]: health reporting and alert notification
//!
//! ## Example
//!
//! ```rust,no_run
//! use keystone_backup::{BackupConfig, BackupEngine, BackupRegistry};
//! use keystone_backup::registry::{BackupTrigger, BackupType};
//! use std::sync::Arc;
//!
//! # async fn example() -> keystone_backup::Result<()> {
//! let config = BackupConfig::from_env()?;
//! let registry = Arc::new(BackupRegistry::open(config.base_dir.join("metadata")).await?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod archive;
pub mod config;
pub mod db_export;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod recovery;
pub mod registry;
pub mod retention;
pub mod scheduler;
pub mod storage;
pub mod verification;

pub use config::{BackupConfig, CloudProvider};
pub use db_export::{DatabaseSource, FileDatabaseSource};
pub use engine::BackupEngine;
pub use error::{BackupError, Result};
pub use monitor::{HealthMonitor, HealthReport, HealthStatus, Notifier};
pub use recovery::RecoveryEngine;
pub use registry::{BackupRegistry, BackupRun, BackupTrigger, BackupType, RunStatus};
pub use scheduler::Scheduler;
pub use storage::{StorageBackend, StorageConfig};
pub use verification::{VerificationReport, verify_backup};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
