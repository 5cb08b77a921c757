//! # Keystone License
//!
//! Per-tenant encrypted license cache, authority synchronization, and
//! online/offline validation for the Keystone multi-tenant application.
//!
//! ## Architecture
//!
//! - [`config`]: environment-driven runtime configuration
//! - [`record`]: `LicenseRecord` and its mutation paths (§3, §4.K)
//! - [`store`]: the per-tenant locked, disk-mirrored store of records
//! - [`client`]: the narrow HTTP capability set for the license authority
//! - [`sync`]: the scheduled/startup sync pass that refreshes records
//! - [`tenant`]: the tenant-availability state machine and its store
//!   capability set
//! - [`validation`]: online and offline validation, wired to [`tenant`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keystone_license::{LicenseConfig, LicenseStore, HttpLicenseAuthorityClient};
//!
//! # async fn example() -> keystone_license::Result<()> {
//! let config = LicenseConfig::from_env()?;
//! let store = Arc::new(LicenseStore::open("licenses".into()).await?);
//! let client = Arc::new(HttpLicenseAuthorityClient::new(config.server_url, config.api_key)?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod record;
pub mod store;
pub mod sync;
pub mod tenant;
pub mod validation;

pub use client::{HttpLicenseAuthorityClient, LicenseAuthorityClient};
pub use config::LicenseConfig;
pub use error::{LicenseError, Result};
pub use record::{LicenseRecord, LicenseStatus, LicenseType, QuickAccess};
pub use store::{sweep_expired_offline, LicenseStore};
pub use sync::LicenseSyncService;
pub use tenant::{FileTenantStore, SuspensionReason, TenantAvailability, TenantStateStore};
pub use validation::LicenseValidator;

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
