//! Runtime configuration, read from the environment (§6) with an optional
//! TOML overlay layered by `keystone-cli` — environment variables always
//! win, matching `keystone_backup::config`.

use crate::error::{LicenseError, Result};

/// Configuration for the license authority HTTP client and the local cache.
#[derive(Debug, Clone)]
pub struct LicenseConfig {
    /// Base URL of the license authority (`LICENSE_SERVER_URL`).
    pub server_url: String,
    /// Bearer/API-key credential presented to the authority
    /// (`LICENSE_SERVER_API_KEY`).
    pub api_key: String,
    /// Tenant id this process validates and syncs (`COMPANY_ID`).
    pub tenant_id: String,
    /// Process-wide secret mixed into every integrity hash
    /// (`INTEGRITY_SECRET`).
    pub integrity_secret: String,
    /// How often a sync pass runs (`LICENSE_SYNC_INTERVAL`), seconds.
    pub sync_interval_secs: u64,
    /// How often a periodic validation pass runs
    /// (`LICENSE_VALIDATION_INTERVAL`), seconds.
    pub validation_interval_secs: u64,
}

impl LicenseConfig {
    /// Build configuration from the process environment. Fails with
    /// [`LicenseError::Config`] when a required variable is absent; the
    /// scheduler refuses to register license jobs when this fails.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server_url: require_env("LICENSE_SERVER_URL")?,
            api_key: require_env("LICENSE_SERVER_API_KEY")?,
            tenant_id: require_env("COMPANY_ID")?,
            integrity_secret: require_env("INTEGRITY_SECRET")?,
            sync_interval_secs: u64_env("LICENSE_SYNC_INTERVAL", 6 * 3600),
            validation_interval_secs: u64_env("LICENSE_VALIDATION_INTERVAL", 15 * 60),
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| LicenseError::Config(format!("missing required env var {name}")))
}

fn u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
