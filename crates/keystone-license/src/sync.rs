//! License sync pass (§4.L).
//!
//! A sync pass fetches each known tenant's license from the authority and
//! folds the result into that tenant's [`crate::record::LicenseRecord`].
//! Only one sync may be in flight per process (§5); [`LicenseSyncService`]
//! enforces that with a single `tokio::sync::Mutex<()>` guard rather than a
//! queue, matching the scheduler's "drop, don't queue beyond depth 1" rule
//! for every other job kind.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::client::{CompanyLicenseResponse, LicenseAuthorityClient};
use crate::error::Result;
use crate::record::{LicenseRecord, LicenseStatus, LicenseType, QuickAccess, SyncOutcome};
use crate::store::LicenseStore;

/// Consecutive sync failures after which offline mode is auto-enabled (§4.L).
pub const OFFLINE_ENABLE_THRESHOLD: u32 = 3;
/// Grace period granted when offline mode auto-enables, in hours.
pub const OFFLINE_GRACE_PERIOD_HOURS: i64 = 72;
/// Ceiling on `sync.retry_count`; records at or past this are skipped by a
/// sweep until their next scheduled attempt.
pub const MAX_RETRY_COUNT: u32 = 5;

/// Orchestrates sync passes against the authority for every locally known
/// tenant, plus first-sync for a tenant with no local record yet.
pub struct LicenseSyncService {
    store: Arc<LicenseStore>,
    client: Arc<dyn LicenseAuthorityClient>,
    secret: String,
    in_flight: Mutex<()>,
}

impl LicenseSyncService {
    /// Construct a sync service over `store`, talking to `client`, sealing
    /// records with `secret` (`INTEGRITY_SECRET`).
    pub fn new(store: Arc<LicenseStore>, client: Arc<dyn LicenseAuthorityClient>, secret: String) -> Self {
        Self {
            store,
            client,
            secret,
            in_flight: Mutex::new(()),
        }
    }

    /// Run one sync pass: attempt every tenant with `sync.retry_count <
    /// MAX_RETRY_COUNT` plus `bootstrap_tenant_id` if it has no local
    /// record yet (first sync on startup). Returns `false` without doing
    /// anything if a sync is already in flight.
    pub async fn sync_pass(&self, bootstrap_tenant_id: &str) -> bool {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::warn!("sync pass dropped: previous pass still in flight");
            return false;
        };

        let mut tenants = self.store.tenant_ids();
        if !self.store.contains(bootstrap_tenant_id) {
            tenants.push(bootstrap_tenant_id.to_string());
        }

        for tenant_id in tenants {
            if let Err(e) = self.sync_tenant(&tenant_id).await {
                tracing::error!(tenant_id = %tenant_id, error = %e, "license sync failed");
            }
        }
        true
    }

    /// Fetch and fold one tenant's license from the authority, recording
    /// the outcome and auto-enabling offline mode after
    /// [`OFFLINE_ENABLE_THRESHOLD`] consecutive failures.
    pub async fn sync_tenant(&self, tenant_id: &str) -> Result<()> {
        let _lock = self.store.with_tenant_lock(tenant_id).await;

        match self.client.fetch_company_license(tenant_id).await {
            Ok(response) => self.apply_success(tenant_id, response).await,
            Err(e) => self.apply_failure(tenant_id, e.to_string()).await,
        }
    }

    async fn apply_success(&self, tenant_id: &str, response: CompanyLicenseResponse) -> Result<()> {
        let license = response.license;
        let quick = QuickAccess {
            license_type: parse_license_type(&license.license_type),
            status: parse_license_status(&license.status),
            expires_at: license.expires_at,
            max_users: license.limits.max_users,
            enabled_modules: license.modules.into_iter().map(|m| m.module_id).collect(),
        };

        let key = keystone_crypto::symmetric::derive_key_from_passphrase(&license.encryption_key);
        let payload = serde_json::json!({
            "licenseData": {
                "licenseId": license.license_id,
                "licenseNumber": license.license_number,
            },
            "encryptionKey": license.encryption_key,
        });

        let mut record = match self.store.get(tenant_id) {
            Ok(existing) => existing,
            Err(_) => LicenseRecord::new(
                license.license_id.clone(),
                license.license_number.clone(),
                tenant_id.to_string(),
                quick.clone(),
                &self.secret,
            )?,
        };

        record.license_id = license.license_id;
        record.license_number = license.license_number;
        record.update_encrypted(&payload, quick, &key, &self.secret)?;
        record.record_sync(&SyncOutcome::Success, &self.secret)?;

        self.store.put(record).await?;
        Ok(())
    }

    async fn apply_failure(&self, tenant_id: &str, error: String) -> Result<()> {
        let Ok(mut record) = self.store.get(tenant_id) else {
            // No local record to fall back to yet; nothing to mark failed.
            return Ok(());
        };

        if record.sync.retry_count >= MAX_RETRY_COUNT {
            return Ok(());
        }

        record.record_sync(&SyncOutcome::Failure(error), &self.secret)?;

        if record.sync.failure_count >= OFFLINE_ENABLE_THRESHOLD && !record.offline.enabled {
            record.enable_offline(OFFLINE_GRACE_PERIOD_HOURS, &self.secret)?;
            tracing::warn!(
                tenant_id = %tenant_id,
                "offline mode auto-enabled after {} consecutive sync failures",
                record.sync.failure_count
            );
        }

        self.store.put(record).await?;
        Ok(())
    }
}

fn parse_license_type(s: &str) -> LicenseType {
    match s {
        "trial" => LicenseType::Trial,
        "starter" => LicenseType::Starter,
        "professional" => LicenseType::Professional,
        "unlimited" => LicenseType::Unlimited,
        _ => LicenseType::Enterprise,
    }
}

fn parse_license_status(s: &str) -> LicenseStatus {
    match s {
        "expired" => LicenseStatus::Expired,
        "suspended" => LicenseStatus::Suspended,
        "revoked" => LicenseStatus::Revoked,
        "pending" => LicenseStatus::Pending,
        _ => LicenseStatus::Active,
    }
}
