//! Tenant state machine driven by validation outcomes (§4.L).
//!
//! This crate does not own tenant records — they live in an external
//! tenant store, consumed here through the narrow [`TenantStateStore`]
//! capability set, per the design notes' guidance against duck-typed
//! provider objects. The table below is normative:
//!
//! | From \ Event | valid-online | invalid-online (expired/revoked) | unreachable |
//! |---|---|---|---|
//! | active | active | suspended | active (may enter offline-mode) |
//! | suspended | active | suspended | suspended |

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A tenant's availability state, as driven by license validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantAvailability {
    /// Tenant may use the application.
    Active,
    /// Tenant is blocked pending a valid license.
    Suspended,
}

/// Why a tenant was suspended, carried into the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuspensionReason {
    /// The authority reported the license past its expiry date.
    LicenseExpired,
    /// The authority reported the license revoked.
    LicenseRevoked,
}

impl SuspensionReason {
    /// Map an authority validate-response error code to a suspension
    /// reason, if it is one this state machine acts on.
    pub fn from_authority_error(error: &str) -> Option<Self> {
        match error {
            "LICENSE_EXPIRED" => Some(Self::LicenseExpired),
            "LICENSE_REVOKED" => Some(Self::LicenseRevoked),
            _ => None,
        }
    }
}

/// Capability set for mutating tenant availability, implemented by
/// whatever owns the HR-domain tenant store (out of scope for this crate;
/// see §1).
#[async_trait]
pub trait TenantStateStore: Send + Sync {
    /// Current availability of `tenant_id`, if the tenant is known.
    async fn current_state(&self, tenant_id: &str) -> Result<Option<TenantAvailability>>;

    /// Transition `tenant_id` from `suspended` to `active`, auditing `cause`.
    async fn reactivate(&self, tenant_id: &str, cause: &str) -> Result<()>;

    /// Transition `tenant_id` from `active` to `suspended`, auditing
    /// `cause` and `reason`.
    async fn suspend(&self, tenant_id: &str, reason: SuspensionReason, cause: &str) -> Result<()>;
}

/// Apply a validation verdict's tenant-level consequence, per the state
/// table above. `was_suspended` reflects the tenant's availability
/// immediately before this verdict; callers fetch it from
/// [`TenantStateStore::current_state`] before calling [`crate::validation`].
pub async fn apply_online_verdict(
    tenant_store: &dyn TenantStateStore,
    tenant_id: &str,
    was_suspended: bool,
    valid: bool,
    authority_error: Option<&str>,
    cause: &str,
) -> Result<()> {
    if valid {
        if was_suspended {
            tenant_store.reactivate(tenant_id, cause).await?;
        }
        return Ok(());
    }

    if let Some(reason) = authority_error.and_then(SuspensionReason::from_authority_error) {
        if !was_suspended {
            tenant_store.suspend(tenant_id, reason, cause).await?;
        }
    }
    Ok(())
}

/// A [`TenantStateStore`] backed by a single JSON file, one entry per
/// tenant. Suitable for a single-process deployment or local development;
/// the HR-domain tenant store a real deployment plugs in here is out of
/// scope for this crate (§1).
pub struct FileTenantStore {
    path: PathBuf,
    state: Mutex<HashMap<String, TenantAvailability>>,
}

impl FileTenantStore {
    /// Load (or initialize empty) tenant state from `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &HashMap<String, TenantAvailability>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

#[async_trait]
impl TenantStateStore for FileTenantStore {
    async fn current_state(&self, tenant_id: &str) -> Result<Option<TenantAvailability>> {
        Ok(self.state.lock().unwrap().get(tenant_id).copied())
    }

    async fn reactivate(&self, tenant_id: &str, cause: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.insert(tenant_id.to_string(), TenantAvailability::Active);
        tracing::info!(tenant_id, cause, "tenant reactivated");
        self.persist(&state)
    }

    async fn suspend(&self, tenant_id: &str, reason: SuspensionReason, cause: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.insert(tenant_id.to_string(), TenantAvailability::Suspended);
        tracing::warn!(tenant_id, cause, ?reason, "tenant suspended");
        self.persist(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        state: Mutex<Option<TenantAvailability>>,
        reactivated: Mutex<Vec<String>>,
        suspended: Mutex<Vec<(String, SuspensionReason)>>,
    }

    #[async_trait]
    impl TenantStateStore for RecordingStore {
        async fn current_state(&self, _tenant_id: &str) -> Result<Option<TenantAvailability>> {
            Ok(*self.state.lock().unwrap())
        }

        async fn reactivate(&self, tenant_id: &str, _cause: &str) -> Result<()> {
            *self.state.lock().unwrap() = Some(TenantAvailability::Active);
            self.reactivated.lock().unwrap().push(tenant_id.to_string());
            Ok(())
        }

        async fn suspend(&self, tenant_id: &str, reason: SuspensionReason, _cause: &str) -> Result<()> {
            *self.state.lock().unwrap() = Some(TenantAvailability::Suspended);
            self.suspended
                .lock()
                .unwrap()
                .push((tenant_id.to_string(), reason));
            Ok(())
        }
    }

    #[tokio::test]
    async fn valid_verdict_reactivates_a_suspended_tenant() {
        let store = RecordingStore::default();
        apply_online_verdict(&store, "tenant-a", true, true, None, "sync recovered")
            .await
            .unwrap();
        assert_eq!(store.reactivated.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn valid_verdict_on_already_active_tenant_is_a_no_op() {
        let store = RecordingStore::default();
        apply_online_verdict(&store, "tenant-a", false, true, None, "routine check")
            .await
            .unwrap();
        assert!(store.reactivated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn revoked_verdict_suspends_an_active_tenant() {
        let store = RecordingStore::default();
        apply_online_verdict(
            &store,
            "tenant-a",
            false,
            false,
            Some("LICENSE_REVOKED"),
            "authority revoked license",
        )
        .await
        .unwrap();
        assert_eq!(
            store.suspended.lock().unwrap()[0].1,
            SuspensionReason::LicenseRevoked
        );
    }

    #[tokio::test]
    async fn unrelated_invalid_reason_does_not_suspend() {
        let store = RecordingStore::default();
        apply_online_verdict(
            &store,
            "tenant-a",
            false,
            false,
            Some("RATE_LIMITED"),
            "transient",
        )
        .await
        .unwrap();
        assert!(store.suspended.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_tenant_store_persists_transitions_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenants.json");

        let store = FileTenantStore::open(path.clone()).unwrap();
        store.suspend("tenant-a", SuspensionReason::LicenseExpired, "expired").await.unwrap();
        assert_eq!(
            store.current_state("tenant-a").await.unwrap(),
            Some(TenantAvailability::Suspended)
        );

        let reopened = FileTenantStore::open(path).unwrap();
        assert_eq!(
            reopened.current_state("tenant-a").await.unwrap(),
            Some(TenantAvailability::Suspended)
        );
    }

    #[tokio::test]
    async fn file_tenant_store_unknown_tenant_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTenantStore::open(dir.path().join("tenants.json")).unwrap();
        assert_eq!(store.current_state("unknown").await.unwrap(), None);
    }
}
