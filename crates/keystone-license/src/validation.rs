//! License validation: online (authority-backed) and offline (local-only),
//! plus the tenant-state consequences of each outcome (§4.L).

use std::sync::Arc;

use crate::client::{LicenseAuthorityClient, ValidateRequest};
use crate::error::Result;
use crate::record::{LicenseStatus, ValidationOutcome, ValidationResultKind};
use crate::store::LicenseStore;
use crate::tenant::{self, TenantStateStore};

/// Orchestrates validation passes against the authority or the local
/// cache, applying tenant-state transitions for online verdicts.
pub struct LicenseValidator {
    store: Arc<LicenseStore>,
    client: Arc<dyn LicenseAuthorityClient>,
    tenant_store: Arc<dyn TenantStateStore>,
    secret: String,
}

impl LicenseValidator {
    /// Construct a validator over `store`, consulting `client` for online
    /// validation and `tenant_store` for state transitions.
    pub fn new(
        store: Arc<LicenseStore>,
        client: Arc<dyn LicenseAuthorityClient>,
        tenant_store: Arc<dyn TenantStateStore>,
        secret: String,
    ) -> Self {
        Self {
            store,
            client,
            tenant_store,
            secret,
        }
    }

    /// Validate `tenant_id` against the authority. On success, the
    /// authority's verdict is authoritative: it drives the tenant-state
    /// transition table in [`crate::tenant`] and updates the local record's
    /// `quick.status` to match. Returns [`crate::error::LicenseError::Remote`]
    /// if the authority cannot be reached — callers should fall back to
    /// [`Self::validate_offline`] in that case (§4.L: "unreachable" leaves
    /// tenant state unchanged).
    pub async fn validate_online(
        &self,
        tenant_id: &str,
        usage: Option<serde_json::Value>,
    ) -> Result<ValidationOutcome> {
        let _lock = self.store.with_tenant_lock(tenant_id).await;
        let mut record = self.store.get(tenant_id)?;

        let response = self
            .client
            .validate(ValidateRequest {
                license_id: record.license_id.clone(),
                timestamp: chrono::Utc::now(),
                usage,
            })
            .await?;

        let was_suspended = self
            .tenant_store
            .current_state(tenant_id)
            .await?
            .map(|state| state == tenant::TenantAvailability::Suspended)
            .unwrap_or(false);

        let kind = if response.valid {
            record.quick.status = LicenseStatus::Active;
            ValidationResultKind::Valid
        } else {
            match response.error.as_deref() {
                Some("LICENSE_EXPIRED") => {
                    record.quick.status = LicenseStatus::Expired;
                    ValidationResultKind::Expired
                }
                Some("LICENSE_REVOKED") => {
                    record.quick.status = LicenseStatus::Revoked;
                    ValidationResultKind::Invalid
                }
                _ => ValidationResultKind::Invalid,
            }
        };
        if let Some(expires_at) = response.expires_at {
            record.quick.expires_at = expires_at;
        }

        let outcome = ValidationOutcome {
            valid: response.valid,
            online: true,
            kind,
            error: response.error.clone(),
        };
        record.record_validation(&outcome, &self.secret)?;
        self.store.put(record).await?;

        tenant::apply_online_verdict(
            self.tenant_store.as_ref(),
            tenant_id,
            was_suspended,
            response.valid,
            response.error.as_deref(),
            &format!("authority validation: {}", response.error.as_deref().unwrap_or("valid")),
        )
        .await?;

        Ok(outcome)
    }

    /// Validate `tenant_id` entirely from the local cache, per §4.L: the
    /// record must exist, its integrity must hold, it must not be
    /// tampered, `quick.status` must be `active`, `quick.expires_at` must
    /// be in the future, and the record must be offline-usable. Never
    /// touches tenant state — unreachable-authority outcomes leave tenant
    /// availability where it was.
    pub async fn validate_offline(&self, tenant_id: &str) -> Result<ValidationOutcome> {
        let _lock = self.store.with_tenant_lock(tenant_id).await;
        let mut record = self.store.get(tenant_id)?;

        let outcome = if !record.verify_integrity(&self.secret)? {
            ValidationOutcome {
                valid: false,
                online: false,
                kind: ValidationResultKind::Error,
                error: Some("integrity hash mismatch: record may be tampered".to_string()),
            }
        } else if record.quick.status != LicenseStatus::Active {
            ValidationOutcome {
                valid: false,
                online: false,
                kind: ValidationResultKind::Invalid,
                error: Some(format!("license status is {:?}, not active", record.quick.status)),
            }
        } else if record.quick.expires_at <= chrono::Utc::now() {
            ValidationOutcome {
                valid: false,
                online: false,
                kind: ValidationResultKind::Expired,
                error: Some("license has expired".to_string()),
            }
        } else if !record.is_offline_usable() {
            ValidationOutcome {
                valid: false,
                online: false,
                kind: ValidationResultKind::Error,
                error: Some("offline validation is not available for this tenant".to_string()),
            }
        } else {
            ValidationOutcome {
                valid: true,
                online: false,
                kind: ValidationResultKind::Valid,
                error: None,
            }
        };

        record.record_validation(&outcome, &self.secret)?;
        self.store.put(record).await?;
        Ok(outcome)
    }

    /// Validate `tenant_id` online, transparently falling back to offline
    /// validation when the authority cannot be reached.
    pub async fn validate(
        &self,
        tenant_id: &str,
        usage: Option<serde_json::Value>,
    ) -> Result<ValidationOutcome> {
        match self.validate_online(tenant_id, usage).await {
            Ok(outcome) => Ok(outcome),
            Err(crate::error::LicenseError::Remote(_)) => self.validate_offline(tenant_id).await,
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CompanyLicenseResponse, UsageReport, UsageResponse, ValidateResponse};
    use crate::record::{LicenseRecord, LicenseType, QuickAccess};
    use crate::tenant::{SuspensionReason, TenantAvailability};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct StubClient {
        response: StdMutex<Option<ValidateResponse>>,
        fail: bool,
    }

    #[async_trait]
    impl LicenseAuthorityClient for StubClient {
        async fn fetch_company_license(&self, _tenant_id: &str) -> Result<CompanyLicenseResponse> {
            unimplemented!()
        }

        async fn validate(&self, _request: ValidateRequest) -> Result<ValidateResponse> {
            if self.fail {
                return Err(crate::error::LicenseError::Remote("unreachable".to_string()));
            }
            Ok(self.response.lock().unwrap().take().unwrap())
        }

        async fn report_usage(&self, _report: UsageReport) -> Result<UsageResponse> {
            unimplemented!()
        }

        async fn health(&self) -> bool {
            !self.fail
        }
    }

    #[derive(Default)]
    struct RecordingTenantStore {
        state: StdMutex<Option<TenantAvailability>>,
        reactivations: StdMutex<u32>,
        suspensions: StdMutex<Vec<SuspensionReason>>,
    }

    #[async_trait]
    impl TenantStateStore for RecordingTenantStore {
        async fn current_state(&self, _tenant_id: &str) -> Result<Option<TenantAvailability>> {
            Ok(*self.state.lock().unwrap())
        }

        async fn reactivate(&self, _tenant_id: &str, _cause: &str) -> Result<()> {
            *self.state.lock().unwrap() = Some(TenantAvailability::Active);
            *self.reactivations.lock().unwrap() += 1;
            Ok(())
        }

        async fn suspend(&self, _tenant_id: &str, reason: SuspensionReason, _cause: &str) -> Result<()> {
            *self.state.lock().unwrap() = Some(TenantAvailability::Suspended);
            self.suspensions.lock().unwrap().push(reason);
            Ok(())
        }
    }

    async fn seeded_store(status: LicenseStatus) -> Arc<LicenseStore> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LicenseStore::open(dir.path().to_path_buf()).await.unwrap());
        let mut record = LicenseRecord::new(
            "lic-1".to_string(),
            "LN-1".to_string(),
            "tenant-a".to_string(),
            QuickAccess {
                license_type: LicenseType::Enterprise,
                status,
                expires_at: chrono::Utc::now() + chrono::Duration::days(10),
                max_users: 50,
                enabled_modules: vec![],
            },
            "secret",
        )
        .unwrap();
        if status == LicenseStatus::Suspended {
            record.offline.enabled = false;
        }
        store.put(record).await.unwrap();
        store
    }

    #[tokio::test]
    async fn online_revoked_verdict_suspends_and_updates_status() {
        let store = seeded_store(LicenseStatus::Active).await;
        let client = Arc::new(StubClient {
            response: StdMutex::new(Some(ValidateResponse {
                valid: false,
                error: Some("LICENSE_REVOKED".to_string()),
                features: None,
                expires_at: None,
            })),
            fail: false,
        });
        let tenant_store = Arc::new(RecordingTenantStore::default());
        let validator = LicenseValidator::new(store.clone(), client, tenant_store.clone(), "secret".to_string());

        let outcome = validator.validate_online("tenant-a", None).await.unwrap();
        assert!(!outcome.valid);
        assert_eq!(tenant_store.suspensions.lock().unwrap()[0], SuspensionReason::LicenseRevoked);

        let record = store.get("tenant-a").unwrap();
        assert_eq!(record.quick.status, LicenseStatus::Revoked);
    }

    #[tokio::test]
    async fn online_valid_verdict_reactivates_suspended_tenant() {
        let store = seeded_store(LicenseStatus::Suspended).await;
        let client = Arc::new(StubClient {
            response: StdMutex::new(Some(ValidateResponse {
                valid: true,
                error: None,
                features: None,
                expires_at: None,
            })),
            fail: false,
        });
        let tenant_store = Arc::new(RecordingTenantStore::default());
        *tenant_store.state.lock().unwrap() = Some(TenantAvailability::Suspended);
        let validator = LicenseValidator::new(store.clone(), client, tenant_store.clone(), "secret".to_string());

        let outcome = validator.validate_online("tenant-a", None).await.unwrap();
        assert!(outcome.valid);
        assert_eq!(*tenant_store.reactivations.lock().unwrap(), 1);

        let record = store.get("tenant-a").unwrap();
        assert_eq!(record.quick.status, LicenseStatus::Active);
    }

    #[tokio::test]
    async fn online_valid_verdict_does_not_reactivate_when_tenant_store_reports_active() {
        // The license record's own cached `quick.status` can diverge from
        // the tenant store (e.g. a second license for the same tenant, or
        // an out-of-band correction) — `was_suspended` must come from the
        // tenant store, not from `record.quick.status`.
        let store = seeded_store(LicenseStatus::Suspended).await;
        let client = Arc::new(StubClient {
            response: StdMutex::new(Some(ValidateResponse {
                valid: true,
                error: None,
                features: None,
                expires_at: None,
            })),
            fail: false,
        });
        let tenant_store = Arc::new(RecordingTenantStore::default());
        *tenant_store.state.lock().unwrap() = Some(TenantAvailability::Active);
        let validator = LicenseValidator::new(store, client, tenant_store.clone(), "secret".to_string());

        let outcome = validator.validate_online("tenant-a", None).await.unwrap();
        assert!(outcome.valid);
        assert_eq!(*tenant_store.reactivations.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn offline_validation_succeeds_when_usable() {
        let store = seeded_store(LicenseStatus::Active).await;
        {
            let mut record = store.get("tenant-a").unwrap();
            record.enable_offline(72, "secret").unwrap();
            store.put(record).await.unwrap();
        }
        let client = Arc::new(StubClient {
            response: StdMutex::new(None),
            fail: true,
        });
        let tenant_store = Arc::new(RecordingTenantStore::default());
        let validator = LicenseValidator::new(store, client, tenant_store, "secret".to_string());

        let outcome = validator.validate_offline("tenant-a").await.unwrap();
        assert!(outcome.valid);
    }

    #[tokio::test]
    async fn offline_validation_fails_without_offline_mode_enabled() {
        let store = seeded_store(LicenseStatus::Active).await;
        let client = Arc::new(StubClient {
            response: StdMutex::new(None),
            fail: true,
        });
        let tenant_store = Arc::new(RecordingTenantStore::default());
        let validator = LicenseValidator::new(store, client, tenant_store, "secret".to_string());

        let outcome = validator.validate_offline("tenant-a").await.unwrap();
        assert!(!outcome.valid);
    }

    #[tokio::test]
    async fn unreachable_authority_falls_back_to_offline_without_touching_tenant_state() {
        let store = seeded_store(LicenseStatus::Active).await;
        {
            let mut record = store.get("tenant-a").unwrap();
            record.enable_offline(72, "secret").unwrap();
            store.put(record).await.unwrap();
        }
        let client = Arc::new(StubClient {
            response: StdMutex::new(None),
            fail: true,
        });
        let tenant_store = Arc::new(RecordingTenantStore::default());
        let validator = LicenseValidator::new(store, client, tenant_store.clone(), "secret".to_string());

        let outcome = validator.validate("tenant-a", None).await.unwrap();
        assert!(outcome.valid);
        assert_eq!(*tenant_store.reactivations.lock().unwrap(), 0);
        assert!(tenant_store.suspensions.lock().unwrap().is_empty());
    }
}
