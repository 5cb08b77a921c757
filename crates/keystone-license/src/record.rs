//! `LicenseRecord`: one per-tenant cached license (§3, §4.K).
//!
//! Every mutation path funnels through [`LicenseRecord::seal`], which
//! recomputes `integrity.integrity_hash` from the identity, quick-access,
//! and cache sections. This replaces the pre-save hooks the original source
//! scattered across its persistence layer (see the design notes) with one
//! explicit call every mutator makes before returning.

use serde::{Deserialize, Serialize};

use keystone_crypto::{integrity, symmetric};

use crate::error::{LicenseError, Result};

/// Tier a license grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseType {
    /// Time-boxed evaluation tier.
    Trial,
    /// Entry paid tier.
    Starter,
    /// Mid paid tier.
    Professional,
    /// Top paid tier.
    Enterprise,
    /// No seat/module limits.
    Unlimited,
}

/// Current lifecycle status of a license, as last known from the authority
/// or computed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    /// Usable.
    Active,
    /// Past `expiresAt`.
    Expired,
    /// Deactivated by the tenant state machine, may be reactivated.
    Suspended,
    /// Deactivated by the authority, not expected to be reactivated.
    Revoked,
    /// Awaiting first sync.
    Pending,
}

/// Categorical outcome of a validation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationResultKind {
    /// License is usable.
    Valid,
    /// License is not usable for a reason other than expiry.
    Invalid,
    /// License has passed its expiry date.
    Expired,
    /// Validation itself could not complete (network, malformed record).
    Error,
}

/// The unencrypted, indexable subset of a license held alongside the
/// encrypted payload for fast decisions (§3, "quick-access fields").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickAccess {
    /// Tier.
    pub license_type: LicenseType,
    /// Current status.
    pub status: LicenseStatus,
    /// Expiry timestamp.
    pub expires_at: chrono::DateTime<chrono::Utc>,
    /// Maximum permitted user seats.
    pub max_users: u32,
    /// Module ids this license enables.
    pub enabled_modules: Vec<String>,
}

/// Cache bookkeeping for the encrypted payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheState {
    /// When the payload was last refreshed from the authority.
    pub last_synced_at: chrono::DateTime<chrono::Utc>,
    /// Monotonically increasing version, bumped on every successful sync.
    pub sync_version: u64,
    /// Version of the encryption scheme used for `encrypted_payload`.
    pub enc_version: u32,
    /// Hex MD5 of the ciphertext bytes (compatibility format, not a
    /// security boundary — see `keystone_crypto::symmetric::md5_hex`).
    pub checksum: String,
}

/// Validation bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationState {
    /// When validation last ran.
    pub last_validated_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Total validations performed.
    pub count: u64,
    /// Outcome of the last validation.
    pub last_result: Option<ValidationResultKind>,
    /// Error detail from the last validation, if any.
    pub last_error: Option<String>,
    /// When the next validation is due.
    pub next_due_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Sync bookkeeping, including the capped exponential backoff schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    /// When a sync was last attempted.
    pub last_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
    /// When a sync last succeeded.
    pub last_success_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// Error detail from the last failed sync, if any.
    pub last_error: Option<String>,
    /// When the next sync is scheduled.
    pub next_scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Consecutive retry attempts, capped at 5 (§4.K, §8 backoff monotonicity).
    pub retry_count: u32,
}

/// Offline-validation allowance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineState {
    /// Whether offline validation is currently permitted.
    pub enabled: bool,
    /// Grace period deadline; offline validation is refused past this.
    pub grace_period_until: Option<chrono::DateTime<chrono::Utc>>,
    /// Remaining offline validations, 0..=100.
    pub validations_remaining: u32,
    /// When the authority was last consulted successfully.
    pub last_online_validation_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for OfflineState {
    fn default() -> Self {
        Self {
            enabled: false,
            grace_period_until: None,
            validations_remaining: 100,
            last_online_validation_at: None,
        }
    }
}

/// Integrity bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityState {
    /// Set when [`LicenseRecord::verify_integrity`] detects a mismatch.
    pub tamper_detected: bool,
    /// When integrity was last checked.
    pub last_checked_at: Option<chrono::DateTime<chrono::Utc>>,
    /// The sealed integrity hash.
    pub integrity_hash: String,
    /// When the active encryption key was last rotated.
    pub key_rotated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// The fields that feed the integrity hash, canonicalized in this exact
/// shape (§3: "canonical({licenseId, licenseNumber, tenantId, quick, cache})").
#[derive(Serialize)]
struct IntegrityInput<'a> {
    license_id: &'a str,
    license_number: &'a str,
    tenant_id: &'a str,
    quick: &'a QuickAccess,
    cache: &'a CacheState,
}

/// A single tenant's cached, encrypted license record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseRecord {
    /// Unique identifier assigned by the authority.
    pub license_id: String,
    /// Unique human-facing license number.
    pub license_number: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Opaque `IV_hex:CT_hex` ciphertext of the authority's license payload.
    /// Excluded from default reads by callers that only need `quick`.
    pub encrypted_payload: String,
    /// Cache bookkeeping.
    pub cache: CacheState,
    /// Quick-access fields.
    pub quick: QuickAccess,
    /// Validation bookkeeping.
    pub validation: ValidationState,
    /// Sync bookkeeping.
    pub sync: SyncState,
    /// Offline-validation allowance.
    pub offline: OfflineState,
    /// Integrity bookkeeping.
    pub integrity: IntegrityState,
}

/// Outcome of a validation attempt, as recorded by [`LicenseRecord::record_validation`].
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// Whether the license was found usable.
    pub valid: bool,
    /// Whether this outcome came from the authority (`true`) or a local
    /// offline check (`false`).
    pub online: bool,
    /// Categorical result.
    pub kind: ValidationResultKind,
    /// Error detail, when `kind` is `Invalid` or `Error`.
    pub error: Option<String>,
}

/// Outcome of a sync attempt, as recorded by [`LicenseRecord::record_sync`].
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// The authority returned a fresh payload.
    Success,
    /// The authority could not be reached or returned an error.
    Failure(String),
}

impl LicenseRecord {
    /// Construct a freshly synced record from the authority's first
    /// response for a tenant. The caller still needs [`Self::update_encrypted`]
    /// to attach the encrypted payload before persisting.
    pub fn new(
        license_id: String,
        license_number: String,
        tenant_id: String,
        quick: QuickAccess,
        secret: &str,
    ) -> Result<Self> {
        let mut record = Self {
            license_id,
            license_number,
            tenant_id,
            encrypted_payload: String::new(),
            cache: CacheState {
                last_synced_at: chrono::Utc::now(),
                sync_version: 0,
                enc_version: 1,
                checksum: String::new(),
            },
            quick,
            validation: ValidationState::default(),
            sync: SyncState::default(),
            offline: OfflineState::default(),
            integrity: IntegrityState::default(),
        };
        record.seal(secret)?;
        Ok(record)
    }

    /// Recompute `integrity.integrity_hash` from the identity, quick-access,
    /// and cache sections. Every mutator below calls this before returning;
    /// callers should never need to call it directly except after a raw
    /// field assignment in a test.
    pub fn seal(&mut self, secret: &str) -> Result<()> {
        let hash = self.compute_integrity_hash(secret)?;
        self.integrity.integrity_hash = hash;
        Ok(())
    }

    /// Compute what the integrity hash *should* be right now, without
    /// mutating the record.
    pub fn compute_integrity_hash(&self, secret: &str) -> Result<String> {
        let input = IntegrityInput {
            license_id: &self.license_id,
            license_number: &self.license_number,
            tenant_id: &self.tenant_id,
            quick: &self.quick,
            cache: &self.cache,
        };
        Ok(integrity::compute_integrity_hash(&input, secret)?)
    }

    /// Returns `true` iff the stored hash matches what the current fields
    /// would produce. Sets `integrity.tamper_detected` on mismatch and
    /// always updates `integrity.last_checked_at`.
    pub fn verify_integrity(&mut self, secret: &str) -> Result<bool> {
        let computed = self.compute_integrity_hash(secret)?;
        self.integrity.last_checked_at = Some(chrono::Utc::now());
        let matches = computed == self.integrity.integrity_hash;
        if !matches {
            self.integrity.tamper_detected = true;
        }
        Ok(matches)
    }

    /// A record is *valid* iff active, unexpired, untampered, and its
    /// integrity hash checks out (§3 invariants).
    pub fn is_valid(&self, secret: &str) -> Result<bool> {
        if self.integrity.tamper_detected {
            return Ok(false);
        }
        if self.quick.status != LicenseStatus::Active {
            return Ok(false);
        }
        if self.quick.expires_at <= chrono::Utc::now() {
            return Ok(false);
        }
        Ok(self.compute_integrity_hash(secret)? == self.integrity.integrity_hash)
    }

    /// A record is *offline-usable* iff offline mode is enabled, the grace
    /// period has not lapsed, and a quota remains.
    pub fn is_offline_usable(&self) -> bool {
        self.offline.enabled
            && self
                .offline
                .grace_period_until
                .is_some_and(|deadline| chrono::Utc::now() <= deadline)
            && self.offline.validations_remaining > 0
    }

    /// Re-encrypt `payload` under `key`, storing it in the fixed
    /// `IV_hex:CT_hex` license ciphertext format, refresh `quick`, bump
    /// `cache.sync_version`, recompute `cache.checksum`, and reseal.
    pub fn update_encrypted<T: Serialize>(
        &mut self,
        payload: &T,
        quick: QuickAccess,
        key: &[u8],
        secret: &str,
    ) -> Result<()> {
        let plaintext = serde_json::to_vec(payload)?;
        let formatted = symmetric::encrypt_to_hex_pair(&plaintext, key)?;
        let ciphertext_hex = formatted
            .split_once(':')
            .map(|(_, ct)| ct)
            .unwrap_or(&formatted);

        self.encrypted_payload = formatted.clone();
        self.quick = quick;
        self.cache.sync_version += 1;
        self.cache.last_synced_at = chrono::Utc::now();
        self.cache.checksum = symmetric::md5_hex(ciphertext_hex.as_bytes());
        self.seal(secret)?;
        Ok(())
    }

    /// Decrypt the stored payload under `key`, deserializing it as `T`.
    pub fn decrypt<T: for<'de> Deserialize<'de>>(&self, key: &[u8]) -> Result<T> {
        let plaintext = symmetric::decrypt_hex_pair(&self.encrypted_payload, key)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Record a validation outcome, updating `validation.*` and the offline
    /// quota, then reseal.
    pub fn record_validation(&mut self, outcome: &ValidationOutcome, secret: &str) -> Result<()> {
        let now = chrono::Utc::now();
        self.validation.last_validated_at = Some(now);
        self.validation.count += 1;
        self.validation.last_result = Some(outcome.kind);
        self.validation.last_error = outcome.error.clone();
        self.validation.next_due_at = Some(now + chrono::Duration::hours(24));

        if outcome.valid && outcome.online {
            self.offline.validations_remaining = 100;
            self.offline.last_online_validation_at = Some(now);
        } else if self.offline.enabled {
            self.offline.validations_remaining = self.offline.validations_remaining.saturating_sub(1);
        }

        self.seal(secret)
    }

    /// Record a sync attempt, updating `sync.*` with the capped exponential
    /// backoff schedule (§4.K, §8 backoff monotonicity), then reseal.
    pub fn record_sync(&mut self, outcome: &SyncOutcome, secret: &str) -> Result<()> {
        let now = chrono::Utc::now();
        self.sync.last_attempt_at = Some(now);

        match outcome {
            SyncOutcome::Success => {
                self.sync.last_success_at = Some(now);
                self.sync.failure_count = 0;
                self.sync.retry_count = 0;
                self.sync.last_error = None;
                self.sync.next_scheduled_at = Some(now + chrono::Duration::hours(6));
            }
            SyncOutcome::Failure(error) => {
                self.sync.failure_count += 1;
                self.sync.retry_count = (self.sync.retry_count + 1).min(5);
                self.sync.last_error = Some(error.clone());
                let backoff_hours = 2u64.saturating_pow(self.sync.retry_count).min(24);
                self.sync.next_scheduled_at =
                    Some(now + chrono::Duration::hours(backoff_hours as i64));
            }
        }

        self.seal(secret)
    }

    /// Enable offline validation for `grace_period_hours` (default 72 per
    /// §4.K) from now, resetting the quota to its maximum.
    pub fn enable_offline(&mut self, grace_period_hours: i64, secret: &str) -> Result<()> {
        self.offline.enabled = true;
        self.offline.grace_period_until =
            Some(chrono::Utc::now() + chrono::Duration::hours(grace_period_hours));
        self.offline.validations_remaining = 100;
        self.seal(secret)
    }

    /// Disable offline validation immediately.
    pub fn disable_offline(&mut self, secret: &str) -> Result<()> {
        self.offline.enabled = false;
        self.offline.grace_period_until = None;
        self.seal(secret)
    }

    /// Auto-disable offline mode once the grace period has lapsed, per the
    /// lifecycle rule in §3. No-op (and no error) if offline mode is
    /// already disabled or the grace period has not lapsed.
    pub fn expire_offline_if_due(&mut self, secret: &str) -> Result<bool> {
        if !self.offline.enabled {
            return Ok(false);
        }
        let lapsed = self
            .offline
            .grace_period_until
            .is_some_and(|deadline| deadline < chrono::Utc::now());
        if lapsed {
            self.disable_offline(secret)?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> QuickAccess {
        QuickAccess {
            license_type: LicenseType::Professional,
            status: LicenseStatus::Active,
            expires_at: chrono::Utc::now() + chrono::Duration::days(30),
            max_users: 50,
            enabled_modules: vec!["reporting".to_string()],
        }
    }

    fn fresh() -> LicenseRecord {
        LicenseRecord::new(
            "lic-1".to_string(),
            "LN-0001".to_string(),
            "tenant-a".to_string(),
            quick(),
            "process-secret",
        )
        .unwrap()
    }

    #[test]
    fn new_record_integrity_hash_matches_computed() {
        let record = fresh();
        assert_eq!(
            record.integrity.integrity_hash,
            record.compute_integrity_hash("process-secret").unwrap()
        );
    }

    #[test]
    fn tampering_with_quick_fields_is_detected() {
        let mut record = fresh();
        record.quick.max_users = 9999;
        assert!(!record.verify_integrity("process-secret").unwrap());
        assert!(record.integrity.tamper_detected);
    }

    #[test]
    fn update_encrypted_roundtrips_and_reseals() {
        let mut record = fresh();
        let key = keystone_crypto::symmetric::generate_key();
        let payload = serde_json::json!({"licenseData": "x", "encryptionKey": "y"});
        record
            .update_encrypted(&payload, quick(), &key, "secret")
            .unwrap();

        assert_eq!(record.cache.sync_version, 1);
        assert!(record.verify_integrity("secret").unwrap());

        let decrypted: serde_json::Value = record.decrypt(&key).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn is_valid_requires_active_unexpired_untampered() {
        let mut record = fresh();
        assert!(record.is_valid("process-secret").unwrap());

        record.quick.status = LicenseStatus::Suspended;
        record.seal("process-secret").unwrap();
        assert!(!record.is_valid("process-secret").unwrap());
    }

    #[test]
    fn online_valid_resets_offline_quota() {
        let mut record = fresh();
        record.offline.enabled = true;
        record.offline.validations_remaining = 3;

        record
            .record_validation(
                &ValidationOutcome {
                    valid: true,
                    online: true,
                    kind: ValidationResultKind::Valid,
                    error: None,
                },
                "process-secret",
            )
            .unwrap();

        assert_eq!(record.offline.validations_remaining, 100);
        assert!(record.offline.last_online_validation_at.is_some());
    }

    #[test]
    fn offline_validation_decrements_quota_with_floor_zero() {
        let mut record = fresh();
        record.offline.enabled = true;
        record.offline.validations_remaining = 1;

        for _ in 0..3 {
            record
                .record_validation(
                    &ValidationOutcome {
                        valid: true,
                        online: false,
                        kind: ValidationResultKind::Valid,
                        error: None,
                    },
                    "process-secret",
                )
                .unwrap();
        }

        assert_eq!(record.offline.validations_remaining, 0);
    }

    #[test]
    fn sync_backoff_is_capped_exponential() {
        let mut record = fresh();
        let mut previous = 0i64;
        for k in 1..=6u32 {
            record
                .record_sync(&SyncOutcome::Failure("unreachable".to_string()), "secret")
                .unwrap();
            let delta = (record.sync.next_scheduled_at.unwrap() - record.sync.last_attempt_at.unwrap())
                .num_hours();
            let expected = 2i64.saturating_pow(k.min(5)).min(24);
            assert_eq!(delta, expected);
            assert!(delta >= previous);
            previous = delta;
        }
        assert_eq!(record.sync.retry_count, 5);
    }

    #[test]
    fn sync_success_resets_counters() {
        let mut record = fresh();
        record
            .record_sync(&SyncOutcome::Failure("x".to_string()), "secret")
            .unwrap();
        record
            .record_sync(&SyncOutcome::Success, "secret")
            .unwrap();
        assert_eq!(record.sync.failure_count, 0);
        assert_eq!(record.sync.retry_count, 0);
        let delta = (record.sync.next_scheduled_at.unwrap() - record.sync.last_attempt_at.unwrap())
            .num_hours();
        assert_eq!(delta, 6);
    }

    #[test]
    fn enable_offline_sets_grace_period_and_resets_quota() {
        let mut record = fresh();
        record.offline.validations_remaining = 0;
        record.enable_offline(72, "secret").unwrap();
        assert!(record.is_offline_usable());
        assert_eq!(record.offline.validations_remaining, 100);
    }

    #[test]
    fn expire_offline_if_due_disables_past_grace_period() {
        let mut record = fresh();
        record.offline.enabled = true;
        record.offline.grace_period_until = Some(chrono::Utc::now() - chrono::Duration::hours(1));
        record.seal("secret").unwrap();

        let disabled = record.expire_offline_if_due("secret").unwrap();
        assert!(disabled);
        assert!(!record.offline.enabled);
        assert!(!record.is_offline_usable());
    }
}
