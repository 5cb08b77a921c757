//! `LicenseStore`: the per-tenant locked store backing the license cache.
//!
//! §5 requires a per-tenant exclusive lock for any mutation path, while
//! readers that only consult `quick` fields should not block on it.
//! `DashMap` gives us exactly that split: a `get` takes a per-shard read
//! lock, while [`LicenseStore::with_tenant_lock`] hands the caller an
//! async [`tokio::sync::Mutex`] scoped to one tenant so two different
//! tenants' Sync/Validation passes can proceed fully in parallel.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::{LicenseError, Result};
use crate::record::LicenseRecord;

/// Persisted, per-tenant store of [`LicenseRecord`]s, mirrored to disk as
/// one JSON file per tenant so a restart does not lose cache state.
pub struct LicenseStore {
    records: DashMap<String, LicenseRecord>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    base_dir: PathBuf,
}

impl LicenseStore {
    /// Open a store rooted at `base_dir`, loading any existing per-tenant
    /// JSON files found there.
    pub async fn open(base_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&base_dir).await?;
        let records = DashMap::new();

        let mut dir = tokio::fs::read_dir(&base_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            if let Ok(record) = serde_json::from_slice::<LicenseRecord>(&bytes) {
                records.insert(record.tenant_id.clone(), record);
            }
        }

        Ok(Self {
            records,
            locks: DashMap::new(),
            base_dir,
        })
    }

    /// Acquire the exclusive lock for `tenant_id`. Hold the guard for the
    /// duration of a Sync or Validation pass so the two can never mutate
    /// the same tenant's record concurrently; different tenants' guards
    /// are independent.
    pub async fn with_tenant_lock(&self, tenant_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Read-only fetch of a tenant's record. Does not take the per-tenant
    /// mutation lock.
    pub fn get(&self, tenant_id: &str) -> Result<LicenseRecord> {
        self.records
            .get(tenant_id)
            .map(|r| r.clone())
            .ok_or_else(|| LicenseError::NotFound(tenant_id.to_string()))
    }

    /// Whether a record exists for `tenant_id`.
    pub fn contains(&self, tenant_id: &str) -> bool {
        self.records.contains_key(tenant_id)
    }

    /// Insert or overwrite a tenant's record and mirror it to disk.
    /// Callers MUST hold the tenant's lock from [`Self::with_tenant_lock`]
    /// before calling this.
    pub async fn put(&self, record: LicenseRecord) -> Result<()> {
        let path = self.sidecar_path(&record.tenant_id);
        let bytes = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(&path, bytes).await?;
        self.records.insert(record.tenant_id.clone(), record);
        Ok(())
    }

    /// All tenant ids with a local record, for sweep jobs like expired-offline
    /// cleanup that must visit every tenant.
    pub fn tenant_ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    /// Records whose `sync.retry_count` is still below the retry ceiling —
    /// the set a sync-failure sweep should keep attempting (§4.L).
    pub fn retryable(&self, max_retry_count: u32) -> Vec<LicenseRecord> {
        self.records
            .iter()
            .filter(|r| r.sync.retry_count < max_retry_count)
            .map(|r| r.clone())
            .collect()
    }

    fn sidecar_path(&self, tenant_id: &str) -> PathBuf {
        self.base_dir.join(format!("{tenant_id}.json"))
    }
}

/// Visit every tenant's record and disable offline mode wherever its grace
/// period has lapsed (§4.I's hourly `expired_offline_cleanup` job). Returns
/// the number of records disabled.
pub async fn sweep_expired_offline(store: &LicenseStore, secret: &str) -> Result<usize> {
    let mut disabled = 0;
    for tenant_id in store.tenant_ids() {
        let _guard = store.with_tenant_lock(&tenant_id).await;
        let mut record = match store.get(&tenant_id) {
            Ok(record) => record,
            Err(_) => continue,
        };
        if record.expire_offline_if_due(secret)? {
            store.put(record).await?;
            disabled += 1;
        }
    }
    Ok(disabled)
}
