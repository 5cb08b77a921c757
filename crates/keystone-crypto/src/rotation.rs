//! Local encryption-key rotation history.
//!
//! The active key used by [`crate::symmetric::encrypt`] lives in the caller's
//! process (see the Open Questions in the design notes: this workspace stores
//! the active key on disk under the metadata area rather than requiring an
//! external orchestrator to refresh an environment variable). Rotating the
//! key does not touch artifacts already encrypted under an older key, so a
//! decrypt path that meets a `DecryptionFailed` under the active key should
//! retry with each entry in the rotation history before giving up.

use serde::{Deserialize, Serialize};

use crate::symmetric::KEY_LEN;

/// One key-rotation event, as persisted to the metadata area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRotationRecord {
    /// When the rotation occurred.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// The key that was active immediately before this rotation, hex-encoded.
    pub old_key_hex: String,
    /// The key that became active, hex-encoded.
    pub new_key_hex: String,
}

/// In-memory view over the rotation history, used to find the key that
/// decrypts an artifact written before the most recent rotation.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct KeyRotationHistory {
    /// Rotation events in chronological order.
    pub rotations: Vec<KeyRotationRecord>,
}

impl KeyRotationHistory {
    /// Load a rotation history from its on-disk JSON form, or start empty.
    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(data)
    }

    /// Serialize the history for persistence under `metadata/key-rotation.json`.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Record a rotation from `old_key` to `new_key`.
    pub fn record_rotation(
        &mut self,
        old_key: &[u8; KEY_LEN],
        new_key: &[u8; KEY_LEN],
        timestamp: chrono::DateTime<chrono::Utc>,
    ) {
        self.rotations.push(KeyRotationRecord {
            timestamp,
            old_key_hex: hex::encode(old_key),
            new_key_hex: hex::encode(new_key),
        });
    }

    /// All historical keys, most recently retired first, each preceding the
    /// current active key. Useful for a decrypt path to fall back through.
    pub fn candidate_keys(&self) -> Vec<[u8; KEY_LEN]> {
        self.rotations
            .iter()
            .rev()
            .filter_map(|r| {
                let bytes = hex::decode(&r.old_key_hex).ok()?;
                bytes.try_into().ok()
            })
            .collect()
    }
}
