//! Canonical-JSON integrity hashing.
//!
//! `integrityHash(record, secret)` is SHA-256 over a canonical JSON rendering
//! of the caller-chosen fields, concatenated with a process-wide secret.
//! Canonicalization is delegated to `serde_json::Value`: its default map type
//! is key-ordered (we do not enable the `preserve_order` feature anywhere in
//! this workspace), so round-tripping a struct through `Value` yields the
//! same bytes regardless of field declaration order. Fields that should be
//! "absent" rather than `null` must be skipped with
//! `#[serde(skip_serializing_if = "Option::is_none")]` on the caller's type.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::CryptoResult;

/// Render `value` as canonical JSON: stable key order, no absent-field noise.
pub fn canonicalize<T: Serialize>(value: &T) -> CryptoResult<String> {
    let as_value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&as_value)?)
}

/// Compute the integrity hash of `value` under `secret`, as lowercase hex.
pub fn compute_integrity_hash<T: Serialize>(value: &T, secret: &str) -> CryptoResult<String> {
    let canonical = canonicalize(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(secret.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Verify that `expected` matches the integrity hash of `value` under `secret`.
pub fn verify_integrity_hash<T: Serialize>(
    value: &T,
    secret: &str,
    expected: &str,
) -> CryptoResult<bool> {
    Ok(compute_integrity_hash(value, secret)? == expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct A {
        z: u32,
        a: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        omit_me: Option<u32>,
    }

    #[derive(Serialize)]
    struct B {
        a: u32,
        z: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        omit_me: Option<u32>,
    }

    #[test]
    fn field_order_does_not_affect_hash() {
        let a = A {
            z: 1,
            a: 2,
            omit_me: None,
        };
        let b = B {
            a: 2,
            z: 1,
            omit_me: None,
        };
        let ha = compute_integrity_hash(&a, "secret").unwrap();
        let hb = compute_integrity_hash(&b, "secret").unwrap();
        assert_eq!(ha, hb);
    }

    #[test]
    fn absent_field_differs_from_present_null() {
        let without = A {
            z: 1,
            a: 2,
            omit_me: None,
        };
        let with = A {
            z: 1,
            a: 2,
            omit_me: Some(3),
        };
        assert_ne!(
            compute_integrity_hash(&without, "secret").unwrap(),
            compute_integrity_hash(&with, "secret").unwrap()
        );
    }

    #[test]
    fn different_secret_changes_hash() {
        let a = A {
            z: 1,
            a: 2,
            omit_me: None,
        };
        let h1 = compute_integrity_hash(&a, "secret-one").unwrap();
        let h2 = compute_integrity_hash(&a, "secret-two").unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn verify_roundtrip() {
        let a = A {
            z: 1,
            a: 2,
            omit_me: None,
        };
        let hash = compute_integrity_hash(&a, "s").unwrap();
        assert!(verify_integrity_hash(&a, "s", &hash).unwrap());
        assert!(!verify_integrity_hash(&a, "s", "deadbeef").unwrap());
    }
}
