//! # Keystone Crypto
//!
//! Symmetric encryption and integrity primitives shared by the backup engine
//! and the license cache.
//!
//! This crate intentionally has no opinion about where key material comes
//! from or where artifacts are stored — it only implements the two fixed
//! wire contracts the rest of the workspace depends on:
//!
//! - AES-256-CBC with PKCS#7 padding, used for backup artifacts and the
//!   license cache's encrypted record payload (see [`symmetric`]).
//! - Canonical-JSON SHA-256 integrity hashing, used to detect tampering with
//!   backup manifests and license records (see [`integrity`]).
//!
//! Key rotation history (see [`rotation`]) is a thin, storage-agnostic
//! helper: callers own persisting the returned JSON wherever they already
//! keep other metadata.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod integrity;
pub mod rotation;
pub mod symmetric;

pub use error::{CryptoError, CryptoResult};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the library version.
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let version = version();
        assert!(!version.is_empty());
        assert_eq!(version, VERSION);
    }
}
