//! Error types for license cache, sync, and validation operations.
//!
//! `Crypto` and `Integrity` are always fatal to the current operation;
//! `Remote` drives the offline-mode fallback in [`crate::sync`] rather
//! than failing outright; `State` covers invalid lifecycle transitions;
//! `Config` is surfaced at startup.

use thiserror::Error;

/// Main error type for license operations.
#[derive(Error, Debug)]
pub enum LicenseError {
    /// Bad padding, malformed ciphertext, or wrong key size.
    #[error("crypto error: {0}")]
    Crypto(#[from] keystone_crypto::CryptoError),

    /// The license authority is unreachable or returned a non-2xx response.
    #[error("remote error: {0}")]
    Remote(String),

    /// Integrity-hash mismatch; always sets `tamperDetected` on the record.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// An operation was attempted against a license record in the wrong
    /// state, e.g. validating a record that does not exist locally.
    #[error("invalid state: {0}")]
    State(String),

    /// Required configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A license referenced by id or tenant does not exist in the store.
    #[error("license not found: {0}")]
    NotFound(String),

    /// JSON (de)serialization of a license record failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local I/O failure persisting or loading the license store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for license operations.
pub type Result<T> = std::result::Result<T, LicenseError>;
