//! Error types for the Keystone backup system.
//!
//! Kinds mirror the error-handling design: `CryptoError` and `IntegrityError`
//! are always fatal to the current operation; `IOError` fails the current
//! step (and the run, if the step is non-optional); `RemoteError` is
//! recorded but non-fatal for cloud uploads; `StateError` covers invalid
//! lifecycle transitions; `ConfigError` is surfaced at startup.

use thiserror::Error;

/// Main error type for backup operations.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Bad padding, malformed ciphertext, or wrong key size.
    #[error("crypto error: {0}")]
    Crypto(#[from] keystone_crypto::CryptoError),

    /// Missing file, permission denied, short write, or other local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The object-store backend or the license authority is unreachable or
    /// returned a non-2xx response. Never fails a backup run by itself.
    #[error("remote error: {0}")]
    Remote(String),

    /// Checksum mismatch, size mismatch, or integrity-hash mismatch.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// An operation was attempted against a `BackupRun` in the wrong state,
    /// e.g. restoring a run that is not `completed`.
    #[error("invalid state: {0}")]
    State(String),

    /// Required configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A backup run referenced by id does not exist in the registry.
    #[error("backup not found: {0}")]
    NotFound(String),

    /// JSON (de)serialization of a registry entry or report failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Scheduler-level failure (bad cron expression, job already running).
    #[error("scheduling error: {0}")]
    Scheduling(String),
}

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;
