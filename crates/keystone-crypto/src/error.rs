//! Error types for the Keystone cryptographic primitives.

use thiserror::Error;

/// Result type alias for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Main error type for all cryptographic operations.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Encryption operation failed.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption operation failed (bad padding, truncated input, or wrong key).
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Supplied key does not have the required size.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Ciphertext is shorter than the IV or otherwise malformed.
    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    /// The `IV_hex:CT_hex` license ciphertext format did not parse.
    #[error("Invalid license ciphertext format: {0}")]
    InvalidFormat(String),

    /// Hex decoding failed.
    #[error("Hex decode error: {0}")]
    HexError(#[from] hex::FromHexError),

    /// I/O failure while streaming a checksum.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Canonicalization of a record for integrity hashing failed.
    #[error("Canonicalization error: {0}")]
    Canonicalization(#[from] serde_json::Error),
}
