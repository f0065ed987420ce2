//! Error types for cryptographic operations.

use thiserror::Error;

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Unsupported blob format version.
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u8),

    /// Blob is too short to contain a header, nonce and tag.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Key material is missing or malformed.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Encryption failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed - wrong key or corrupted data.
    #[error("Decryption failed: {0}")]
    Decryption(String),
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

impl From<CryptoError> for knowhere_core::Error {
    fn from(e: CryptoError) -> Self {
        knowhere_core::Error::Crypto(e.to_string())
    }
}
