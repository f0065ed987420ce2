//! Error types for the knowhere pipeline.

use thiserror::Error;

/// Result type alias using knowhere's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for knowhere operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Knowledge item not found
    #[error("Knowledge not found: {0}")]
    KnowledgeNotFound(uuid::Uuid),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Inference/generation failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// Content encryption or decryption failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Distributed lock store failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// Pipeline queue or worker error
    #[error("Job error: {0}")]
    Job(String),

    /// A derived-artifact invariant was violated (e.g. vector/chunk count mismatch)
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// An operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
