//! Core error types

use thiserror::Error;

/// Core error type for OmniCore
#[derive(Debug, Error)]
pub enum CoreError {
    /// Backing database failure
    #[cfg(feature = "sqlite")]
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record exists but is unreadable
    #[error("Corrupt {kind} record '{id}': {reason}")]
    CorruptRecord {
        kind: String,
        id: String,
        reason: String,
    },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A lock guarding shared state was poisoned by a panicking writer
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
