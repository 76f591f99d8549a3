//! Error types for OmniCore identity operations.

use thiserror::Error;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Key store errors
    #[error(transparent)]
    KeyStore(#[from] crate::keystore::KeyStoreError),

    /// Session errors
    #[error(transparent)]
    Session(#[from] crate::session::SessionError),

    /// Admin authentication errors
    #[error(transparent)]
    Admin(#[from] crate::admin::AdminError),

    /// `complete` arrived without a preceding `init`
    #[error("No pending registration for client '{0}'")]
    NoPendingRegistration(String),

    /// Core errors
    #[error("Core error: {0}")]
    Core(#[from] omnicore_core::CoreError),
}

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;
