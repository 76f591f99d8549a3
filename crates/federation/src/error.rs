//! Error types for federation operations.

use omnicore_core::CoreError;
use omnicore_crypto::CryptoError;
use thiserror::Error;

/// Errors that can occur in federation operations.
#[derive(Debug, Error)]
pub enum FederationError {
    /// Descriptor failed validation
    #[error("Invalid server descriptor: {0}")]
    InvalidDescriptor(String),

    /// Registry is full and the candidate is a new id
    #[error("Server registry is full ({max} entries)")]
    CapacityExceeded { max: usize },

    /// Same server id presented with a different public key
    #[error("Public key mismatch for server '{server_id}'")]
    KeyMismatch { server_id: String },

    /// A newer record with the same public key already exists
    #[error("Superseded by server '{by}'")]
    Stale { by: String },

    #[error("Unknown server '{0}'")]
    NotFound(String),

    #[error("Trust level {0} is out of range (0-100)")]
    InvalidTrustLevel(u8),

    /// Peer is not known to us or has not been authenticated
    #[error("Peer '{0}' is not authenticated")]
    PeerNotAuthenticated(String),

    /// Signature, challenge or freshness check failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Timed out waiting for peer '{0}'")]
    Timeout(String),

    /// Peer answered with something we could not interpret
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] CoreError),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl FederationError {
    /// Failures attributable to a single peer. The sync loop records these
    /// against the peer and carries on with the rest of the cycle.
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            FederationError::PeerUnreachable(_)
                | FederationError::Timeout(_)
                | FederationError::AuthenticationFailed(_)
                | FederationError::PeerNotAuthenticated(_)
                | FederationError::Transport(_)
        )
    }
}

/// Result type for federation operations.
pub type FederationResult<T> = Result<T, FederationError>;
