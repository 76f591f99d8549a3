//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors that can occur in cryptographic operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Peer key is a low-order or identity point
    #[error("Invalid peer key: key agreement is non-contributory")]
    InvalidPeerKey,

    /// Public key is not a 32-byte hex or base64 encoding
    #[error("Invalid public key format: {0}")]
    InvalidPublicKeyFormat(String),

    /// Secret key material could not be decoded
    #[error("Invalid secret key")]
    InvalidSecretKey,

    /// AEAD tag mismatch or signature verification failure
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Nonce has the wrong length or encoding
    #[error("Invalid nonce: {0}")]
    InvalidNonce(String),

    /// Ciphertext or signature is not decodable
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Cipher failed to produce a ciphertext
    #[error("Encryption failed")]
    EncryptionFailed,
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
