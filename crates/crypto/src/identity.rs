//! Ed25519 server identity.
//!
//! A server proves that it owns the public key it advertises by signing
//! challenges with this key. The server id is derived from the public key,
//! so two servers can never claim the same id with different keys without
//! one of them failing verification.

use crate::error::{CryptoError, CryptoResult};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Prefix on every server id.
pub const SERVER_ID_PREFIX: &str = "srv_";

/// Number of hex characters of the public key hash kept in a server id.
const SERVER_ID_HASH_CHARS: usize = 16;

/// Long-lived signing identity of this server.
#[derive(Clone)]
pub struct ServerIdentity {
    signing_key: SigningKey,
}

impl ServerIdentity {
    /// Generate a fresh identity from the OS RNG.
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(seed.as_mut());
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Restore from a hex-encoded 32-byte seed.
    pub fn from_secret_hex(encoded: &str) -> CryptoResult<Self> {
        let mut bytes = hex::decode(encoded.trim()).map_err(|_| CryptoError::InvalidSecretKey)?;
        let result = <[u8; 32]>::try_from(bytes.as_slice())
            .map(|seed| Self {
                signing_key: SigningKey::from_bytes(&seed),
            })
            .map_err(|_| CryptoError::InvalidSecretKey);
        bytes.zeroize();
        result
    }

    /// Hex-encoded seed for persistence.
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    pub fn server_id(&self) -> String {
        derive_server_id(&self.public_key_hex())
    }

    /// Sign a message, returning the hex-encoded signature.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("server_id", &self.server_id())
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Derive the canonical server id for a public key.
///
/// `srv_` followed by the first 16 hex characters of BLAKE3(public key).
/// The hash is taken over the key as given, so callers normalize the
/// encoding (lowercase hex) first.
pub fn derive_server_id(public_key_hex: &str) -> String {
    let digest = blake3::hash(public_key_hex.trim().to_ascii_lowercase().as_bytes());
    let hex = digest.to_hex();
    format!("{}{}", SERVER_ID_PREFIX, &hex.as_str()[..SERVER_ID_HASH_CHARS])
}

/// Verify a hex-encoded Ed25519 signature against a hex-encoded public key.
pub fn verify_signature(public_key_hex: &str, message: &[u8], signature_hex: &str) -> CryptoResult<()> {
    let key_bytes = hex::decode(public_key_hex.trim())
        .map_err(|e| CryptoError::InvalidPublicKeyFormat(format!("bad hex: {}", e)))?;
    let key_array = <[u8; 32]>::try_from(key_bytes.as_slice()).map_err(|_| {
        CryptoError::InvalidPublicKeyFormat(format!("expected 32 bytes, got {}", key_bytes.len()))
    })?;
    let verifying_key = VerifyingKey::from_bytes(&key_array)
        .map_err(|e| CryptoError::InvalidPublicKeyFormat(e.to_string()))?;

    let sig_bytes = hex::decode(signature_hex.trim())
        .map_err(|e| CryptoError::InvalidEncoding(format!("bad signature hex: {}", e)))?;
    let sig_array = <[u8; 64]>::try_from(sig_bytes.as_slice()).map_err(|_| {
        CryptoError::InvalidEncoding(format!("expected 64 signature bytes, got {}", sig_bytes.len()))
    })?;
    let signature = Signature::from_bytes(&sig_array);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::AuthenticationFailed)
}
