//! X25519 key agreement.
//!
//! Each client/server pair derives one long-lived shared secret from a static
//! server keypair and the client's public key. Both sides must arrive at the
//! same 32 bytes:
//!
//! ```text
//! client_secret x server_public == server_secret x client_public
//! ```
//!
//! Low-order public keys make the result independent of the secret scalar,
//! so any non-contributory exchange is rejected with `InvalidPeerKey`.

use crate::error::{CryptoError, CryptoResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Size of X25519 keys and shared secrets in bytes.
pub const KEY_SIZE: usize = 32;

/// X25519 public key.
///
/// Serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Reject keys that would make the exchange non-contributory.
    ///
    /// Performs a throwaway exchange against a fresh ephemeral scalar.
    pub fn check_contributory(&self) -> CryptoResult<()> {
        let scratch = EphemeralSecret::random_from_rng(OsRng);
        let shared = scratch.diffie_hellman(&X25519PublicKey::from(self.0));
        if shared.was_contributory() {
            Ok(())
        } else {
            Err(CryptoError::InvalidPeerKey)
        }
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(key: X25519PublicKey) -> Self {
        Self(key.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        parse_public_key(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Server-held X25519 secret scalar.
///
/// Zeroized on drop; never printed.
#[derive(Clone)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Restore from hex-encoded secret key
    pub fn from_hex(encoded: &str) -> CryptoResult<Self> {
        let mut bytes = hex::decode(encoded.trim()).map_err(|_| CryptoError::InvalidSecretKey)?;
        let result = <[u8; KEY_SIZE]>::try_from(bytes.as_slice())
            .map(Self::from_bytes)
            .map_err(|_| CryptoError::InvalidSecretKey);
        bytes.zeroize();
        result
    }

    /// Hex encoding for storage. The returned buffer is wiped on drop.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0.as_bytes()))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(X25519PublicKey::from(&self.0))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// X25519 keypair.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

/// Generate a uniformly random X25519 keypair from the OS RNG.
pub fn generate_keypair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(X25519PublicKey::from(&secret));
    KeyPair {
        public,
        secret: SecretKey(secret),
    }
}

/// Shared secret produced by a key agreement.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_SIZE]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SharedSecret {}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Compute the X25519 shared secret between our secret and a peer public key.
pub fn derive_shared_secret(secret: &SecretKey, peer_public: &PublicKey) -> CryptoResult<SharedSecret> {
    let shared = secret
        .0
        .diffie_hellman(&X25519PublicKey::from(*peer_public.as_bytes()));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPeerKey);
    }
    Ok(SharedSecret(*shared.as_bytes()))
}

/// Parse a public key given as 64 hex characters or standard base64.
pub fn parse_public_key(encoded: &str) -> CryptoResult<PublicKey> {
    let encoded = encoded.trim();

    let bytes = if encoded.len() == KEY_SIZE * 2 {
        hex::decode(encoded)
            .map_err(|e| CryptoError::InvalidPublicKeyFormat(format!("bad hex: {}", e)))?
    } else {
        BASE64.decode(encoded).map_err(|_| {
            CryptoError::InvalidPublicKeyFormat(format!(
                "expected 64 hex characters or base64 of 32 bytes, got {} characters",
                encoded.len()
            ))
        })?
    };

    let array = <[u8; KEY_SIZE]>::try_from(bytes.as_slice()).map_err(|_| {
        CryptoError::InvalidPublicKeyFormat(format!("expected 32 bytes, got {}", bytes.len()))
    })?;
    Ok(PublicKey(array))
}
