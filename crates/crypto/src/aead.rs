//! ChaCha20-Poly1305 authenticated encryption keyed by an X25519 shared secret.
//!
//! The shared secret between a client and this server is derived once and
//! reused for the lifetime of the registration. Nonce reuse under a fixed
//! ChaCha20-Poly1305 key leaks the keystream and the Poly1305 key, so every
//! call to [`encrypt`] draws a fresh 96-bit nonce from the OS RNG.

use crate::error::{CryptoError, CryptoResult};
use crate::keys::SharedSecret;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

/// Nonce size for ChaCha20-Poly1305 (96 bits / 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size appended to every ciphertext.
const TAG_SIZE: usize = 16;

/// Nonce and ciphertext (with tag) produced by [`encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

fn cipher_for(shared_secret: &SharedSecret) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(shared_secret.as_bytes()))
}

/// Encrypt plaintext with authenticated encryption.
pub fn encrypt(plaintext: &[u8], shared_secret: &SharedSecret) -> CryptoResult<Sealed> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher_for(shared_secret)
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Sealed { nonce, ciphertext })
}

/// Decrypt and authenticate.
///
/// Any tag mismatch yields `AuthenticationFailed`; no plaintext is returned.
pub fn decrypt(
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    shared_secret: &SharedSecret,
) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::AuthenticationFailed);
    }
    cipher_for(shared_secret)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Wire form of a sealed message: base64 nonce and base64 ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub nonce: String,
    pub ciphertext: String,
}

impl EncryptedMessage {
    /// Encrypt `plaintext` and encode the result for transport.
    pub fn seal(plaintext: &[u8], shared_secret: &SharedSecret) -> CryptoResult<Self> {
        Ok(Self::from(encrypt(plaintext, shared_secret)?))
    }

    /// Decode and decrypt.
    pub fn open(&self, shared_secret: &SharedSecret) -> CryptoResult<Vec<u8>> {
        let sealed = self.decode()?;
        decrypt(&sealed.nonce, &sealed.ciphertext, shared_secret)
    }

    /// Decode the base64 fields without decrypting.
    pub fn decode(&self) -> CryptoResult<Sealed> {
        let nonce_bytes = BASE64
            .decode(&self.nonce)
            .map_err(|e| CryptoError::InvalidNonce(e.to_string()))?;
        let nonce = <[u8; NONCE_SIZE]>::try_from(nonce_bytes.as_slice()).map_err(|_| {
            CryptoError::InvalidNonce(format!(
                "expected {} bytes, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            ))
        })?;
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        Ok(Sealed { nonce, ciphertext })
    }
}

impl From<Sealed> for EncryptedMessage {
    fn from(sealed: Sealed) -> Self {
        Self {
            nonce: BASE64.encode(sealed.nonce),
            ciphertext: BASE64.encode(sealed.ciphertext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{derive_shared_secret, generate_keypair};

    fn shared_pair() -> (SharedSecret, SharedSecret) {
        let client = generate_keypair();
        let server = generate_keypair();
        (
            derive_shared_secret(&client.secret, &server.public).unwrap(),
            derive_shared_secret(&server.secret, &client.public).unwrap(),
        )
    }

    #[test]
    fn test_encrypt_decrypt_across_parties() {
        let (client_secret, server_secret) = shared_pair();

        let plaintext = b"Secret message for testing";
        let sealed = encrypt(plaintext, &client_secret).unwrap();
        assert_ne!(sealed.ciphertext.as_slice(), plaintext.as_slice());
        assert_eq!(sealed.ciphertext.len(), plaintext.len() + TAG_SIZE);

        let decrypted = decrypt(&sealed.nonce, &sealed.ciphertext, &server_secret).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_plaintext() {
        let (secret, _) = shared_pair();
        let sealed = encrypt(b"", &secret).unwrap();
        assert_eq!(decrypt(&sealed.nonce, &sealed.ciphertext, &secret).unwrap(), b"");
    }

    #[test]
    fn test_fresh_nonce_per_message() {
        let (secret, _) = shared_pair();
        let a = encrypt(b"same", &secret).unwrap();
        let b = encrypt(b"same", &secret).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (secret, _) = shared_pair();
        let mut sealed = encrypt(b"Secret message", &secret).unwrap();
        if let Some(byte) = sealed.ciphertext.first_mut() {
            *byte ^= 0xFF;
        }
        assert_eq!(
            decrypt(&sealed.nonce, &sealed.ciphertext, &secret),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let (secret, _) = shared_pair();
        let mut sealed = encrypt(b"Secret message", &secret).unwrap();
        sealed.nonce[0] ^= 0x01;
        assert_eq!(
            decrypt(&sealed.nonce, &sealed.ciphertext, &secret),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_wrong_secret_fails() {
        let (secret, _) = shared_pair();
        let (other, _) = shared_pair();
        let sealed = encrypt(b"for the right peer only", &secret).unwrap();
        assert_eq!(
            decrypt(&sealed.nonce, &sealed.ciphertext, &other),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let (secret, _) = shared_pair();
        let sealed = encrypt(b"x", &secret).unwrap();
        assert_eq!(
            decrypt(&sealed.nonce, &sealed.ciphertext[..4], &secret),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_encrypted_message_wire_form() {
        let (client_secret, server_secret) = shared_pair();
        let message = EncryptedMessage::seal(b"Hello, World!", &client_secret).unwrap();

        let json = serde_json::to_string(&message).unwrap();
        let parsed: EncryptedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.open(&server_secret).unwrap(), b"Hello, World!");
    }

    #[test]
    fn test_encrypted_message_bad_nonce_encoding() {
        let (secret, _) = shared_pair();
        let mut message = EncryptedMessage::seal(b"payload", &secret).unwrap();
        message.nonce = BASE64.encode([0u8; 8]);
        assert!(matches!(message.open(&secret), Err(CryptoError::InvalidNonce(_))));
    }
}
