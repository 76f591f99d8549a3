//! Cryptographic primitives for the OmniCore identity engine.
//!
//! This crate is the stateless foundation every other OmniCore crate builds
//! on. Nothing in here holds long-lived state.
//!
//! # Core Capabilities
//!
//! - **Key Agreement**: X25519 keypairs and Diffie-Hellman shared secrets
//! - **Authenticated Encryption**: ChaCha20-Poly1305 with a fresh random
//!   96-bit nonce per message
//! - **Server Identity**: Ed25519 signing keys used by servers to prove
//!   possession of their advertised public key
//! - **Tokens**: unguessable bearer tokens and constant-time comparison
//!
//! # Security Principles
//!
//! - Never roll custom cryptographic primitives
//! - Shared secrets are long-lived per client, so a nonce is never reused:
//!   every `encrypt` call draws a new one from the OS RNG
//! - Low-order peer keys are rejected instead of producing a predictable secret
//! - Secret material is zeroized on drop and redacted from `Debug`
//! - Secrets must never be logged

pub mod aead;
pub mod error;
pub mod identity;
pub mod keys;
pub mod tokens;

pub use aead::{decrypt, encrypt, EncryptedMessage, Sealed, NONCE_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use identity::{derive_server_id, verify_signature, ServerIdentity, SERVER_ID_PREFIX};
pub use keys::{
    derive_shared_secret, generate_keypair, parse_public_key, KeyPair, PublicKey, SecretKey,
    SharedSecret, KEY_SIZE,
};
pub use tokens::{constant_time_eq, generate_token, random_bytes};
