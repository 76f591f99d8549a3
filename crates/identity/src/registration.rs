//! Two-phase client registration handshake.
//!
//! ```text
//! Unregistered ──init──▶ PendingServerKey ──complete──▶ Completed
//!                         ▲         │
//!                         └──init───┘   (re-init issues a new keypair)
//! ```
//!
//! `init` hands the client a fresh server public key. `complete` stores the
//! client's public key, optionally checks that the client already derived
//! the same shared secret, and issues a session.

use crate::error::{IdentityError, IdentityResult};
use crate::keystore::{ClientKeyStore, KeyStoreError};
use crate::session::{Session, SessionIssuer};
pub use crate::keystore::RegistrationState;
use omnicore_crypto::{constant_time_eq, CryptoError, EncryptedMessage, PublicKey};
use std::sync::Arc;
use tracing::{info, warn};

/// Handshake driver over the key store and session issuer.
pub struct RegistrationEngine {
    keys: Arc<ClientKeyStore>,
    sessions: Arc<SessionIssuer>,
}

impl RegistrationEngine {
    pub fn new(keys: Arc<ClientKeyStore>, sessions: Arc<SessionIssuer>) -> Self {
        Self { keys, sessions }
    }

    pub fn state(&self, client_id: &str) -> IdentityResult<RegistrationState> {
        Ok(self.keys.state_of(client_id)?)
    }

    /// Start (or restart) a registration.
    pub fn init(&self, client_id: &str) -> IdentityResult<PublicKey> {
        let public = self.keys.generate_for_client(client_id)?;
        info!(client_id = %client_id, "Registration initiated");
        Ok(public)
    }

    /// Finish a registration and issue a session.
    ///
    /// With `key_confirmation`, the client proves it derived the shared
    /// secret by sending its own id encrypted under it.
    pub fn complete(
        &self,
        client_id: &str,
        client_public_key: &str,
        key_confirmation: Option<&EncryptedMessage>,
    ) -> IdentityResult<Session> {
        let result = self
            .keys
            .complete_for_client_verified(client_id, client_public_key, |shared| {
                let Some(confirmation) = key_confirmation else {
                    return Ok(());
                };
                let opened = confirmation.open(shared).map_err(|e| match e {
                    CryptoError::AuthenticationFailed => KeyStoreError::AuthenticationFailed,
                    other => KeyStoreError::Crypto(other),
                })?;
                if constant_time_eq(&opened, client_id.as_bytes()) {
                    Ok(())
                } else {
                    Err(KeyStoreError::AuthenticationFailed)
                }
            });

        match result {
            Ok(_) => {}
            Err(KeyStoreError::NotFound(id)) => {
                return Err(IdentityError::NoPendingRegistration(id));
            }
            Err(KeyStoreError::AuthenticationFailed) => {
                warn!(client_id = %client_id, "Key confirmation failed");
                return Err(KeyStoreError::AuthenticationFailed.into());
            }
            Err(other) => return Err(other.into()),
        }

        Ok(self.sessions.issue(client_id, false)?)
    }

    /// Encrypt a payload for a registered client.
    pub fn seal_for_client(&self, client_id: &str, plaintext: &[u8]) -> IdentityResult<EncryptedMessage> {
        let secret = self.keys.derive_secret_for_client(client_id)?;
        EncryptedMessage::seal(plaintext, &secret)
            .map_err(|e| IdentityError::KeyStore(KeyStoreError::Crypto(e)))
    }

    /// Decrypt a payload sent by a registered client.
    pub fn open_for_client(&self, client_id: &str, message: &EncryptedMessage) -> IdentityResult<Vec<u8>> {
        let secret = self.keys.derive_secret_for_client(client_id)?;
        message.open(&secret).map_err(|e| match e {
            CryptoError::AuthenticationFailed => KeyStoreError::AuthenticationFailed.into(),
            other => KeyStoreError::Crypto(other).into(),
        })
    }
}
