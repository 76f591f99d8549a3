//! Identity service facade.
//!
//! Bundles the key store, session issuer, registration engine and admin
//! authenticator behind one handle that a transport layer can share.

use crate::admin::{AdminAuthenticator, AdminCredential};
use crate::error::IdentityResult;
use crate::keystore::{ClientKeyRecord, ClientKeyStore, KeyStoreError, KeyStoreStats};
use crate::registration::RegistrationEngine;
use crate::session::{Session, SessionIssuer, SessionPolicy};
use omnicore_core::{AuthSettings, Clock, RecordStore};
use std::sync::Arc;
use tracing::{debug, info};

pub struct IdentityService {
    keys: Arc<ClientKeyStore>,
    sessions: Arc<SessionIssuer>,
    registration: RegistrationEngine,
    admin: AdminAuthenticator,
}

impl IdentityService {
    /// Open the service over a record store, loading client records and the
    /// admin credential (generated on first start).
    pub fn open(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        settings: &AuthSettings,
    ) -> IdentityResult<Self> {
        let credential = AdminCredential::load_or_generate(store.as_ref(), clock.as_ref())?;
        Self::with_credential(store, clock, settings, credential)
    }

    pub fn with_credential(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        settings: &AuthSettings,
        credential: AdminCredential,
    ) -> IdentityResult<Self> {
        let keys = Arc::new(ClientKeyStore::open(store, clock.clone())?);
        let sessions = Arc::new(SessionIssuer::new(SessionPolicy::from(settings), clock));
        let registration = RegistrationEngine::new(keys.clone(), sessions.clone());
        let admin = AdminAuthenticator::new(credential, sessions.clone());

        Ok(Self {
            keys,
            sessions,
            registration,
            admin,
        })
    }

    pub fn keys(&self) -> &ClientKeyStore {
        &self.keys
    }

    pub fn sessions(&self) -> &SessionIssuer {
        &self.sessions
    }

    pub fn registration(&self) -> &RegistrationEngine {
        &self.registration
    }

    pub fn admin(&self) -> &AdminAuthenticator {
        &self.admin
    }

    /// Validate a bearer token and refresh the client's `last_seen`.
    pub fn verify_session(&self, token: &str) -> IdentityResult<Session> {
        let session = self.sessions.validate(token)?;
        if !session.is_admin {
            match self.keys.touch(&session.subject) {
                Ok(()) | Err(KeyStoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(session)
    }

    pub fn logout(&self, token: &str) -> IdentityResult<()> {
        Ok(self.sessions.revoke(token)?)
    }

    /// Admin: list every client record.
    pub fn list_clients(&self, admin_token: &str) -> IdentityResult<Vec<ClientKeyRecord>> {
        self.admin.authorize(admin_token)?;
        Ok(self.keys.list()?)
    }

    /// Admin: client counts by state.
    pub fn client_stats(&self, admin_token: &str) -> IdentityResult<KeyStoreStats> {
        self.admin.authorize(admin_token)?;
        Ok(self.keys.stats()?)
    }

    /// Admin: remove a client and revoke its sessions.
    pub fn remove_client(&self, admin_token: &str, client_id: &str) -> IdentityResult<bool> {
        self.admin.authorize(admin_token)?;
        let removed = self.keys.remove(client_id)?;
        let revoked = self.sessions.revoke_subject(client_id)?;
        info!(client_id = %client_id, removed, revoked, "Admin removed client");
        Ok(removed)
    }

    /// Drop expired sessions. Called periodically by the host.
    pub fn purge_expired_sessions(&self) -> IdentityResult<usize> {
        let purged = self.sessions.purge_expired()?;
        if purged > 0 {
            debug!(purged, "Purged expired sessions");
        }
        Ok(purged)
    }
}
