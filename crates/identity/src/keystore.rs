//! Per-client key store.
//!
//! Holds one server-side X25519 keypair per client id and derives the
//! client/server shared secret on demand. Every record lives in its own slot
//! guarded by its own mutex; the slot map lock is only held long enough to
//! find or insert a slot, so operations on different clients never wait on
//! each other. Each mutation is written through to the record store while
//! the slot is held, which keeps writes for one client ordered.

use crate::admin::ADMIN_SUBJECT;
use omnicore_core::{Clock, CoreError, RecordKind, RecordStore, RecordStoreExt};
use omnicore_crypto::{
    derive_shared_secret, generate_keypair, parse_public_key, CryptoError, PublicKey, SecretKey,
    SharedSecret,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Maximum accepted length of a client id.
pub const MAX_CLIENT_ID_LEN: usize = 128;

/// Errors raised by the key store.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("Invalid client id: {0}")]
    InvalidClientId(String),

    #[error("Client '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("No key record for client '{0}'")]
    NotFound(String),

    #[error("Registration for client '{0}' is not complete")]
    IncompleteRegistration(String),

    #[error("Invalid public key format: {0}")]
    InvalidPublicKeyFormat(String),

    /// Key confirmation or payload authentication failed
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] CoreError),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

pub type KeyStoreResult<T> = Result<T, KeyStoreError>;

/// Handshake progress of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    /// No record exists
    Unregistered,
    /// Server keypair issued, waiting for the client public key
    PendingServerKey,
    /// Client public key stored; the shared secret is derivable
    Completed,
}

/// Persisted key material for one client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientKeyRecord {
    pub client_id: String,
    /// Hex-encoded X25519 public key issued to the client
    pub server_public_key: String,
    /// Hex-encoded server-held secret scalar
    pub server_secret_key: String,
    #[serde(default)]
    pub client_public_key: Option<String>,
    pub created_at: u64,
    pub last_seen: u64,
    pub registration_complete: bool,
}

impl ClientKeyRecord {
    pub fn state(&self) -> RegistrationState {
        if self.registration_complete {
            RegistrationState::Completed
        } else {
            RegistrationState::PendingServerKey
        }
    }

    fn shared_secret(&self) -> KeyStoreResult<SharedSecret> {
        let client_key = match (&self.client_public_key, self.registration_complete) {
            (Some(key), true) => parse_public_key(key)?,
            _ => return Err(KeyStoreError::IncompleteRegistration(self.client_id.clone())),
        };
        let secret = SecretKey::from_hex(&self.server_secret_key)?;
        Ok(derive_shared_secret(&secret, &client_key)?)
    }
}

impl fmt::Debug for ClientKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKeyRecord")
            .field("client_id", &self.client_id)
            .field("server_public_key", &self.server_public_key)
            .field("server_secret_key", &"<redacted>")
            .field("client_public_key", &self.client_public_key)
            .field("created_at", &self.created_at)
            .field("last_seen", &self.last_seen)
            .field("registration_complete", &self.registration_complete)
            .finish()
    }
}

/// Record counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyStoreStats {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
}

type Slot = Arc<Mutex<Option<ClientKeyRecord>>>;

/// Validate a client id.
pub fn validate_client_id(client_id: &str) -> KeyStoreResult<()> {
    if client_id.trim().is_empty() {
        return Err(KeyStoreError::InvalidClientId(
            "client id must not be empty".to_string(),
        ));
    }
    if client_id.chars().count() > MAX_CLIENT_ID_LEN {
        return Err(KeyStoreError::InvalidClientId(format!(
            "client id exceeds {} characters",
            MAX_CLIENT_ID_LEN
        )));
    }
    // Session subjects share one namespace with the admin
    if client_id.trim().eq_ignore_ascii_case(ADMIN_SUBJECT) {
        return Err(KeyStoreError::InvalidClientId(format!(
            "'{}' is reserved",
            ADMIN_SUBJECT
        )));
    }
    Ok(())
}

/// Store of per-client keypairs.
pub struct ClientKeyStore {
    slots: RwLock<HashMap<String, Slot>>,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl ClientKeyStore {
    /// Open the key store, loading every decodable client record.
    pub fn open(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> KeyStoreResult<Self> {
        let loaded = store.load_all_json::<ClientKeyRecord>(RecordKind::Client)?;
        let mut slots = HashMap::with_capacity(loaded.records.len());
        for record in loaded.records {
            slots.insert(record.client_id.clone(), Arc::new(Mutex::new(Some(record))));
        }

        info!(
            clients = slots.len(),
            corrupt = loaded.corrupt.len(),
            "Loaded client key records"
        );

        Ok(Self {
            slots: RwLock::new(slots),
            store,
            clock,
        })
    }

    /// Issue (or re-issue) the server keypair for a client.
    ///
    /// A pending record is overwritten with a fresh keypair; a completed one
    /// is left untouched.
    pub fn generate_for_client(&self, client_id: &str) -> KeyStoreResult<PublicKey> {
        validate_client_id(client_id)?;
        loop {
            let slot = self.slot_or_insert(client_id)?;
            let guard = lock(&slot)?;
            // A concurrent remove may have detached this slot
            if !self.is_live(client_id, &slot)? {
                continue;
            }
            return self.issue_keypair(client_id, guard);
        }
    }

    fn issue_keypair(
        &self,
        client_id: &str,
        mut guard: MutexGuard<'_, Option<ClientKeyRecord>>,
    ) -> KeyStoreResult<PublicKey> {
        let created_at = match guard.as_ref() {
            Some(existing) if existing.registration_complete => {
                return Err(KeyStoreError::AlreadyRegistered(client_id.to_string()));
            }
            Some(existing) => Some(existing.created_at),
            None => None,
        };

        let keypair = generate_keypair();
        let now = self.clock.now_ms();
        let record = ClientKeyRecord {
            client_id: client_id.to_string(),
            server_public_key: keypair.public.to_hex(),
            server_secret_key: keypair.secret.to_hex().to_string(),
            client_public_key: None,
            created_at: created_at.unwrap_or(now),
            last_seen: now,
            registration_complete: false,
        };

        self.store.put_json(RecordKind::Client, client_id, &record)?;
        *guard = Some(record);

        debug!(client_id = %client_id, reissued = created_at.is_some(), "Issued server keypair");
        Ok(keypair.public)
    }

    /// Store the client's public key and mark the registration complete.
    pub fn complete_for_client(
        &self,
        client_id: &str,
        client_public_key: &str,
    ) -> KeyStoreResult<ClientKeyRecord> {
        self.complete_for_client_verified(client_id, client_public_key, |_| Ok(()))
    }

    /// Like [`complete_for_client`](Self::complete_for_client), but runs
    /// `verify` against the would-be shared secret before committing.
    ///
    /// The slot stays locked across `verify`, so a concurrent init cannot
    /// swap the keypair underneath it. If `verify` fails the record stays
    /// pending.
    pub fn complete_for_client_verified<F>(
        &self,
        client_id: &str,
        client_public_key: &str,
        verify: F,
    ) -> KeyStoreResult<ClientKeyRecord>
    where
        F: FnOnce(&SharedSecret) -> KeyStoreResult<()>,
    {
        let slot = self
            .existing_slot(client_id)?
            .ok_or_else(|| KeyStoreError::NotFound(client_id.to_string()))?;
        let mut guard = lock(&slot)?;
        let current = guard
            .as_ref()
            .ok_or_else(|| KeyStoreError::NotFound(client_id.to_string()))?;

        let client_key = parse_public_key(client_public_key)
            .map_err(|e| KeyStoreError::InvalidPublicKeyFormat(e.to_string()))?;
        client_key
            .check_contributory()
            .map_err(|_| KeyStoreError::InvalidPublicKeyFormat("low-order point".to_string()))?;

        if current.registration_complete {
            return Err(KeyStoreError::AlreadyRegistered(client_id.to_string()));
        }

        let server_secret = SecretKey::from_hex(&current.server_secret_key)?;
        let shared = derive_shared_secret(&server_secret, &client_key)
            .map_err(|_| KeyStoreError::InvalidPublicKeyFormat("low-order point".to_string()))?;
        verify(&shared)?;

        let mut record = current.clone();
        record.client_public_key = Some(client_key.to_hex());
        record.registration_complete = true;
        record.last_seen = self.clock.now_ms();

        self.store.put_json(RecordKind::Client, client_id, &record)?;
        *guard = Some(record.clone());

        info!(client_id = %client_id, "Client registration completed");
        Ok(record)
    }

    /// Derive the shared secret for a completed client.
    pub fn derive_secret_for_client(&self, client_id: &str) -> KeyStoreResult<SharedSecret> {
        let record = self
            .get(client_id)?
            .ok_or_else(|| KeyStoreError::NotFound(client_id.to_string()))?;
        record.shared_secret()
    }

    pub fn get(&self, client_id: &str) -> KeyStoreResult<Option<ClientKeyRecord>> {
        match self.existing_slot(client_id)? {
            Some(slot) => Ok(lock(&slot)?.clone()),
            None => Ok(None),
        }
    }

    /// All records, ordered by client id.
    pub fn list(&self) -> KeyStoreResult<Vec<ClientKeyRecord>> {
        let slots: Vec<Slot> = self
            .slots
            .read()
            .map_err(|_| poisoned("client slots"))?
            .values()
            .cloned()
            .collect();

        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(record) = lock(&slot)?.clone() {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(records)
    }

    pub fn state_of(&self, client_id: &str) -> KeyStoreResult<RegistrationState> {
        Ok(self
            .get(client_id)?
            .map(|record| record.state())
            .unwrap_or(RegistrationState::Unregistered))
    }

    /// Refresh `last_seen` for a client.
    pub fn touch(&self, client_id: &str) -> KeyStoreResult<()> {
        let slot = self
            .existing_slot(client_id)?
            .ok_or_else(|| KeyStoreError::NotFound(client_id.to_string()))?;
        let mut guard = lock(&slot)?;
        let record = guard
            .as_mut()
            .ok_or_else(|| KeyStoreError::NotFound(client_id.to_string()))?;

        let now = self.clock.now_ms();
        if now > record.last_seen {
            record.last_seen = now;
            self.store.put_json(RecordKind::Client, client_id, &*record)?;
        }
        Ok(())
    }

    /// Delete a client's key material and its slot. Returns whether a
    /// record existed.
    pub fn remove(&self, client_id: &str) -> KeyStoreResult<bool> {
        let Some(slot) = self.existing_slot(client_id)? else {
            return Ok(false);
        };
        let mut guard = lock(&slot)?;
        let existed = guard.is_some();
        if existed {
            self.store.remove(RecordKind::Client, client_id)?;
            *guard = None;
        }

        // Lock order is slot then map, same as generate_for_client
        let mut slots = self.slots.write().map_err(|_| poisoned("client slots"))?;
        if slots.get(client_id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
            slots.remove(client_id);
        }
        drop(slots);
        drop(guard);

        if existed {
            warn!(client_id = %client_id, "Client key record removed");
        }
        Ok(existed)
    }

    /// Number of slots held in memory, including empty ones.
    pub fn slot_count(&self) -> usize {
        self.slots.read().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> KeyStoreResult<KeyStoreStats> {
        let mut stats = KeyStoreStats::default();
        for record in self.list()? {
            stats.total += 1;
            if record.registration_complete {
                stats.completed += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }

    fn existing_slot(&self, client_id: &str) -> KeyStoreResult<Option<Slot>> {
        Ok(self
            .slots
            .read()
            .map_err(|_| poisoned("client slots"))?
            .get(client_id)
            .cloned())
    }

    fn is_live(&self, client_id: &str, slot: &Slot) -> KeyStoreResult<bool> {
        Ok(self
            .slots
            .read()
            .map_err(|_| poisoned("client slots"))?
            .get(client_id)
            .is_some_and(|s| Arc::ptr_eq(s, slot)))
    }

    fn slot_or_insert(&self, client_id: &str) -> KeyStoreResult<Slot> {
        if let Some(slot) = self.existing_slot(client_id)? {
            return Ok(slot);
        }
        let mut slots = self.slots.write().map_err(|_| poisoned("client slots"))?;
        Ok(slots
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone())
    }
}

fn lock(slot: &Slot) -> KeyStoreResult<MutexGuard<'_, Option<ClientKeyRecord>>> {
    slot.lock().map_err(|_| poisoned("client record"))
}

fn poisoned(what: &str) -> KeyStoreError {
    KeyStoreError::LockPoisoned(what.to_string())
}
