//! This server's own federation identity.

use crate::descriptor::ServerDescriptor;
use crate::error::FederationResult;
use omnicore_core::{Clock, RecordKind, RecordStore, RecordStoreExt, ServerSettings};
use omnicore_crypto::ServerIdentity;
use serde::{Deserialize, Serialize};
use tracing::info;

const IDENTITY_RECORD_ID: &str = "local";

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    secret_key: String,
    public_key: String,
    server_id: String,
    created_at: u64,
}

/// Load the persisted server identity, generating one on first start so the
/// server id stays stable across restarts.
pub fn load_or_generate_identity(
    store: &dyn RecordStore,
    clock: &dyn Clock,
) -> FederationResult<ServerIdentity> {
    if let Some(stored) =
        store.get_json::<StoredIdentity>(RecordKind::ServerIdentity, IDENTITY_RECORD_ID)?
    {
        let identity = ServerIdentity::from_secret_hex(&stored.secret_key)?;
        info!(server_id = %identity.server_id(), "Loaded server identity");
        return Ok(identity);
    }

    let identity = ServerIdentity::generate();
    store.put_json(
        RecordKind::ServerIdentity,
        IDENTITY_RECORD_ID,
        &StoredIdentity {
            secret_key: identity.secret_hex().to_string(),
            public_key: identity.public_key_hex(),
            server_id: identity.server_id(),
            created_at: clock.now_ms(),
        },
    )?;
    info!(server_id = %identity.server_id(), "Generated new server identity");
    Ok(identity)
}

/// How this server describes itself to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalServerInfo {
    pub name: String,
    pub description: String,
    pub public_url: String,
    pub is_public: bool,
    pub version: String,
}

impl LocalServerInfo {
    pub fn from_settings(server: &ServerSettings, is_public: bool) -> Self {
        Self {
            name: server.name.clone(),
            description: server.description.clone(),
            public_url: server.public_url.clone(),
            is_public,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn descriptor(&self, identity: &ServerIdentity, now_ms: u64) -> ServerDescriptor {
        ServerDescriptor {
            server_id: identity.server_id(),
            name: self.name.clone(),
            description: self.description.clone(),
            public_url: self.public_url.clone(),
            public_key: identity.public_key_hex(),
            is_public: self.is_public,
            version: self.version.clone(),
            last_seen: now_ms,
        }
    }
}
