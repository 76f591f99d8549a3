//! Registry of known peer servers.
//!
//! The registry is bounded by `max_known_servers`. A new id beyond the cap
//! is rejected; updates to an existing id always go through. Merges never
//! lower trust or move timestamps backwards, and a remote claim can never
//! mark a server authenticated.
//!
//! When the same public key shows up under a second server id, the record
//! discovered more recently wins. The loser leaves the directory but its id
//! is kept as an alias that resolves to the winner. A record this node has
//! authenticated is never displaced by an unproven duplicate. Aliases share
//! the `max_known_servers` cap and the oldest is dropped first.
//!
//! All writes take one registry-wide write lock: the capacity check and the
//! public key scan both need the complete view.

use crate::descriptor::{KnownServer, ServerDescriptor, AUTHENTICATED_TRUST_FLOOR, MAX_TRUST_LEVEL};
use crate::error::{FederationError, FederationResult};
use omnicore_core::{Clock, RecordKind, RecordStore, RecordStoreExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Result of a [`ServerRegistry::register`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    Updated,
    /// Replaced an older record holding the same public key
    Superseded { previous: String },
    Rejected(RejectReason),
}

impl RegisterOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, RegisterOutcome::Rejected(_))
    }

    /// Turn a rejection into an error.
    pub fn into_result(self, server_id: &str) -> FederationResult<Self> {
        match self {
            RegisterOutcome::Rejected(reason) => Err(reason.into_error(server_id)),
            accepted => Ok(accepted),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    CapacityExceeded { max: usize },
    KeyMismatch,
    Stale { by: String },
}

impl RejectReason {
    pub fn into_error(self, server_id: &str) -> FederationError {
        match self {
            RejectReason::CapacityExceeded { max } => FederationError::CapacityExceeded { max },
            RejectReason::KeyMismatch => FederationError::KeyMismatch {
                server_id: server_id.to_string(),
            },
            RejectReason::Stale { by } => FederationError::Stale { by },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFilter {
    Public,
    All,
    Authenticated,
}

impl ServerFilter {
    fn matches(&self, server: &KnownServer) -> bool {
        match self {
            ServerFilter::Public => server.is_public,
            ServerFilter::All => true,
            ServerFilter::Authenticated => server.is_authenticated,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub public_count: usize,
    pub authenticated_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AliasRecord {
    alias: String,
    target: String,
    #[serde(default)]
    created_at: u64,
}

#[derive(Default)]
struct RegistryInner {
    servers: HashMap<String, KnownServer>,
    /// Superseded id -> current id
    aliases: HashMap<String, AliasRecord>,
}

impl RegistryInner {
    fn alias_target(&self, server_id: &str) -> Option<&str> {
        self.aliases.get(server_id).map(|a| a.target.as_str())
    }

    fn oldest_alias(&self) -> Option<String> {
        self.aliases
            .values()
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.alias.cmp(&b.alias)))
            .map(|a| a.alias.clone())
    }

    fn id_for_key(&self, public_key: &str, except: &str) -> Option<String> {
        self.servers
            .values()
            .find(|s| s.server_id != except && s.public_key == public_key)
            .map(|s| s.server_id.clone())
    }
}

pub struct ServerRegistry {
    inner: RwLock<RegistryInner>,
    max_known_servers: usize,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl ServerRegistry {
    /// Open the registry, loading every decodable server and alias record.
    pub fn open(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        max_known_servers: usize,
    ) -> FederationResult<Self> {
        let servers = store.load_all_json::<KnownServer>(RecordKind::Server)?;
        let aliases = store.load_all_json::<AliasRecord>(RecordKind::ServerAlias)?;

        let mut inner = RegistryInner::default();
        for server in servers.records {
            inner.servers.insert(server.server_id.clone(), server);
        }
        for alias in aliases.records {
            inner.aliases.insert(alias.alias.clone(), alias);
        }

        if inner.servers.len() > max_known_servers {
            warn!(
                loaded = inner.servers.len(),
                max_known_servers, "Registry holds more servers than the configured cap"
            );
        }
        info!(
            servers = inner.servers.len(),
            aliases = inner.aliases.len(),
            corrupt = servers.corrupt.len() + aliases.corrupt.len(),
            "Loaded server registry"
        );

        Ok(Self {
            inner: RwLock::new(inner),
            max_known_servers,
            store,
            clock,
        })
    }

    pub fn max_known_servers(&self) -> usize {
        self.max_known_servers
    }

    /// Insert or merge a server.
    pub fn register(&self, candidate: KnownServer) -> FederationResult<RegisterOutcome> {
        candidate.descriptor().validate()?;
        let mut candidate = candidate;
        candidate.public_key = candidate.public_key.trim().to_ascii_lowercase();
        candidate.trust_level = candidate.trust_level.min(MAX_TRUST_LEVEL);
        candidate.is_authenticated = false;

        let mut inner = self.write()?;

        if let Some(target) = inner.alias_target(&candidate.server_id) {
            debug!(server_id = %candidate.server_id, by = %target, "Rejected superseded server id");
            return Ok(RegisterOutcome::Rejected(RejectReason::Stale {
                by: target.to_string(),
            }));
        }

        if let Some(existing) = inner.servers.get(&candidate.server_id) {
            if existing.public_key != candidate.public_key {
                warn!(server_id = %candidate.server_id, "Rejected server with mismatched public key");
                return Ok(RegisterOutcome::Rejected(RejectReason::KeyMismatch));
            }
            let merged = merge(existing, &candidate);
            self.store
                .put_json(RecordKind::Server, &merged.server_id, &merged)?;
            inner.servers.insert(merged.server_id.clone(), merged);
            return Ok(RegisterOutcome::Updated);
        }

        if let Some(previous_id) = inner.id_for_key(&candidate.public_key, &candidate.server_id) {
            let (previous_discovered, previous_authenticated) = inner
                .servers
                .get(&previous_id)
                .map(|s| (s.discovered_at, s.is_authenticated))
                .unwrap_or((0, false));
            if previous_authenticated {
                warn!(
                    server_id = %candidate.server_id,
                    by = %previous_id,
                    "Rejected unproven duplicate of an authenticated server key"
                );
                return Ok(RegisterOutcome::Rejected(RejectReason::Stale { by: previous_id }));
            }
            if candidate.discovered_at <= previous_discovered {
                debug!(server_id = %candidate.server_id, by = %previous_id, "Rejected stale duplicate key");
                return Ok(RegisterOutcome::Rejected(RejectReason::Stale { by: previous_id }));
            }

            self.supersede(&mut inner, &previous_id, &candidate.server_id)?;
            self.store
                .put_json(RecordKind::Server, &candidate.server_id, &candidate)?;
            info!(
                server_id = %candidate.server_id,
                previous = %previous_id,
                "Server superseded older record with the same key"
            );
            inner.servers.insert(candidate.server_id.clone(), candidate);
            return Ok(RegisterOutcome::Superseded {
                previous: previous_id,
            });
        }

        if inner.servers.len() >= self.max_known_servers {
            warn!(
                server_id = %candidate.server_id,
                max_known_servers = self.max_known_servers,
                "Rejected server: registry full"
            );
            return Ok(RegisterOutcome::Rejected(RejectReason::CapacityExceeded {
                max: self.max_known_servers,
            }));
        }

        self.store
            .put_json(RecordKind::Server, &candidate.server_id, &candidate)?;
        info!(server_id = %candidate.server_id, name = %candidate.name, "Registered new server");
        inner.servers.insert(candidate.server_id.clone(), candidate);
        Ok(RegisterOutcome::Created)
    }

    /// Remove `previous` and point its id (and any alias already pointing at
    /// it) to `current`, then evict the oldest aliases beyond the cap.
    fn supersede(
        &self,
        inner: &mut RegistryInner,
        previous: &str,
        current: &str,
    ) -> FederationResult<()> {
        self.store.remove(RecordKind::Server, previous)?;
        inner.servers.remove(previous);

        // Strictly increasing so eviction follows insertion order
        let created_at = inner
            .aliases
            .values()
            .map(|a| a.created_at.saturating_add(1))
            .max()
            .unwrap_or(0)
            .max(self.clock.now_ms());
        let mut redirected: Vec<AliasRecord> = inner
            .aliases
            .values()
            .filter(|a| a.target == previous)
            .cloned()
            .collect();
        redirected.push(AliasRecord {
            alias: previous.to_string(),
            target: previous.to_string(),
            created_at,
        });
        for mut record in redirected {
            record.target = current.to_string();
            self.store
                .put_json(RecordKind::ServerAlias, &record.alias, &record)?;
            inner.aliases.insert(record.alias.clone(), record);
        }

        while inner.aliases.len() > self.max_known_servers {
            let Some(oldest) = inner.oldest_alias() else {
                break;
            };
            self.store.remove(RecordKind::ServerAlias, &oldest)?;
            inner.aliases.remove(&oldest);
            debug!(alias = %oldest, "Evicted oldest server alias");
        }
        Ok(())
    }

    pub fn alias_count(&self) -> usize {
        self.read().map(|inner| inner.aliases.len()).unwrap_or(0)
    }

    /// Set the authenticated flag and raise trust to the authenticated floor.
    pub fn mark_authenticated(&self, server_id: &str) -> FederationResult<()> {
        let now = self.clock.now_ms();
        self.update(server_id, |server| {
            server.is_authenticated = true;
            server.trust_level = server.trust_level.max(AUTHENTICATED_TRUST_FLOOR);
            server.last_seen = server.last_seen.max(now);
        })?;
        info!(server_id = %server_id, "Peer authenticated");
        Ok(())
    }

    /// Record a completed sync exchange with a peer.
    pub fn mark_synced(&self, server_id: &str) -> FederationResult<()> {
        let now = self.clock.now_ms();
        self.update(server_id, |server| {
            server.last_sync = server.last_sync.max(now);
            server.last_seen = server.last_seen.max(now);
        })
    }

    pub fn touch(&self, server_id: &str) -> FederationResult<()> {
        let now = self.clock.now_ms();
        self.update(server_id, |server| {
            server.last_seen = server.last_seen.max(now);
        })
    }

    /// Admin override. Unlike merges, this may lower trust.
    pub fn set_trust_level(&self, server_id: &str, trust_level: u8) -> FederationResult<()> {
        if trust_level > MAX_TRUST_LEVEL {
            return Err(FederationError::InvalidTrustLevel(trust_level));
        }
        self.update(server_id, |server| server.trust_level = trust_level)?;
        info!(server_id = %server_id, trust_level, "Trust level overridden");
        Ok(())
    }

    /// Remove a server and every alias pointing at it.
    pub fn deregister(&self, server_id: &str) -> FederationResult<bool> {
        let mut inner = self.write()?;
        if !inner.servers.contains_key(server_id) {
            return Ok(false);
        }

        self.store.remove(RecordKind::Server, server_id)?;
        inner.servers.remove(server_id);

        let dangling: Vec<String> = inner
            .aliases
            .iter()
            .filter(|(_, record)| record.target == server_id)
            .map(|(alias, _)| alias.clone())
            .collect();
        for alias in dangling {
            self.store.remove(RecordKind::ServerAlias, &alias)?;
            inner.aliases.remove(&alias);
        }

        info!(server_id = %server_id, "Server deregistered");
        Ok(true)
    }

    pub fn get(&self, server_id: &str) -> FederationResult<Option<KnownServer>> {
        Ok(self.read()?.servers.get(server_id).cloned())
    }

    /// Look up a server, following a superseded alias if needed.
    pub fn resolve(&self, server_id: &str) -> FederationResult<Option<KnownServer>> {
        let inner = self.read()?;
        let id = inner.alias_target(server_id).unwrap_or(server_id);
        Ok(inner.servers.get(id).cloned())
    }

    /// Servers matching `filter`, ordered by server id.
    pub fn list(&self, filter: ServerFilter) -> FederationResult<Vec<KnownServer>> {
        let mut servers: Vec<KnownServer> = self
            .read()?
            .servers
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        Ok(servers)
    }

    /// Public entries to hand to a peer, most recently seen first.
    pub fn snapshot(&self, limit: usize) -> FederationResult<Vec<ServerDescriptor>> {
        let inner = self.read()?;
        let mut public: Vec<&KnownServer> =
            inner.servers.values().filter(|s| s.is_public).collect();
        public.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.server_id.cmp(&b.server_id))
        });
        Ok(public
            .into_iter()
            .take(limit)
            .map(KnownServer::descriptor)
            .collect())
    }

    pub fn stats(&self) -> FederationResult<RegistryStats> {
        let inner = self.read()?;
        Ok(RegistryStats {
            total: inner.servers.len(),
            public_count: inner.servers.values().filter(|s| s.is_public).count(),
            authenticated_count: inner
                .servers
                .values()
                .filter(|s| s.is_authenticated)
                .count(),
        })
    }

    pub fn len(&self) -> usize {
        self.read().map(|inner| inner.servers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update<F>(&self, server_id: &str, apply: F) -> FederationResult<()>
    where
        F: FnOnce(&mut KnownServer),
    {
        let mut inner = self.write()?;
        let mut server = inner
            .servers
            .get(server_id)
            .cloned()
            .ok_or_else(|| FederationError::NotFound(server_id.to_string()))?;
        apply(&mut server);
        self.store.put_json(RecordKind::Server, server_id, &server)?;
        inner.servers.insert(server_id.to_string(), server);
        Ok(())
    }

    fn read(&self) -> FederationResult<RwLockReadGuard<'_, RegistryInner>> {
        self.inner
            .read()
            .map_err(|_| FederationError::LockPoisoned("server registry".to_string()))
    }

    fn write(&self) -> FederationResult<RwLockWriteGuard<'_, RegistryInner>> {
        self.inner
            .write()
            .map_err(|_| FederationError::LockPoisoned("server registry".to_string()))
    }
}

fn merge(existing: &KnownServer, candidate: &KnownServer) -> KnownServer {
    KnownServer {
        server_id: existing.server_id.clone(),
        name: candidate.name.clone(),
        description: candidate.description.clone(),
        public_url: candidate.public_url.clone(),
        public_key: existing.public_key.clone(),
        is_public: candidate.is_public,
        is_authenticated: existing.is_authenticated,
        discovered_at: existing.discovered_at,
        last_seen: existing.last_seen.max(candidate.last_seen),
        last_sync: existing.last_sync.max(candidate.last_sync),
        version: candidate.version.clone(),
        trust_level: existing.trust_level.max(candidate.trust_level),
    }
}
