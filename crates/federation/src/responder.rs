//! Server side of federation: what we do when a peer contacts us.

use crate::descriptor::{KnownServer, ServerDescriptor, DEFAULT_TRUST_LEVEL};
use crate::error::{FederationError, FederationResult};
use crate::local::LocalServerInfo;
use crate::proof::{ChallengeResponse, PeerChallenge, SyncRequest, SyncResponse};
use crate::registry::{RegisterOutcome, ServerRegistry};
use omnicore_core::Clock;
use omnicore_crypto::ServerIdentity;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct FederationResponder {
    registry: Arc<ServerRegistry>,
    identity: Arc<ServerIdentity>,
    info: LocalServerInfo,
    clock: Arc<dyn Clock>,
    max_servers_per_sync: usize,
}

impl FederationResponder {
    pub fn new(
        registry: Arc<ServerRegistry>,
        identity: Arc<ServerIdentity>,
        info: LocalServerInfo,
        clock: Arc<dyn Clock>,
        max_servers_per_sync: usize,
    ) -> Self {
        Self {
            registry,
            identity,
            info,
            clock,
            max_servers_per_sync,
        }
    }

    pub fn local_descriptor(&self) -> ServerDescriptor {
        self.info.descriptor(&self.identity, self.clock.now_ms())
    }

    /// A peer announcing itself.
    pub fn register_server(&self, descriptor: &ServerDescriptor) -> FederationResult<RegisterOutcome> {
        descriptor.validate()?;
        if descriptor.server_id == self.identity.server_id() {
            return Err(FederationError::InvalidDescriptor(
                "cannot register the local server".to_string(),
            ));
        }

        let candidate =
            KnownServer::from_descriptor(descriptor, DEFAULT_TRUST_LEVEL, self.clock.now_ms());
        let outcome = self.registry.register(candidate)?;
        info!(server_id = %descriptor.server_id, outcome = ?outcome, "Server registration request");
        Ok(outcome)
    }

    pub fn answer_challenge(&self, challenge: &PeerChallenge) -> ChallengeResponse {
        debug!(challenger = %challenge.challenger_id, "Answering peer challenge");
        challenge.answer(&self.identity)
    }

    /// Serve our public snapshot to an authenticated peer.
    pub fn handle_sync_request(&self, request: &SyncRequest) -> FederationResult<SyncResponse> {
        let requester = match self.registry.get(&request.requesting_server_id)? {
            Some(server) if server.is_authenticated => server,
            _ => {
                warn!(
                    requester = %request.requesting_server_id,
                    "Sync request from unauthenticated server"
                );
                return Err(FederationError::PeerNotAuthenticated(
                    request.requesting_server_id.clone(),
                ));
            }
        };

        request.verify(
            &requester.public_key,
            &self.identity.server_id(),
            self.clock.now_ms(),
        )?;

        let servers = self.registry.snapshot(self.max_servers_per_sync)?;
        self.registry.mark_synced(&requester.server_id)?;

        debug!(
            requester = %requester.server_id,
            entries = servers.len(),
            "Served sync snapshot"
        );
        Ok(SyncResponse {
            server: self.local_descriptor(),
            servers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MAX_TRUST_LEVEL;
    use crate::proof::SYNC_MAX_AGE_MS;
    use omnicore_core::{ManualClock, MemoryRecordStore};

    const NOW: u64 = 1_700_000_000_000;

    fn responder(clock: Arc<ManualClock>) -> (FederationResponder, Arc<ServerRegistry>) {
        let registry = Arc::new(
            ServerRegistry::open(Arc::new(MemoryRecordStore::new()), clock.clone(), 10).unwrap(),
        );
        let info = LocalServerInfo {
            name: "home".to_string(),
            description: String::new(),
            public_url: "https://home.example.org".to_string(),
            is_public: true,
            version: "test".to_string(),
        };
        let responder = FederationResponder::new(
            registry.clone(),
            Arc::new(ServerIdentity::generate()),
            info,
            clock,
            10,
        );
        (responder, registry)
    }

    fn peer_descriptor(identity: &ServerIdentity) -> ServerDescriptor {
        ServerDescriptor {
            server_id: identity.server_id(),
            name: "peer".to_string(),
            description: String::new(),
            public_url: "https://peer.example.org".to_string(),
            public_key: identity.public_key_hex(),
            is_public: true,
            version: "test".to_string(),
            last_seen: NOW,
        }
    }

    #[test]
    fn test_register_server_uses_default_trust() {
        let clock = Arc::new(ManualClock::new(NOW));
        let (responder, registry) = responder(clock);
        let peer = ServerIdentity::generate();

        let outcome = responder.register_server(&peer_descriptor(&peer)).unwrap();
        assert_eq!(outcome, RegisterOutcome::Created);

        let stored = registry.get(&peer.server_id()).unwrap().unwrap();
        assert_eq!(stored.trust_level, DEFAULT_TRUST_LEVEL);
        assert!(stored.trust_level < MAX_TRUST_LEVEL);
        assert!(!stored.is_authenticated);
    }

    #[test]
    fn test_register_rejects_own_id_and_bad_descriptor() {
        let clock = Arc::new(ManualClock::new(NOW));
        let (responder, _) = responder(clock);

        let own = responder.local_descriptor();
        assert!(matches!(
            responder.register_server(&own),
            Err(FederationError::InvalidDescriptor(_))
        ));

        let mut bad = peer_descriptor(&ServerIdentity::generate());
        bad.public_url = "ftp://peer.example.org".to_string();
        assert!(matches!(
            responder.register_server(&bad),
            Err(FederationError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_sync_requires_authenticated_requester() {
        let clock = Arc::new(ManualClock::new(NOW));
        let (responder, registry) = responder(clock);
        let peer = ServerIdentity::generate();
        let local_id = responder.local_descriptor().server_id;

        let request = SyncRequest::sign(&peer, &local_id, NOW);
        assert!(matches!(
            responder.handle_sync_request(&request),
            Err(FederationError::PeerNotAuthenticated(_))
        ));

        responder.register_server(&peer_descriptor(&peer)).unwrap();
        assert!(matches!(
            responder.handle_sync_request(&request),
            Err(FederationError::PeerNotAuthenticated(_))
        ));

        registry.mark_authenticated(&peer.server_id()).unwrap();
        let response = responder.handle_sync_request(&request).unwrap();
        assert_eq!(response.server.server_id, local_id);
        assert_eq!(response.servers.len(), 1);
        assert!(registry.get(&peer.server_id()).unwrap().unwrap().last_sync >= NOW);
    }

    #[test]
    fn test_sync_rejects_stale_or_forged_request() {
        let clock = Arc::new(ManualClock::new(NOW));
        let (responder, registry) = responder(clock.clone());
        let peer = ServerIdentity::generate();
        let local_id = responder.local_descriptor().server_id;
        responder.register_server(&peer_descriptor(&peer)).unwrap();
        registry.mark_authenticated(&peer.server_id()).unwrap();

        let stale = SyncRequest::sign(&peer, &local_id, NOW - SYNC_MAX_AGE_MS - 1);
        assert!(matches!(
            responder.handle_sync_request(&stale),
            Err(FederationError::AuthenticationFailed(_))
        ));

        // Signed by someone else in the peer's name
        let mut forged = SyncRequest::sign(&ServerIdentity::generate(), &local_id, NOW);
        forged.requesting_server_id = peer.server_id();
        assert!(matches!(
            responder.handle_sync_request(&forged),
            Err(FederationError::AuthenticationFailed(_))
        ));
    }
}
