//! Peer authentication.

use crate::descriptor::KnownServer;
use crate::error::FederationResult;
use crate::proof::PeerChallenge;
use crate::transport::PeerTransport;
use async_trait::async_trait;
use omnicore_core::Clock;
use omnicore_crypto::ServerIdentity;
use std::sync::Arc;

/// Decides whether a known peer really holds the key we have on record.
#[async_trait]
pub trait PeerAuthenticator: Send + Sync {
    /// `Ok(())` when the peer proved its identity.
    async fn authenticate(&self, peer: &KnownServer) -> FederationResult<()>;
}

/// Signed-challenge authenticator.
pub struct ChallengeAuthenticator {
    identity: Arc<ServerIdentity>,
    transport: Arc<dyn PeerTransport>,
    clock: Arc<dyn Clock>,
}

impl ChallengeAuthenticator {
    pub fn new(
        identity: Arc<ServerIdentity>,
        transport: Arc<dyn PeerTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity,
            transport,
            clock,
        }
    }
}

#[async_trait]
impl PeerAuthenticator for ChallengeAuthenticator {
    async fn authenticate(&self, peer: &KnownServer) -> FederationResult<()> {
        let challenge = PeerChallenge::new(&self.identity.server_id(), self.clock.now_ms());
        let response = self.transport.respond_to_challenge(peer, &challenge).await?;
        challenge.verify(&response, &peer.server_id, &peer.public_key)
    }
}
