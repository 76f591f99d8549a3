//! Network seam between the sync service and remote peers.

use crate::descriptor::KnownServer;
use crate::error::{FederationError, FederationResult};
use crate::proof::{ChallengeResponse, PeerChallenge, SyncRequest, SyncResponse};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::debug;

pub const CHALLENGE_PATH: &str = "/api/v1/servers/challenge";
pub const SYNC_PATH: &str = "/api/v1/servers/sync";

/// One network round trip per call.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn respond_to_challenge(
        &self,
        peer: &KnownServer,
        challenge: &PeerChallenge,
    ) -> FederationResult<ChallengeResponse>;

    async fn fetch_snapshot(
        &self,
        peer: &KnownServer,
        request: &SyncRequest,
    ) -> FederationResult<SyncResponse>;
}

/// JSON-over-HTTP transport.
pub struct HttpPeerTransport {
    client: reqwest::Client,
}

impl HttpPeerTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> FederationResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| FederationError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    async fn post<Req, Resp>(&self, peer: &KnownServer, path: &str, body: &Req) -> FederationResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", peer.public_url.trim_end_matches('/'), path);
        debug!(server_id = %peer.server_id, url = %url, "Contacting peer");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| classify(&peer.server_id, e))?;

        match response.status() {
            status if status.is_success() => response
                .json::<Resp>()
                .await
                .map_err(|e| FederationError::Transport(format!("{}: {}", peer.server_id, e))),
            StatusCode::UNAUTHORIZED => Err(FederationError::AuthenticationFailed(format!(
                "{} rejected our proof",
                peer.server_id
            ))),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                Err(FederationError::PeerNotAuthenticated(peer.server_id.clone()))
            }
            status => Err(FederationError::PeerUnreachable(format!(
                "{} answered {}",
                peer.server_id, status
            ))),
        }
    }
}

fn classify(server_id: &str, err: reqwest::Error) -> FederationError {
    if err.is_timeout() {
        FederationError::Timeout(server_id.to_string())
    } else {
        FederationError::PeerUnreachable(format!("{}: {}", server_id, err))
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn respond_to_challenge(
        &self,
        peer: &KnownServer,
        challenge: &PeerChallenge,
    ) -> FederationResult<ChallengeResponse> {
        self.post(peer, CHALLENGE_PATH, challenge).await
    }

    async fn fetch_snapshot(
        &self,
        peer: &KnownServer,
        request: &SyncRequest,
    ) -> FederationResult<SyncResponse> {
        self.post(peer, SYNC_PATH, request).await
    }
}
