//! Signed proofs exchanged between peers.
//!
//! Two proofs exist:
//!
//! - **Challenge**: the challenger sends a random nonce; the responder signs
//!   it together with both server ids using its Ed25519 identity. The
//!   challenger checks the signature against the key it already holds for
//!   that peer, so a peer cannot authenticate under somebody else's id.
//! - **Sync request**: the requester signs its id, the target id and a
//!   timestamp. The target only serves its snapshot to authenticated
//!   requesters whose proof is fresh.
//!
//! Signed messages are a context tag followed by length-prefixed fields, so
//! no two distinct field tuples encode to the same bytes.

use crate::descriptor::ServerDescriptor;
use crate::error::{FederationError, FederationResult};
use omnicore_crypto::{random_bytes, verify_signature, CryptoError, ServerIdentity};
use serde::{Deserialize, Serialize};

pub const PEER_AUTH_CONTEXT: &[u8] = b"omnicore-peer-auth-v1";
pub const SYNC_CONTEXT: &[u8] = b"omnicore-sync-v1";

/// Oldest accepted sync request.
pub const SYNC_MAX_AGE_MS: u64 = 300_000;
/// Allowed clock skew for sync requests dated in the future.
pub const SYNC_MAX_FUTURE_MS: u64 = 30_000;

const NONCE_BYTES: usize = 32;

fn push_field(buf: &mut Vec<u8>, field: &[u8]) {
    buf.extend_from_slice(&(field.len() as u32).to_le_bytes());
    buf.extend_from_slice(field);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerChallenge {
    pub challenger_id: String,
    /// 32 random bytes, hex
    pub nonce: String,
    pub issued_at: u64,
}

impl PeerChallenge {
    pub fn new(challenger_id: &str, now_ms: u64) -> Self {
        Self {
            challenger_id: challenger_id.to_string(),
            nonce: hex::encode(random_bytes(NONCE_BYTES)),
            issued_at: now_ms,
        }
    }

    fn signing_bytes(&self, responder_id: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(PEER_AUTH_CONTEXT);
        push_field(&mut buf, self.challenger_id.as_bytes());
        push_field(&mut buf, responder_id.as_bytes());
        push_field(&mut buf, self.nonce.as_bytes());
        buf.extend_from_slice(&self.issued_at.to_le_bytes());
        buf
    }

    /// Sign this challenge as `identity`.
    pub fn answer(&self, identity: &ServerIdentity) -> ChallengeResponse {
        let responder_id = identity.server_id();
        let signature = identity.sign(&self.signing_bytes(&responder_id));
        ChallengeResponse {
            responder_id,
            public_key: identity.public_key_hex(),
            signature,
        }
    }

    /// Check a response against the id and key we hold for the peer.
    ///
    /// The key echoed in the response is informational only.
    pub fn verify(
        &self,
        response: &ChallengeResponse,
        expected_server_id: &str,
        expected_public_key: &str,
    ) -> FederationResult<()> {
        if response.responder_id != expected_server_id {
            return Err(FederationError::AuthenticationFailed(format!(
                "challenge answered by '{}', expected '{}'",
                response.responder_id, expected_server_id
            )));
        }
        verify_signature(
            expected_public_key,
            &self.signing_bytes(&response.responder_id),
            &response.signature,
        )
        .map_err(|e| auth_failure("challenge signature", e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub responder_id: String,
    pub public_key: String,
    /// Ed25519 signature, hex
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub requesting_server_id: String,
    pub target_server_id: String,
    pub timestamp_ms: u64,
    pub signature: String,
}

impl SyncRequest {
    fn signing_bytes(requester: &str, target: &str, timestamp_ms: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(SYNC_CONTEXT);
        push_field(&mut buf, requester.as_bytes());
        push_field(&mut buf, target.as_bytes());
        buf.extend_from_slice(&timestamp_ms.to_le_bytes());
        buf
    }

    pub fn sign(identity: &ServerIdentity, target_server_id: &str, now_ms: u64) -> Self {
        let requesting_server_id = identity.server_id();
        let signature = identity.sign(&Self::signing_bytes(
            &requesting_server_id,
            target_server_id,
            now_ms,
        ));
        Self {
            requesting_server_id,
            target_server_id: target_server_id.to_string(),
            timestamp_ms: now_ms,
            signature,
        }
    }

    /// Verify freshness, target and signature.
    pub fn verify(
        &self,
        requester_public_key: &str,
        local_server_id: &str,
        now_ms: u64,
    ) -> FederationResult<()> {
        if self.target_server_id != local_server_id {
            return Err(FederationError::AuthenticationFailed(format!(
                "sync request addressed to '{}'",
                self.target_server_id
            )));
        }
        if self.timestamp_ms.saturating_add(SYNC_MAX_AGE_MS) < now_ms {
            return Err(FederationError::AuthenticationFailed(
                "sync request expired".to_string(),
            ));
        }
        if self.timestamp_ms > now_ms.saturating_add(SYNC_MAX_FUTURE_MS) {
            return Err(FederationError::AuthenticationFailed(
                "sync request dated in the future".to_string(),
            ));
        }
        verify_signature(
            requester_public_key,
            &Self::signing_bytes(
                &self.requesting_server_id,
                &self.target_server_id,
                self.timestamp_ms,
            ),
            &self.signature,
        )
        .map_err(|e| auth_failure("sync request signature", e))
    }
}

/// Snapshot served to an authenticated peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// The responding server itself
    pub server: ServerDescriptor,
    pub servers: Vec<ServerDescriptor>,
}

fn auth_failure(what: &str, err: CryptoError) -> FederationError {
    FederationError::AuthenticationFailed(format!("{}: {}", what, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_roundtrip() {
        let challenger = ServerIdentity::generate();
        let responder = ServerIdentity::generate();

        let challenge = PeerChallenge::new(&challenger.server_id(), 1_000);
        assert_eq!(challenge.nonce.len(), NONCE_BYTES * 2);

        let response = challenge.answer(&responder);
        assert!(challenge
            .verify(&response, &responder.server_id(), &responder.public_key_hex())
            .is_ok());
    }

    #[test]
    fn test_challenge_rejects_impersonation() {
        let challenger = ServerIdentity::generate();
        let genuine = ServerIdentity::generate();
        let impostor = ServerIdentity::generate();
        let challenge = PeerChallenge::new(&challenger.server_id(), 1_000);

        // Impostor answers under its own id
        let response = challenge.answer(&impostor);
        assert!(matches!(
            challenge.verify(&response, &genuine.server_id(), &genuine.public_key_hex()),
            Err(FederationError::AuthenticationFailed(_))
        ));

        // Impostor claims the genuine id but cannot produce its signature
        let mut forged = challenge.answer(&impostor);
        forged.responder_id = genuine.server_id();
        assert!(matches!(
            challenge.verify(&forged, &genuine.server_id(), &genuine.public_key_hex()),
            Err(FederationError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_challenge_response_bound_to_nonce() {
        let challenger = ServerIdentity::generate();
        let responder = ServerIdentity::generate();
        let first = PeerChallenge::new(&challenger.server_id(), 1_000);
        let second = PeerChallenge::new(&challenger.server_id(), 1_000);

        let replayed = first.answer(&responder);
        assert!(second
            .verify(&replayed, &responder.server_id(), &responder.public_key_hex())
            .is_err());
    }

    #[test]
    fn test_sync_request_verifies() {
        let requester = ServerIdentity::generate();
        let target = ServerIdentity::generate();
        let request = SyncRequest::sign(&requester, &target.server_id(), 1_000_000);
        assert!(request
            .verify(&requester.public_key_hex(), &target.server_id(), 1_000_000)
            .is_ok());
    }

    #[test]
    fn test_sync_request_freshness_window() {
        let requester = ServerIdentity::generate();
        let target = ServerIdentity::generate();
        let key = requester.public_key_hex();
        let id = target.server_id();
        let request = SyncRequest::sign(&requester, &id, 1_000_000);

        assert!(request.verify(&key, &id, 1_000_000 + SYNC_MAX_AGE_MS).is_ok());
        assert!(request.verify(&key, &id, 1_000_000 + SYNC_MAX_AGE_MS + 1).is_err());
        assert!(request.verify(&key, &id, 1_000_000 - SYNC_MAX_FUTURE_MS).is_ok());
        assert!(request.verify(&key, &id, 1_000_000 - SYNC_MAX_FUTURE_MS - 1).is_err());
    }

    #[test]
    fn test_sync_request_tampering_detected() {
        let requester = ServerIdentity::generate();
        let target = ServerIdentity::generate();
        let mut request = SyncRequest::sign(&requester, &target.server_id(), 1_000_000);
        request.timestamp_ms += 1;
        assert!(request
            .verify(&requester.public_key_hex(), &target.server_id(), 1_000_000)
            .is_err());

        let request = SyncRequest::sign(&requester, "srv_elsewhere", 1_000_000);
        assert!(request
            .verify(&requester.public_key_hex(), &target.server_id(), 1_000_000)
            .is_err());
    }
}
