//! Server-to-server federation for OmniCore.
//!
//! Independently operated servers discover each other, prove possession of
//! their advertised keys, and periodically exchange registry snapshots.
//!
//! # Core Concepts
//!
//! - **Registry**: bounded directory of known servers with trust levels
//! - **Proofs**: Ed25519 signed challenges and sync requests
//! - **Sync**: timer-driven reconciliation, one exchange per peer per cycle
//! - **Responder**: answers challenges and serves snapshots to peers
//!
//! # Trust Model
//!
//! - Only a verified challenge marks a peer authenticated
//! - Merges never lower trust; only an admin override can
//! - Entries learned second-hand start at a lower trust level

pub mod auth;
pub mod descriptor;
pub mod error;
pub mod local;
pub mod proof;
pub mod registry;
pub mod responder;
pub mod sync;
pub mod transport;

pub use auth::{ChallengeAuthenticator, PeerAuthenticator};
pub use descriptor::{
    KnownServer, ServerDescriptor, AUTHENTICATED_TRUST_FLOOR, DEFAULT_TRUST_LEVEL,
    DISCOVERED_TRUST_LEVEL, MAX_TRUST_LEVEL,
};
pub use error::{FederationError, FederationResult};
pub use local::{load_or_generate_identity, LocalServerInfo};
pub use proof::{ChallengeResponse, PeerChallenge, SyncRequest, SyncResponse};
pub use registry::{RegisterOutcome, RegistryStats, RejectReason, ServerFilter, ServerRegistry};
pub use responder::FederationResponder;
pub use sync::{FederationSync, PeerSyncState, SyncConfig, SyncCycleReport};
pub use transport::{HttpPeerTransport, PeerTransport};
