//! Client identity management for OmniCore.
//!
//! Every client gets its own server-side X25519 keypair and, once the
//! two-phase handshake completes, a shared secret known only to the client
//! and this server.
//!
//! # Core Concepts
//!
//! - **Key Store**: one record per client, each behind its own lock
//! - **Registration**: `init` issues a server key, `complete` binds the
//!   client key and issues a session
//! - **Sessions**: bearer tokens with a fixed expiry; admin sessions live
//!   longer
//! - **Admin**: a single persisted credential gating privileged operations
//!
//! # Security Model
//!
//! - A client public key is bound exactly once
//! - Credential and token comparisons are constant-time
//! - Secrets are redacted from `Debug` and never logged

pub mod admin;
pub mod error;
pub mod keystore;
pub mod registration;
pub mod service;
pub mod session;

pub use admin::{AdminAuthenticator, AdminCredential, AdminError, ADMIN_KEY_PREFIX, ADMIN_SUBJECT};
pub use error::{IdentityError, IdentityResult};
pub use keystore::{
    validate_client_id, ClientKeyRecord, ClientKeyStore, KeyStoreError, KeyStoreStats,
    RegistrationState, MAX_CLIENT_ID_LEN,
};
pub use registration::RegistrationEngine;
pub use service::IdentityService;
pub use session::{Session, SessionError, SessionIssuer, SessionPolicy};
