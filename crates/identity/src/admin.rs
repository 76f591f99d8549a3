//! Administrative credential and elevated sessions.
//!
//! A single long-lived credential is generated the first time a node starts
//! and persisted as a singleton record. It is never rotated automatically.

use crate::session::{Session, SessionError, SessionIssuer};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use omnicore_core::{Clock, CoreError, RecordKind, RecordStore, RecordStoreExt};
use omnicore_crypto::{constant_time_eq, random_bytes};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Prefix of every admin credential.
pub const ADMIN_KEY_PREFIX: &str = "admin_";

/// Subject recorded on admin sessions.
pub const ADMIN_SUBJECT: &str = "admin";

const ADMIN_RECORD_ID: &str = "admin";

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Invalid admin credential")]
    InvalidCredential,

    #[error("Admin privileges required")]
    Forbidden,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(#[from] CoreError),
}

pub type AdminResult<T> = Result<T, AdminError>;

#[derive(Serialize, Deserialize)]
struct StoredCredential {
    key: String,
    created_at: u64,
}

/// The admin secret.
pub struct AdminCredential {
    key: Zeroizing<String>,
}

impl AdminCredential {
    /// `admin_` followed by 256 random bits, base64url.
    pub fn generate() -> Self {
        let bytes = Zeroizing::new(random_bytes(32));
        Self {
            key: Zeroizing::new(format!(
                "{}{}",
                ADMIN_KEY_PREFIX,
                URL_SAFE_NO_PAD.encode(bytes.as_slice())
            )),
        }
    }

    pub fn from_key(key: impl Into<String>) -> Self {
        Self {
            key: Zeroizing::new(key.into()),
        }
    }

    /// Load the persisted credential, generating and persisting one on first start.
    ///
    /// A freshly generated credential is printed once in a warning banner;
    /// after that it can only be read from the record store.
    pub fn load_or_generate(store: &dyn RecordStore, clock: &dyn Clock) -> AdminResult<Self> {
        if let Some(stored) =
            store.get_json::<StoredCredential>(RecordKind::AdminCredential, ADMIN_RECORD_ID)?
        {
            info!("Loaded admin credential");
            return Ok(Self::from_key(stored.key));
        }

        let credential = Self::generate();
        store.put_json(
            RecordKind::AdminCredential,
            ADMIN_RECORD_ID,
            &StoredCredential {
                key: credential.key.to_string(),
                created_at: clock.now_ms(),
            },
        )?;

        warn!("============================================================");
        warn!("  Generated new admin credential. Store it securely:");
        warn!("  {}", credential.key.as_str());
        warn!("  It will not be shown again.");
        warn!("============================================================");

        Ok(credential)
    }

    /// Constant-time comparison against a candidate.
    pub fn matches(&self, candidate: &str) -> bool {
        constant_time_eq(self.key.as_bytes(), candidate.as_bytes())
    }

    pub fn expose(&self) -> &str {
        self.key.as_str()
    }
}

impl fmt::Debug for AdminCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdminCredential(<redacted>)")
    }
}

/// Checks the admin credential and gates admin-only operations.
pub struct AdminAuthenticator {
    credential: AdminCredential,
    sessions: Arc<SessionIssuer>,
}

impl AdminAuthenticator {
    pub fn new(credential: AdminCredential, sessions: Arc<SessionIssuer>) -> Self {
        Self {
            credential,
            sessions,
        }
    }

    /// Exchange the credential for an admin session.
    pub fn login(&self, candidate: &str) -> AdminResult<Session> {
        if !self.credential.matches(candidate) {
            warn!("Rejected admin login attempt");
            return Err(AdminError::InvalidCredential);
        }
        let session = self.sessions.issue(ADMIN_SUBJECT, true)?;
        info!(expires_at = session.expires_at, "Admin session issued");
        Ok(session)
    }

    /// Resolve a bearer token to a valid admin session.
    ///
    /// Unknown or expired tokens surface as session errors; a valid
    /// non-admin session is `Forbidden`.
    pub fn authorize(&self, token: &str) -> AdminResult<Session> {
        let session = self.sessions.validate(token)?;
        if !session.is_admin {
            return Err(AdminError::Forbidden);
        }
        Ok(session)
    }

    pub fn logout(&self, token: &str) -> AdminResult<()> {
        Ok(self.sessions.revoke(token)?)
    }
}
