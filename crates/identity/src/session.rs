//! Bearer session issuance and validation.

use omnicore_core::{AuthSettings, Clock};
use omnicore_crypto::generate_token;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session expired")]
    Expired,

    #[error("Session not found")]
    NotFound,

    #[error("Lock poisoned: session table")]
    LockPoisoned,
}

pub type SessionResult<T> = Result<T, SessionError>;

/// An issued bearer session.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    /// Client id, or the admin principal for admin sessions
    pub subject: String,
    pub issued_at: u64,
    pub expires_at: u64,
    pub is_admin: bool,
}

impl Session {
    /// Valid strictly before `expires_at`.
    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("subject", &self.subject)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("is_admin", &self.is_admin)
            .finish()
    }
}

/// Lifetimes applied to new sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub ttl: Duration,
    pub admin_multiplier: u32,
}

impl SessionPolicy {
    pub fn ttl_for(&self, is_admin: bool) -> Duration {
        if is_admin {
            self.ttl.saturating_mul(self.admin_multiplier)
        } else {
            self.ttl
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::from(&AuthSettings::default())
    }
}

impl From<&AuthSettings> for SessionPolicy {
    fn from(settings: &AuthSettings) -> Self {
        Self {
            ttl: Duration::from_secs(settings.session_ttl_secs),
            admin_multiplier: settings.admin_session_multiplier,
        }
    }
}

/// In-memory session table.
///
/// Expired sessions are kept until [`purge_expired`](Self::purge_expired)
/// runs, so a late validation reports `Expired` rather than `NotFound`.
pub struct SessionIssuer {
    sessions: RwLock<HashMap<String, Session>>,
    policy: SessionPolicy,
    clock: Arc<dyn Clock>,
}

impl SessionIssuer {
    pub fn new(policy: SessionPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub fn issue(&self, subject: &str, is_admin: bool) -> SessionResult<Session> {
        let issued_at = self.clock.now_ms();
        let ttl_ms = self.policy.ttl_for(is_admin).as_millis().min(u64::MAX as u128) as u64;
        let session = Session {
            token: generate_token(),
            subject: subject.to_string(),
            issued_at,
            expires_at: issued_at.saturating_add(ttl_ms),
            is_admin,
        };

        self.sessions
            .write()
            .map_err(|_| SessionError::LockPoisoned)?
            .insert(session.token.clone(), session.clone());

        debug!(subject = %subject, is_admin, expires_at = session.expires_at, "Session issued");
        Ok(session)
    }

    pub fn validate(&self, token: &str) -> SessionResult<Session> {
        let sessions = self.sessions.read().map_err(|_| SessionError::LockPoisoned)?;
        let session = sessions.get(token).ok_or(SessionError::NotFound)?;
        if session.is_valid_at(self.clock.now_ms()) {
            Ok(session.clone())
        } else {
            Err(SessionError::Expired)
        }
    }

    /// Remove a session. Unknown tokens are ignored.
    pub fn revoke(&self, token: &str) -> SessionResult<()> {
        let removed = self
            .sessions
            .write()
            .map_err(|_| SessionError::LockPoisoned)?
            .remove(token);
        if let Some(session) = removed {
            debug!(subject = %session.subject, "Session revoked");
        }
        Ok(())
    }

    /// Remove every session of a subject. Returns how many were removed.
    pub fn revoke_subject(&self, subject: &str) -> SessionResult<usize> {
        let mut sessions = self.sessions.write().map_err(|_| SessionError::LockPoisoned)?;
        let before = sessions.len();
        sessions.retain(|_, session| session.subject != subject);
        Ok(before - sessions.len())
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn purge_expired(&self) -> SessionResult<usize> {
        let now = self.clock.now_ms();
        let mut sessions = self.sessions.write().map_err(|_| SessionError::LockPoisoned)?;
        let before = sessions.len();
        sessions.retain(|_, session| session.is_valid_at(now));
        Ok(before - sessions.len())
    }

    /// Number of sessions that are currently valid.
    pub fn active_count(&self) -> SessionResult<usize> {
        let now = self.clock.now_ms();
        Ok(self
            .sessions
            .read()
            .map_err(|_| SessionError::LockPoisoned)?
            .values()
            .filter(|session| session.is_valid_at(now))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnicore_core::ManualClock;

    fn issuer(clock: Arc<ManualClock>) -> SessionIssuer {
        SessionIssuer::new(
            SessionPolicy {
                ttl: Duration::from_secs(3600),
                admin_multiplier: 24,
            },
            clock,
        )
    }

    #[test]
    fn test_issue_and_validate() {
        let clock = Arc::new(ManualClock::new(1_000));
        let sessions = issuer(clock);
        let session = sessions.issue("alice", false).unwrap();

        assert_eq!(session.expires_at, 1_000 + 3_600_000);
        assert_eq!(sessions.validate(&session.token).unwrap(), session);
    }

    #[test]
    fn test_expiry_boundary() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = issuer(clock.clone());
        let session = sessions.issue("alice", false).unwrap();

        clock.set(session.expires_at - 1);
        assert!(sessions.validate(&session.token).is_ok());

        clock.set(session.expires_at);
        assert_eq!(sessions.validate(&session.token), Err(SessionError::Expired));
    }

    #[test]
    fn test_admin_ttl_multiplier() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = issuer(clock.clone());
        let admin = sessions.issue("admin", true).unwrap();
        assert_eq!(admin.expires_at, 24 * 3_600_000);

        clock.advance(Duration::from_secs(3600 * 2));
        assert!(sessions.validate(&admin.token).is_ok());
    }

    #[test]
    fn test_unknown_token() {
        let sessions = issuer(Arc::new(ManualClock::new(0)));
        assert_eq!(sessions.validate("nope"), Err(SessionError::NotFound));
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let sessions = issuer(Arc::new(ManualClock::new(0)));
        let session = sessions.issue("alice", false).unwrap();
        sessions.revoke(&session.token).unwrap();
        sessions.revoke(&session.token).unwrap();
        assert_eq!(sessions.validate(&session.token), Err(SessionError::NotFound));
    }

    #[test]
    fn test_revoke_subject() {
        let sessions = issuer(Arc::new(ManualClock::new(0)));
        sessions.issue("alice", false).unwrap();
        sessions.issue("alice", false).unwrap();
        let bob = sessions.issue("bob", false).unwrap();

        assert_eq!(sessions.revoke_subject("alice").unwrap(), 2);
        assert!(sessions.validate(&bob.token).is_ok());
    }

    #[test]
    fn test_purge_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = issuer(clock.clone());
        let user = sessions.issue("alice", false).unwrap();
        let admin = sessions.issue("admin", true).unwrap();
        assert_eq!(sessions.active_count().unwrap(), 2);

        clock.set(user.expires_at);
        assert_eq!(sessions.active_count().unwrap(), 1);
        assert_eq!(sessions.purge_expired().unwrap(), 1);
        assert_eq!(sessions.validate(&user.token), Err(SessionError::NotFound));
        assert!(sessions.validate(&admin.token).is_ok());
    }

    #[test]
    fn test_tokens_unique() {
        let sessions = issuer(Arc::new(ManualClock::new(0)));
        let a = sessions.issue("alice", false).unwrap();
        let b = sessions.issue("alice", false).unwrap();
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn test_debug_redacts_token() {
        let sessions = issuer(Arc::new(ManualClock::new(0)));
        let session = sessions.issue("alice", false).unwrap();
        assert!(!format!("{:?}", session).contains(&session.token));
    }
}
