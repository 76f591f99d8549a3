//! Server descriptors and registry entries.

use crate::error::{FederationError, FederationResult};
use serde::{Deserialize, Serialize};

/// Trust assigned to a directly registered server.
pub const DEFAULT_TRUST_LEVEL: u8 = 50;
/// Trust assigned to a server learned second-hand through sync.
pub const DISCOVERED_TRUST_LEVEL: u8 = 25;
/// Authentication raises trust to at least this level.
pub const AUTHENTICATED_TRUST_FLOOR: u8 = 75;
pub const MAX_TRUST_LEVEL: u8 = 100;

const MAX_NAME_LEN: usize = 128;
const MAX_DESCRIPTION_LEN: usize = 1024;

fn default_true() -> bool {
    true
}

/// What a server says about itself, or what a peer says about a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub server_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub public_url: String,
    /// Hex-encoded Ed25519 verifying key
    pub public_key: String,
    #[serde(default = "default_true")]
    pub is_public: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub last_seen: u64,
}

impl ServerDescriptor {
    pub fn validate(&self) -> FederationResult<()> {
        if self.server_id.trim().is_empty() {
            return Err(invalid("server_id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(invalid("name is too long"));
        }
        if self.description.len() > MAX_DESCRIPTION_LEN {
            return Err(invalid("description is too long"));
        }

        let url = self.public_url.trim();
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(|| invalid("public_url must be an http(s) URL"))?;
        if rest.is_empty() || rest.starts_with('/') {
            return Err(invalid("public_url has no host"));
        }

        let key = hex::decode(self.public_key.trim())
            .map_err(|_| invalid("public_key must be hex"))?;
        if key.len() != 32 {
            return Err(invalid("public_key must be 32 bytes"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> FederationError {
    FederationError::InvalidDescriptor(reason.to_string())
}

/// A server in the local registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownServer {
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub public_url: String,
    pub public_key: String,
    pub is_public: bool,
    pub is_authenticated: bool,
    pub discovered_at: u64,
    pub last_seen: u64,
    pub last_sync: u64,
    pub version: String,
    pub trust_level: u8,
}

impl KnownServer {
    /// Build an unauthenticated entry discovered at `now`.
    pub fn from_descriptor(descriptor: &ServerDescriptor, trust_level: u8, now: u64) -> Self {
        Self {
            server_id: descriptor.server_id.clone(),
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            public_url: descriptor.public_url.trim().trim_end_matches('/').to_string(),
            public_key: descriptor.public_key.trim().to_ascii_lowercase(),
            is_public: descriptor.is_public,
            is_authenticated: false,
            discovered_at: now,
            last_seen: descriptor.last_seen.max(now),
            last_sync: 0,
            version: descriptor.version.clone(),
            trust_level: trust_level.min(MAX_TRUST_LEVEL),
        }
    }

    pub fn descriptor(&self) -> ServerDescriptor {
        ServerDescriptor {
            server_id: self.server_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            public_url: self.public_url.clone(),
            public_key: self.public_key.clone(),
            is_public: self.is_public,
            version: self.version.clone(),
            last_seen: self.last_seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ServerDescriptor {
        ServerDescriptor {
            server_id: "srv_0123456789abcdef".to_string(),
            name: "alpha".to_string(),
            description: String::new(),
            public_url: "https://alpha.example.org/".to_string(),
            public_key: "AB".repeat(32),
            is_public: true,
            version: "0.2.0".to_string(),
            last_seen: 0,
        }
    }

    #[test]
    fn test_valid_descriptor() {
        assert!(descriptor().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_fields() {
        let mut d = descriptor();
        d.name = "  ".to_string();
        assert!(d.validate().is_err());

        let mut d = descriptor();
        d.public_url = "ftp://alpha.example.org".to_string();
        assert!(d.validate().is_err());

        let mut d = descriptor();
        d.public_url = "https://".to_string();
        assert!(d.validate().is_err());

        let mut d = descriptor();
        d.public_key = "ab".repeat(16);
        assert!(d.validate().is_err());

        let mut d = descriptor();
        d.server_id = String::new();
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_from_descriptor_normalizes() {
        let server = KnownServer::from_descriptor(&descriptor(), 200, 1_000);
        assert_eq!(server.public_url, "https://alpha.example.org");
        assert_eq!(server.public_key, "ab".repeat(32));
        assert_eq!(server.trust_level, MAX_TRUST_LEVEL);
        assert_eq!(server.discovered_at, 1_000);
        assert!(!server.is_authenticated);
    }

    #[test]
    fn test_descriptor_defaults_on_decode() {
        let json = format!(
            r#"{{"server_id":"srv_x","name":"x","public_url":"http://x","public_key":"{}"}}"#,
            "00".repeat(32)
        );
        let d: ServerDescriptor = serde_json::from_str(&json).unwrap();
        assert!(d.is_public);
        assert_eq!(d.last_seen, 0);
    }
}
