//! Configuration management for OmniCore.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `OMNI_*` environment variables. Every section tolerates missing keys.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Upper bound for the admin session multiplier.
const MAX_ADMIN_SESSION_MULTIPLIER: u32 = 720;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OmniConfig {
    pub server: ServerSettings,
    pub network: NetworkSettings,
    pub auth: AuthSettings,
    pub federation: FederationSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// Identity of this server as advertised to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub name: String,
    pub description: String,
    /// Externally reachable base URL, e.g. `https://auth.example.org`
    pub public_url: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "OmniCore Server".to_string(),
            description: "An OmniCore identity server".to_string(),
            public_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub host: String,
    pub port: u16,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Base TTL for client sessions
    pub session_ttl_secs: u64,
    /// Admin sessions live `session_ttl_secs * admin_session_multiplier`
    pub admin_session_multiplier: u32,
    /// How often expired sessions are purged from memory
    pub session_purge_interval_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            session_ttl_secs: 3600,
            admin_session_multiplier: 24,
            session_purge_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationSettings {
    pub enabled: bool,
    /// Whether this server lists itself in snapshots served to peers
    pub public: bool,
    pub sync_interval_secs: u64,
    pub max_known_servers: usize,
    /// Per-peer bound on any single network exchange
    pub peer_timeout_secs: u64,
    pub max_consecutive_failures: u32,
    pub max_servers_per_sync: usize,
}

impl Default for FederationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            public: true,
            sync_interval_secs: 3600,
            max_known_servers: 1000,
            peer_timeout_secs: 30,
            max_consecutive_failures: 5,
            max_servers_per_sync: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl StorageSettings {
    /// Path of the SQLite record database inside `data_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("omnicore.db")
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(CoreError::Config(format!("unknown log format '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
        }
    }
}

impl OmniConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load from `path` if it exists, otherwise write and return the defaults.
    pub fn load_or_init<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::from_file(path);
        }
        let config = Self::default();
        config.save(path)?;
        tracing::info!(path = %path.display(), "Wrote default configuration");
        Ok(config)
    }

    /// Write the configuration as TOML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `OMNI_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using an arbitrary key lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("OMNI_SERVER_NAME") {
            self.server.name = v;
        }
        if let Some(v) = lookup("OMNI_PUBLIC_URL") {
            self.server.public_url = v;
        }
        if let Some(v) = lookup("OMNI_HOST") {
            self.network.host = v;
        }
        if let Some(v) = parse_override(&lookup, "OMNI_PORT")? {
            self.network.port = v;
        }
        if let Some(v) = parse_override(&lookup, "OMNI_SESSION_TTL_SECS")? {
            self.auth.session_ttl_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "OMNI_ADMIN_SESSION_MULTIPLIER")? {
            self.auth.admin_session_multiplier = v;
        }
        if let Some(v) = parse_override(&lookup, "OMNI_FEDERATION_ENABLED")? {
            self.federation.enabled = v;
        }
        if let Some(v) = parse_override(&lookup, "OMNI_SYNC_INTERVAL_SECS")? {
            self.federation.sync_interval_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "OMNI_MAX_KNOWN_SERVERS")? {
            self.federation.max_known_servers = v;
        }
        if let Some(v) = parse_override(&lookup, "OMNI_PEER_TIMEOUT_SECS")? {
            self.federation.peer_timeout_secs = v;
        }
        if let Some(v) = lookup("OMNI_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = parse_override(&lookup, "OMNI_LOG_FORMAT")? {
            self.logging.format = v;
        }
        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.auth.session_ttl_secs == 0 {
            return Err(CoreError::Config(
                "auth.session_ttl_secs must be positive".to_string(),
            ));
        }
        if self.auth.admin_session_multiplier == 0
            || self.auth.admin_session_multiplier > MAX_ADMIN_SESSION_MULTIPLIER
        {
            return Err(CoreError::Config(format!(
                "auth.admin_session_multiplier must be in 1..={}",
                MAX_ADMIN_SESSION_MULTIPLIER
            )));
        }
        if self.auth.session_purge_interval_secs == 0 {
            return Err(CoreError::Config(
                "auth.session_purge_interval_secs must be positive".to_string(),
            ));
        }
        if self.federation.sync_interval_secs == 0 {
            return Err(CoreError::Config(
                "federation.sync_interval_secs must be positive".to_string(),
            ));
        }
        if self.federation.peer_timeout_secs == 0 {
            return Err(CoreError::Config(
                "federation.peer_timeout_secs must be positive".to_string(),
            ));
        }
        if self.federation.max_known_servers == 0 {
            return Err(CoreError::Config(
                "federation.max_known_servers must be positive".to_string(),
            ));
        }
        if self.federation.max_consecutive_failures == 0 {
            return Err(CoreError::Config(
                "federation.max_consecutive_failures must be positive".to_string(),
            ));
        }
        let url = &self.server.public_url;
        if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(CoreError::Config(format!(
                "server.public_url must be an http(s) URL, got '{}'",
                url
            )));
        }
        Ok(())
    }
}

fn parse_override<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CoreError::Config(format!("{}: {}", key, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = OmniConfig::default();
        assert_eq!(config.server.name, "OmniCore Server");
        assert_eq!(config.network.port, 8080);
        assert_eq!(config.auth.session_ttl_secs, 3600);
        assert_eq!(config.auth.admin_session_multiplier, 24);
        assert!(config.federation.enabled);
        assert_eq!(config.federation.max_known_servers, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = OmniConfig::from_toml_str(
            r#"
            [federation]
            max_known_servers = 2

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.federation.max_known_servers, 2);
        assert_eq!(config.federation.sync_interval_secs, 3600);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.network.port, 8080);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("OMNI_PORT", "9090"),
            ("OMNI_SYNC_INTERVAL_SECS", "60"),
            ("OMNI_DATA_DIR", "/var/lib/omni"),
            ("OMNI_FEDERATION_ENABLED", "false"),
        ]
        .into_iter()
        .collect();

        let mut config = OmniConfig::default();
        config
            .apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.network.port, 9090);
        assert_eq!(config.federation.sync_interval_secs, 60);
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/omni"));
        assert!(!config.federation.enabled);
    }

    #[test]
    fn test_bad_env_override_is_reported() {
        let mut config = OmniConfig::default();
        let result = config.apply_overrides_from(|k| {
            (k == "OMNI_PORT").then(|| "not-a-port".to_string())
        });
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = OmniConfig::default();
        config.auth.session_ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let mut config = OmniConfig::default();
        config.server.public_url = "ftp://example.org".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_init_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.d").join("omnicore.toml");

        let created = OmniConfig::load_or_init(&path).unwrap();
        assert!(path.exists());

        let reloaded = OmniConfig::from_file(&path).unwrap();
        assert_eq!(reloaded.network.port, created.network.port);
        assert_eq!(reloaded.server.name, created.server.name);
    }
}
