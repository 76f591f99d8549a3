use anyhow::Context;
use metrics_exporter_prometheus::PrometheusHandle;
use omnicore_core::{Clock, OmniConfig, RecordStore};
use omnicore_crypto::ServerIdentity;
use omnicore_federation::{
    load_or_generate_identity, ChallengeAuthenticator, FederationResponder, FederationSync,
    HttpPeerTransport, LocalServerInfo, ServerRegistry, SyncConfig,
};
use omnicore_identity::IdentityService;
use std::sync::Arc;

const USER_AGENT: &str = concat!("omnicore-node/", env!("CARGO_PKG_VERSION"));

pub struct AppState {
    pub identity: IdentityService,
    pub registry: Arc<ServerRegistry>,
    pub federation: FederationResponder,
    pub server: Arc<ServerIdentity>,
    pub clock: Arc<dyn Clock>,
    /// Set when a Prometheus recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn open(
        config: &OmniConfig,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let identity = IdentityService::open(store.clone(), clock.clone(), &config.auth)
            .context("failed to open identity service")?;
        let server = Arc::new(
            load_or_generate_identity(store.as_ref(), clock.as_ref())
                .context("failed to load server identity")?,
        );
        let registry = Arc::new(
            ServerRegistry::open(store, clock.clone(), config.federation.max_known_servers)
                .context("failed to open server registry")?,
        );

        let mut info = LocalServerInfo::from_settings(&config.server, config.federation.public);
        if info.public_url.is_empty() {
            info.public_url = default_public_url(&config.network.host, config.network.port);
        }

        let federation = FederationResponder::new(
            registry.clone(),
            server.clone(),
            info,
            clock.clone(),
            config.federation.max_servers_per_sync,
        );

        Ok(Self {
            identity,
            registry,
            federation,
            server,
            clock,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the outbound sync service over HTTP.
    pub fn federation_sync(&self, config: &OmniConfig) -> anyhow::Result<Arc<FederationSync>> {
        let sync_config = SyncConfig::from(&config.federation);
        let transport = Arc::new(
            HttpPeerTransport::new(sync_config.peer_timeout, USER_AGENT)
                .context("failed to build peer transport")?,
        );
        let authenticator = Arc::new(ChallengeAuthenticator::new(
            self.server.clone(),
            transport.clone(),
            self.clock.clone(),
        ));
        Ok(Arc::new(FederationSync::new(
            self.registry.clone(),
            self.server.clone(),
            transport,
            authenticator,
            self.clock.clone(),
            sync_config,
        )))
    }
}

/// URL advertised when none is configured.
fn default_public_url(host: &str, port: u16) -> String {
    let host = match host {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        other => other,
    };
    format!("http://{}:{}", host, port)
}
