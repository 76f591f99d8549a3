use anyhow::Context;
use clap::Parser;
use omnicore_core::{logging, Clock, OmniConfig, RecordStore, SqliteRecordStore, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

mod error;
mod handlers;
mod routes;
mod state;
mod telemetry;

use state::AppState;

/// OmniCore identity and federation node.
#[derive(Debug, Parser)]
#[command(name = "omnicore-node", version, about)]
struct Args {
    /// Path to the TOML configuration file; created with defaults if missing
    #[arg(short, long, env = "OMNI_CONFIG", default_value = "omnicore.toml")]
    config: PathBuf,

    /// Disable outbound federation sync regardless of configuration
    #[arg(long)]
    no_federation: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = OmniConfig::load_or_init(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    config.apply_env_overrides()?;
    if args.no_federation {
        config.federation.enabled = false;
    }
    config.validate()?;

    logging::init_with(config.logging.format, &config.logging.level);

    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!(
            "failed to create data directory {}",
            config.storage.data_dir.display()
        )
    })?;
    let store: Arc<dyn RecordStore> = Arc::new(
        SqliteRecordStore::open(config.storage.database_path())
            .context("failed to open record store")?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = telemetry::install_recorder()?;
    let state = Arc::new(AppState::open(&config, store, clock)?.with_metrics(metrics));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![spawn_session_purge(
        state.clone(),
        Duration::from_secs(config.auth.session_purge_interval_secs),
        shutdown_rx.clone(),
    )];
    if config.federation.enabled {
        let sync = state.federation_sync(&config)?;
        tasks.push(sync.spawn(shutdown_rx));
    } else {
        info!("Federation sync disabled");
    }

    let app = routes::router(state.clone());
    let bind_addr = format!("{}:{}", config.network.host, config.network.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    info!(
        addr = %bind_addr,
        server_id = %state.server.server_id(),
        public_url = %state.federation.local_descriptor().public_url,
        "OmniCore node listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!("OmniCore node stopped");
    Ok(())
}

fn spawn_session_purge(
    state: Arc<AppState>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = state.identity.purge_expired_sessions() {
                        error!(error = %e, "Session purge failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
    let _ = shutdown.send(true);
}
