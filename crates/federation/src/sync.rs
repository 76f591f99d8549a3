//! Periodic federation sync.
//!
//! Every cycle each known peer gets exactly one network exchange:
//!
//! ```text
//! Known ──authenticate──▶ AuthPending ──ok──▶ Authenticated
//!                              └──fail──▶ Known
//! Authenticated ──fetch──▶ Syncing ──▶ Authenticated
//! ```
//!
//! A peer authenticated in this cycle is synced on the next one. Peers are
//! processed concurrently, each bounded by `peer_timeout`, so one slow peer
//! never delays the others. Per-peer network and authentication failures
//! count toward the peer's failure cap. A peer deregistered mid-cycle is
//! skipped. Any other error is logged and counted against that peer alone;
//! the cycle always finishes and reports.

use crate::auth::PeerAuthenticator;
use crate::descriptor::{KnownServer, DISCOVERED_TRUST_LEVEL};
use crate::error::{FederationError, FederationResult};
use crate::proof::{SyncRequest, SyncResponse};
use crate::registry::{RegisterOutcome, ServerFilter, ServerRegistry};
use crate::transport::PeerTransport;
use futures::stream::{self, StreamExt};
use metrics::counter;
use omnicore_core::{Clock, FederationSettings};
use omnicore_crypto::ServerIdentity;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub interval: Duration,
    pub peer_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub max_servers_per_sync: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from(&FederationSettings::default())
    }
}

impl From<&FederationSettings> for SyncConfig {
    fn from(settings: &FederationSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.sync_interval_secs),
            peer_timeout: Duration::from_secs(settings.peer_timeout_secs),
            max_consecutive_failures: settings.max_consecutive_failures,
            max_servers_per_sync: settings.max_servers_per_sync,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSyncState {
    Known,
    AuthPending,
    Authenticated,
    Syncing,
}

/// Aggregate result of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleReport {
    pub peers_attempted: usize,
    /// Peers authenticated during this cycle
    pub authenticated: usize,
    /// Peers whose snapshot was fetched and merged
    pub synced: usize,
    pub failed: usize,
    /// Failed peers whose consecutive failure count is at the cap
    pub unreachable: usize,
    /// Peers removed from the registry while the cycle ran
    pub removed: usize,
    /// Peers whose exchange hit a local error such as storage
    pub errors: usize,
    pub entries_merged: usize,
    pub entries_rejected: usize,
}

impl SyncCycleReport {
    /// Whether any peer failed or hit a local error.
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.errors > 0
    }
}

enum PeerOutcome {
    Authenticated,
    Synced { merged: usize, rejected: usize },
    Failed { capped: bool },
    Removed,
    Errored,
}

pub struct FederationSync {
    registry: Arc<ServerRegistry>,
    identity: Arc<ServerIdentity>,
    transport: Arc<dyn PeerTransport>,
    authenticator: Arc<dyn PeerAuthenticator>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    failures: Mutex<HashMap<String, u32>>,
    states: Mutex<HashMap<String, PeerSyncState>>,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl FederationSync {
    pub fn new(
        registry: Arc<ServerRegistry>,
        identity: Arc<ServerIdentity>,
        transport: Arc<dyn PeerTransport>,
        authenticator: Arc<dyn PeerAuthenticator>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            registry,
            identity,
            transport,
            authenticator,
            clock,
            config,
            failures: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> SyncConfig {
        self.config
    }

    /// Last observed state of a peer.
    pub fn peer_state(&self, server_id: &str) -> PeerSyncState {
        if let Some(state) = self
            .states
            .lock()
            .ok()
            .and_then(|states| states.get(server_id).copied())
        {
            return state;
        }
        match self.registry.get(server_id) {
            Ok(Some(server)) if server.is_authenticated => PeerSyncState::Authenticated,
            _ => PeerSyncState::Known,
        }
    }

    pub fn consecutive_failures(&self, server_id: &str) -> u32 {
        self.failures
            .lock()
            .ok()
            .and_then(|failures| failures.get(server_id).copied())
            .unwrap_or(0)
    }

    /// Run one cycle over every known peer.
    ///
    /// Concurrent callers are serialized; cycles never overlap.
    pub async fn run_cycle(&self) -> FederationResult<SyncCycleReport> {
        let _cycle = self.cycle_lock.lock().await;

        let local_id = self.identity.server_id();
        let peers: Vec<KnownServer> = self
            .registry
            .list(ServerFilter::All)?
            .into_iter()
            .filter(|peer| peer.server_id != local_id)
            .collect();

        let mut report = SyncCycleReport {
            peers_attempted: peers.len(),
            ..Default::default()
        };
        if peers.is_empty() {
            debug!("No peers to sync");
            return Ok(report);
        }

        let concurrency = peers.len();
        let outcomes: Vec<PeerOutcome> = stream::iter(peers)
            .map(|peer| self.process_peer(peer))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                PeerOutcome::Authenticated => report.authenticated += 1,
                PeerOutcome::Synced { merged, rejected } => {
                    report.synced += 1;
                    report.entries_merged += merged;
                    report.entries_rejected += rejected;
                }
                PeerOutcome::Failed { capped } => {
                    report.failed += 1;
                    if capped {
                        report.unreachable += 1;
                    }
                }
                PeerOutcome::Removed => report.removed += 1,
                PeerOutcome::Errored => report.errors += 1,
            }
        }

        let succeeded = (report.authenticated + report.synced) as u64;
        let failed = (report.failed + report.errors) as u64;
        counter!("omnicore_federation_syncs_total", "status" => "success").increment(succeeded);
        counter!("omnicore_federation_syncs_total", "status" => "failure").increment(failed);
        counter!("omnicore_federation_entries_merged_total").increment(report.entries_merged as u64);

        info!(
            peers = report.peers_attempted,
            authenticated = report.authenticated,
            synced = report.synced,
            failed = report.failed,
            unreachable = report.unreachable,
            removed = report.removed,
            errors = report.errors,
            merged = report.entries_merged,
            "Federation sync cycle complete"
        );
        Ok(report)
    }

    async fn process_peer(&self, peer: KnownServer) -> PeerOutcome {
        let result = if peer.is_authenticated {
            self.sync_peer(&peer).await
        } else {
            self.authenticate_peer(&peer).await
        };

        match result {
            Ok(outcome) => {
                self.record_success(&peer.server_id);
                outcome
            }
            Err(e) if e.is_peer_failure() => {
                let capped = self.record_failure(&peer.server_id, &e);
                PeerOutcome::Failed { capped }
            }
            Err(FederationError::NotFound(id)) if id == peer.server_id => {
                debug!(server_id = %id, "Peer removed during sync cycle");
                self.forget(&id);
                PeerOutcome::Removed
            }
            Err(e) => {
                error!(server_id = %peer.server_id, error = %e, "Peer sync hit a local error");
                PeerOutcome::Errored
            }
        }
    }

    async fn authenticate_peer(&self, peer: &KnownServer) -> FederationResult<PeerOutcome> {
        self.set_state(&peer.server_id, PeerSyncState::AuthPending);

        let result = match timeout(self.config.peer_timeout, self.authenticator.authenticate(peer)).await {
            Ok(result) => result,
            Err(_) => Err(FederationError::Timeout(peer.server_id.clone())),
        };

        match result {
            Ok(()) => {
                self.registry.mark_authenticated(&peer.server_id)?;
                self.set_state(&peer.server_id, PeerSyncState::Authenticated);
                Ok(PeerOutcome::Authenticated)
            }
            Err(e) => {
                self.set_state(&peer.server_id, PeerSyncState::Known);
                Err(e)
            }
        }
    }

    async fn sync_peer(&self, peer: &KnownServer) -> FederationResult<PeerOutcome> {
        self.set_state(&peer.server_id, PeerSyncState::Syncing);

        let request = SyncRequest::sign(&self.identity, &peer.server_id, self.clock.now_ms());
        let fetched = match timeout(
            self.config.peer_timeout,
            self.transport.fetch_snapshot(peer, &request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FederationError::Timeout(peer.server_id.clone())),
        };
        self.set_state(&peer.server_id, PeerSyncState::Authenticated);

        let response = fetched?;
        let (merged, rejected) = self.merge_snapshot(peer, response)?;
        self.registry.mark_synced(&peer.server_id)?;

        debug!(server_id = %peer.server_id, merged, rejected, "Merged peer snapshot");
        Ok(PeerOutcome::Synced { merged, rejected })
    }

    fn merge_snapshot(&self, peer: &KnownServer, response: SyncResponse) -> FederationResult<(usize, usize)> {
        if response.server.server_id != peer.server_id {
            return Err(FederationError::AuthenticationFailed(format!(
                "snapshot from '{}' claims to be '{}'",
                peer.server_id, response.server.server_id
            )));
        }

        let local_id = self.identity.server_id();
        let now = self.clock.now_ms();
        let mut merged = 0;
        let mut rejected = 0;

        for descriptor in response
            .servers
            .iter()
            .filter(|d| d.server_id != local_id && d.server_id != peer.server_id)
            .take(self.config.max_servers_per_sync)
        {
            if descriptor.validate().is_err() {
                rejected += 1;
                continue;
            }
            let candidate = KnownServer::from_descriptor(descriptor, DISCOVERED_TRUST_LEVEL, now);
            match self.registry.register(candidate)? {
                RegisterOutcome::Rejected(reason) => {
                    debug!(server_id = %descriptor.server_id, reason = ?reason, "Snapshot entry rejected");
                    rejected += 1;
                }
                _ => merged += 1,
            }
        }
        Ok((merged, rejected))
    }

    fn record_success(&self, server_id: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(server_id);
        }
    }

    /// Returns whether the peer is now at the failure cap.
    fn record_failure(&self, server_id: &str, err: &FederationError) -> bool {
        let cap = self.config.max_consecutive_failures.max(1);
        let (count, newly_capped) = match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(server_id.to_string()).or_insert(0);
                let before = *count;
                *count = (*count + 1).min(cap);
                (*count, before < cap && *count == cap)
            }
            Err(_) => (cap, false),
        };

        if count >= cap {
            if newly_capped {
                warn!(server_id = %server_id, failures = count, "Peer marked unreachable");
            } else {
                debug!(server_id = %server_id, error = %err, "Unreachable peer still failing");
            }
            true
        } else {
            warn!(server_id = %server_id, failures = count, error = %err, "Peer sync failed");
            false
        }
    }

    fn forget(&self, server_id: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(server_id);
        }
        if let Ok(mut states) = self.states.lock() {
            states.remove(server_id);
        }
    }

    fn set_state(&self, server_id: &str, state: PeerSyncState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(server_id.to_string(), state);
        }
    }

    /// Run cycles every `interval` until `shutdown` flips to true or its
    /// sender is dropped. The first cycle runs immediately.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_secs = self.config.interval.as_secs(),
                "Federation sync task started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle().await {
                            error!(error = %e, "Federation sync cycle failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Federation sync task stopped");
        })
    }
}
