//! Integration tests for federation sync.
//!
//! Nodes are wired together in-process through a scripted transport that
//! routes each call to the target node's responder, or simulates a peer
//! that hangs or refuses connections.

use async_trait::async_trait;
use omnicore_core::{
    CoreError, ManualClock, MemoryRecordStore, RecordKind, RecordStore, StoredRecord,
};
use omnicore_crypto::ServerIdentity;
use omnicore_federation::{
    ChallengeAuthenticator, ChallengeResponse, FederationError, FederationResponder,
    FederationResult, FederationSync, KnownServer, LocalServerInfo, PeerAuthenticator,
    PeerChallenge, PeerSyncState, PeerTransport, ServerDescriptor, ServerFilter, ServerRegistry,
    SyncConfig, SyncRequest, SyncResponse, DISCOVERED_TRUST_LEVEL,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const NOW: u64 = 1_700_000_000_000;

struct Node {
    identity: Arc<ServerIdentity>,
    registry: Arc<ServerRegistry>,
    responder: Arc<FederationResponder>,
}

impl Node {
    fn new(name: &str, clock: &Arc<ManualClock>) -> Self {
        Self::with_store(name, clock, Arc::new(MemoryRecordStore::new()))
    }

    fn with_store(name: &str, clock: &Arc<ManualClock>, store: Arc<dyn RecordStore>) -> Self {
        let identity = Arc::new(ServerIdentity::generate());
        let registry = Arc::new(ServerRegistry::open(store, clock.clone(), 100).unwrap());
        let info = LocalServerInfo {
            name: name.to_string(),
            description: String::new(),
            public_url: format!("https://{}.example.org", name),
            is_public: true,
            version: "test".to_string(),
        };
        let responder = Arc::new(FederationResponder::new(
            registry.clone(),
            identity.clone(),
            info,
            clock.clone(),
            100,
        ));
        Self {
            identity,
            registry,
            responder,
        }
    }

    fn id(&self) -> String {
        self.identity.server_id()
    }

    fn descriptor(&self) -> ServerDescriptor {
        self.responder.local_descriptor()
    }

    /// Make `other` known here and trusted to sync from us.
    fn trust(&self, other: &Node) {
        self.responder.register_server(&other.descriptor()).unwrap();
        self.registry.mark_authenticated(&other.id()).unwrap();
    }
}

#[derive(Clone)]
enum Behaviour {
    Respond(Arc<FederationResponder>),
    Hang,
    Refuse,
}

#[derive(Default)]
struct ScriptedTransport {
    peers: Mutex<HashMap<String, Behaviour>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    fn set(&self, server_id: &str, behaviour: Behaviour) {
        self.peers
            .lock()
            .unwrap()
            .insert(server_id.to_string(), behaviour);
    }

    async fn behaviour_for(&self, peer: &KnownServer) -> FederationResult<Arc<FederationResponder>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let behaviour = self.peers.lock().unwrap().get(&peer.server_id).cloned();
        let result = match behaviour {
            Some(Behaviour::Respond(responder)) => Ok(responder),
            Some(Behaviour::Hang) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(FederationError::Timeout(peer.server_id.clone()))
            }
            Some(Behaviour::Refuse) | None => Err(FederationError::PeerUnreachable(
                peer.server_id.clone(),
            )),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl PeerTransport for ScriptedTransport {
    async fn respond_to_challenge(
        &self,
        peer: &KnownServer,
        challenge: &PeerChallenge,
    ) -> FederationResult<ChallengeResponse> {
        let responder = self.behaviour_for(peer).await?;
        Ok(responder.answer_challenge(challenge))
    }

    async fn fetch_snapshot(
        &self,
        peer: &KnownServer,
        request: &SyncRequest,
    ) -> FederationResult<SyncResponse> {
        let responder = self.behaviour_for(peer).await?;
        responder.handle_sync_request(request)
    }
}

fn config(peer_timeout: Duration, max_failures: u32) -> SyncConfig {
    SyncConfig {
        interval: Duration::from_millis(50),
        peer_timeout,
        max_consecutive_failures: max_failures,
        max_servers_per_sync: 100,
    }
}

fn sync_for(
    node: &Node,
    transport: Arc<ScriptedTransport>,
    clock: &Arc<ManualClock>,
    config: SyncConfig,
) -> Arc<FederationSync> {
    let authenticator = Arc::new(ChallengeAuthenticator::new(
        node.identity.clone(),
        transport.clone(),
        clock.clone(),
    ));
    Arc::new(FederationSync::new(
        node.registry.clone(),
        node.identity.clone(),
        transport,
        authenticator,
        clock.clone(),
        config,
    ))
}

fn extra_server(name: &str) -> ServerDescriptor {
    let identity = ServerIdentity::generate();
    ServerDescriptor {
        server_id: identity.server_id(),
        name: name.to_string(),
        description: String::new(),
        public_url: format!("https://{}.example.org", name),
        public_key: identity.public_key_hex(),
        is_public: true,
        version: "test".to_string(),
        last_seen: NOW,
    }
}

#[tokio::test]
async fn test_cycle_with_one_reachable_and_one_hanging_peer() {
    let clock = Arc::new(ManualClock::new(NOW));
    let local = Node::new("local", &clock);
    let p1 = Node::new("p1", &clock);
    let p2 = Node::new("p2", &clock);

    let x = extra_server("x");
    let y = extra_server("y");
    p1.responder.register_server(&x).unwrap();
    p1.responder.register_server(&y).unwrap();
    p1.trust(&local);

    local.responder.register_server(&p1.descriptor()).unwrap();
    local.responder.register_server(&p2.descriptor()).unwrap();

    let transport = Arc::new(ScriptedTransport::default());
    transport.set(&p1.id(), Behaviour::Respond(p1.responder.clone()));
    transport.set(&p2.id(), Behaviour::Hang);
    let sync = sync_for(&local, transport, &clock, config(Duration::from_millis(200), 5));

    // First cycle authenticates P1; P2 times out
    let started = Instant::now();
    let first = sync.run_cycle().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(first.peers_attempted, 2);
    assert_eq!(first.authenticated, 1);
    assert_eq!(first.failed, 1);
    assert_eq!(sync.peer_state(&p1.id()), PeerSyncState::Authenticated);
    assert_eq!(sync.peer_state(&p2.id()), PeerSyncState::Known);

    // Second cycle syncs P1's snapshot
    clock.advance(Duration::from_secs(60));
    let second = sync.run_cycle().await.unwrap();
    assert_eq!(second.synced, 1);
    assert_eq!(second.failed, 1);
    assert!(second.entries_merged >= 2);

    let merged_x = local.registry.get(&x.server_id).unwrap().unwrap();
    assert_eq!(merged_x.trust_level, DISCOVERED_TRUST_LEVEL);
    assert!(!merged_x.is_authenticated);
    assert!(local.registry.get(&y.server_id).unwrap().is_some());

    let p1_entry = local.registry.get(&p1.id()).unwrap().unwrap();
    assert!(p1_entry.is_authenticated);
    assert_eq!(p1_entry.last_sync, NOW + 60_000);

    // Nothing was lost because of P2
    assert!(local.registry.get(&p2.id()).unwrap().is_some());
    assert_eq!(sync.consecutive_failures(&p2.id()), 2);
    assert_eq!(sync.consecutive_failures(&p1.id()), 0);
    assert!(local.registry.get(&local.id()).unwrap().is_none());
}

#[tokio::test]
async fn test_failure_count_saturates_and_resets() {
    let clock = Arc::new(ManualClock::new(NOW));
    let local = Node::new("local", &clock);
    let peer = Node::new("peer", &clock);
    local.responder.register_server(&peer.descriptor()).unwrap();

    let transport = Arc::new(ScriptedTransport::default());
    transport.set(&peer.id(), Behaviour::Refuse);
    let sync = sync_for(&local, transport.clone(), &clock, config(Duration::from_millis(200), 2));

    let first = sync.run_cycle().await.unwrap();
    assert_eq!((first.failed, first.unreachable), (1, 0));

    for _ in 0..3 {
        let report = sync.run_cycle().await.unwrap();
        assert_eq!((report.failed, report.unreachable), (1, 1));
        assert_eq!(sync.consecutive_failures(&peer.id()), 2);
    }

    // Capped peers are still contacted each cycle
    assert_eq!(transport.calls.load(Ordering::SeqCst), 4);

    transport.set(&peer.id(), Behaviour::Respond(peer.responder.clone()));
    let recovered = sync.run_cycle().await.unwrap();
    assert_eq!(recovered.authenticated, 1);
    assert_eq!(sync.consecutive_failures(&peer.id()), 0);
}

#[tokio::test]
async fn test_unauthenticated_requester_is_refused() {
    let clock = Arc::new(ManualClock::new(NOW));
    let local = Node::new("local", &clock);
    let peer = Node::new("peer", &clock);

    // We trust the peer but it has never heard of us
    local.trust(&peer);

    let transport = Arc::new(ScriptedTransport::default());
    transport.set(&peer.id(), Behaviour::Respond(peer.responder.clone()));
    let sync = sync_for(&local, transport, &clock, config(Duration::from_millis(200), 5));

    let report = sync.run_cycle().await.unwrap();
    assert_eq!(report.synced, 0);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_impostor_fails_challenge() {
    let clock = Arc::new(ManualClock::new(NOW));
    let local = Node::new("local", &clock);
    let genuine = Node::new("genuine", &clock);
    let impostor = Node::new("impostor", &clock);
    local.responder.register_server(&genuine.descriptor()).unwrap();

    // The genuine server's URL is answered by the impostor
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(&genuine.id(), Behaviour::Respond(impostor.responder.clone()));
    let sync = sync_for(&local, transport, &clock, config(Duration::from_millis(200), 5));

    let report = sync.run_cycle().await.unwrap();
    assert_eq!(report.authenticated, 0);
    assert_eq!(report.failed, 1);
    assert!(!local.registry.get(&genuine.id()).unwrap().unwrap().is_authenticated);
}

#[tokio::test]
async fn test_cycles_do_not_overlap() {
    let clock = Arc::new(ManualClock::new(NOW));
    let local = Node::new("local", &clock);
    let peer = Node::new("peer", &clock);
    local.responder.register_server(&peer.descriptor()).unwrap();

    let transport = Arc::new(ScriptedTransport {
        delay: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    transport.set(&peer.id(), Behaviour::Refuse);
    let sync = sync_for(&local, transport.clone(), &clock, config(Duration::from_secs(1), 5));

    let (a, b) = tokio::join!(sync.run_cycle(), sync.run_cycle());
    a.unwrap();
    b.unwrap();

    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejecting_authenticator_leaves_peer_known() {
    struct RejectAll;

    #[async_trait]
    impl PeerAuthenticator for RejectAll {
        async fn authenticate(&self, peer: &KnownServer) -> FederationResult<()> {
            Err(FederationError::AuthenticationFailed(peer.server_id.clone()))
        }
    }

    let clock = Arc::new(ManualClock::new(NOW));
    let local = Node::new("local", &clock);
    let peer = Node::new("peer", &clock);
    local.responder.register_server(&peer.descriptor()).unwrap();

    let sync = FederationSync::new(
        local.registry.clone(),
        local.identity.clone(),
        Arc::new(ScriptedTransport::default()),
        Arc::new(RejectAll),
        clock.clone(),
        config(Duration::from_millis(200), 5),
    );

    let report = sync.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(sync.peer_state(&peer.id()), PeerSyncState::Known);
    assert!(local
        .registry
        .list(ServerFilter::Authenticated)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_spawned_task_stops_on_shutdown() {
    let clock = Arc::new(ManualClock::new(NOW));
    let local = Node::new("local", &clock);
    let peer = Node::new("peer", &clock);
    local.responder.register_server(&peer.descriptor()).unwrap();

    let transport = Arc::new(ScriptedTransport::default());
    transport.set(&peer.id(), Behaviour::Respond(peer.responder.clone()));
    let sync = sync_for(&local, transport.clone(), &clock, config(Duration::from_millis(200), 5));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = sync.spawn(shutdown_rx);

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(transport.calls.load(Ordering::SeqCst) >= 1);
    assert!(local.registry.get(&peer.id()).unwrap().unwrap().is_authenticated);
}

struct AcceptAll;

#[async_trait]
impl PeerAuthenticator for AcceptAll {
    async fn authenticate(&self, _peer: &KnownServer) -> FederationResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_peer_deregistered_mid_cycle_is_skipped() {
    struct DeregisterDuringAuth {
        registry: Arc<ServerRegistry>,
        victim: String,
    }

    #[async_trait]
    impl PeerAuthenticator for DeregisterDuringAuth {
        async fn authenticate(&self, peer: &KnownServer) -> FederationResult<()> {
            if peer.server_id == self.victim {
                self.registry.deregister(&peer.server_id)?;
            }
            Ok(())
        }
    }

    let clock = Arc::new(ManualClock::new(NOW));
    let local = Node::new("local", &clock);
    let gone = Node::new("gone", &clock);
    let stays = Node::new("stays", &clock);
    local.responder.register_server(&gone.descriptor()).unwrap();
    local.responder.register_server(&stays.descriptor()).unwrap();

    let sync = FederationSync::new(
        local.registry.clone(),
        local.identity.clone(),
        Arc::new(ScriptedTransport::default()),
        Arc::new(DeregisterDuringAuth {
            registry: local.registry.clone(),
            victim: gone.id(),
        }),
        clock.clone(),
        config(Duration::from_millis(200), 5),
    );

    let report = sync.run_cycle().await.unwrap();
    assert_eq!(report.peers_attempted, 2);
    assert_eq!(report.removed, 1);
    assert_eq!(report.authenticated, 1);
    assert_eq!(report.errors, 0);
    assert!(!report.has_failures());

    assert!(local.registry.get(&gone.id()).unwrap().is_none());
    assert!(local.registry.get(&stays.id()).unwrap().unwrap().is_authenticated);
    assert_eq!(sync.peer_state(&gone.id()), PeerSyncState::Known);
    assert_eq!(sync.consecutive_failures(&gone.id()), 0);
}

/// Record store that refuses writes to one server record.
struct RefusingStore {
    inner: MemoryRecordStore,
    refuse: Mutex<Option<String>>,
}

impl RecordStore for RefusingStore {
    fn put(&self, kind: RecordKind, id: &str, body: &str) -> omnicore_core::Result<()> {
        if kind == RecordKind::Server && self.refuse.lock().unwrap().as_deref() == Some(id) {
            return Err(CoreError::Config(format!("write to '{}' refused", id)));
        }
        self.inner.put(kind, id, body)
    }

    fn get(&self, kind: RecordKind, id: &str) -> omnicore_core::Result<Option<String>> {
        self.inner.get(kind, id)
    }

    fn remove(&self, kind: RecordKind, id: &str) -> omnicore_core::Result<bool> {
        self.inner.remove(kind, id)
    }

    fn list(&self, kind: RecordKind) -> omnicore_core::Result<Vec<StoredRecord>> {
        self.inner.list(kind)
    }
}

#[tokio::test]
async fn test_storage_error_on_one_peer_keeps_cycle_report() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(RefusingStore {
        inner: MemoryRecordStore::new(),
        refuse: Mutex::new(None),
    });
    let local = Node::with_store("local", &clock, store.clone());
    let broken = Node::new("broken", &clock);
    let healthy = Node::new("healthy", &clock);
    local.responder.register_server(&broken.descriptor()).unwrap();
    local.responder.register_server(&healthy.descriptor()).unwrap();
    *store.refuse.lock().unwrap() = Some(broken.id());

    let sync = FederationSync::new(
        local.registry.clone(),
        local.identity.clone(),
        Arc::new(ScriptedTransport::default()),
        Arc::new(AcceptAll),
        clock.clone(),
        config(Duration::from_millis(200), 5),
    );

    let report = sync.run_cycle().await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.authenticated, 1);
    assert_eq!(report.failed, 0);
    assert!(report.has_failures());
    assert!(local.registry.get(&healthy.id()).unwrap().unwrap().is_authenticated);
    assert!(!local.registry.get(&broken.id()).unwrap().unwrap().is_authenticated);

    // Once the store recovers the peer goes through
    *store.refuse.lock().unwrap() = None;
    let recovered = sync.run_cycle().await.unwrap();
    assert_eq!(recovered.errors, 0);
    assert!(local.registry.get(&broken.id()).unwrap().unwrap().is_authenticated);
}
