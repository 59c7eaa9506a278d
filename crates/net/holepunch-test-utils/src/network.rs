//! Simulated network of hosts.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use libp2p::{
    Multiaddr, PeerId, StreamProtocol, core::Endpoint, multiaddr::Protocol, swarm::ConnectionId,
};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, trace};
use vertex_net_holepunch::{
    ConnectionEvent, ConnectionInfo, DialRequest, HolePuncher, Host, HostError, StreamOptions,
};

use crate::stream::{ResourceScope, SimStream, StreamEnd, StreamProbe};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_PUNCH_WINDOW: Duration = Duration::from_millis(500);

/// Whether a host accepts unsolicited inbound connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nat {
    /// Publicly reachable: plain dials to its listen addresses succeed.
    Public,
    /// Behind a NAT: only a simultaneous open gets through.
    Behind,
}

#[derive(Default)]
struct NetState {
    hosts: HashMap<PeerId, Arc<SimHost>>,
    /// Outstanding simultaneous-open dials, keyed by (dialer, target).
    punches: HashMap<(PeerId, PeerId), (usize, oneshot::Sender<()>)>,
    next_punch: usize,
}

/// In-memory network connecting [`SimHost`]s.
///
/// Relayed connections carry streams with the configured relay latency.
/// Simultaneous-open dials succeed only if the reciprocal dial arrives within
/// the punch window.
#[derive(Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<NetState>>,
    next_connection: Arc<AtomicUsize>,
    relay_latency: Arc<Mutex<Duration>>,
    punch_window: Arc<Mutex<Duration>>,
    relay: PeerId,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        Self {
            state: Default::default(),
            next_connection: Arc::new(AtomicUsize::new(1)),
            relay_latency: Arc::new(Mutex::new(Duration::ZERO)),
            punch_window: Arc::new(Mutex::new(DEFAULT_PUNCH_WINDOW)),
            relay: PeerId::random(),
        }
    }

    /// One-way latency of streams on relayed connections.
    pub fn set_relay_latency(&self, latency: Duration) {
        *self.relay_latency.lock() = latency;
    }

    /// How long a simultaneous-open dial waits for its counterpart.
    pub fn set_punch_window(&self, window: Duration) {
        *self.punch_window.lock() = window;
    }

    /// Adds a host listening on `listen_addrs`.
    pub fn add_host(&self, nat: Nat, listen_addrs: Vec<Multiaddr>) -> Arc<SimHost> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let host = Arc::new(SimHost {
            network: self.clone(),
            peer_id: PeerId::random(),
            nat,
            listen_addrs,
            events,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            connections: Default::default(),
            peerstore: Default::default(),
            behavior: Default::default(),
            dials: Default::default(),
            streams: Default::default(),
            resources: Default::default(),
        });
        self.state.lock().hosts.insert(host.peer_id, host.clone());
        host
    }

    fn host(&self, peer: &PeerId) -> Option<Arc<SimHost>> {
        self.state.lock().hosts.get(peer).cloned()
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId::new_unchecked(self.next_connection.fetch_add(1, Ordering::SeqCst))
    }

    /// Address of `target` as reached through the relay.
    pub fn relayed_addr(&self, target: &PeerId) -> Multiaddr {
        Multiaddr::empty()
            .with(Protocol::Ip4([198, 51, 100, 1].into()))
            .with(Protocol::Tcp(4001))
            .with(Protocol::P2p(self.relay))
            .with(Protocol::P2pCircuit)
            .with(Protocol::P2p(*target))
    }

    /// `dialer` connects to `listener` through the relay.
    ///
    /// The listener sees an inbound relayed connection.
    pub fn connect_relayed(&self, dialer: &SimHost, listener: &SimHost) {
        let id = self.next_id();
        let dialer_side = ConnectionInfo {
            id,
            peer_id: listener.peer_id,
            remote_addr: self.relayed_addr(&listener.peer_id),
            endpoint: Endpoint::Dialer,
        };
        let listener_side = ConnectionInfo {
            id,
            peer_id: dialer.peer_id,
            remote_addr: self.relayed_addr(&dialer.peer_id),
            endpoint: Endpoint::Listener,
        };
        dialer.add_connection(dialer_side);
        listener.add_connection(listener_side);
    }

    /// Establishes a direct connection from `dialer` to `listener` at `addr`.
    pub fn connect_direct(&self, dialer: &SimHost, listener: &SimHost, addr: Multiaddr) {
        self.establish(dialer, listener, addr, Endpoint::Dialer);
    }

    fn establish(&self, local: &SimHost, remote: &SimHost, addr: Multiaddr, role: Endpoint) {
        let id = self.next_id();
        let reverse_addr = local
            .listen_addrs
            .first()
            .cloned()
            .unwrap_or_else(Multiaddr::empty);

        debug!(local = %local.peer_id, remote = %remote.peer_id, %addr, "direct connection established");
        local.add_connection(ConnectionInfo {
            id,
            peer_id: remote.peer_id,
            remote_addr: addr,
            endpoint: role,
        });
        remote.add_connection(ConnectionInfo {
            id,
            peer_id: local.peer_id,
            remote_addr: reverse_addr,
            endpoint: match role {
                Endpoint::Dialer => Endpoint::Listener,
                Endpoint::Listener => Endpoint::Dialer,
            },
        });
    }

    fn plain_dial(&self, local: &SimHost, request: &DialRequest) -> Result<(), HostError> {
        let target = self
            .host(&request.peer_id)
            .ok_or_else(|| HostError::Dial("unknown peer".into()))?;
        if target.nat == Nat::Behind {
            return Err(HostError::Dial("connection refused".into()));
        }
        let addr = target.reachable_addr(&request.addrs)?;
        self.establish(local, &target, addr, Endpoint::Dialer);
        Ok(())
    }

    async fn simultaneous_open(
        &self,
        local: &SimHost,
        request: &DialRequest,
        role: Endpoint,
    ) -> Result<(), HostError> {
        let target = self
            .host(&request.peer_id)
            .ok_or_else(|| HostError::Dial("unknown peer".into()))?;
        let addr = target.reachable_addr(&request.addrs)?;
        let key = (local.peer_id, target.peer_id);

        let (token, waiting) = {
            let mut state = self.state.lock();
            let counterpart = state.punches.remove(&(target.peer_id, local.peer_id));
            if let Some((_, counterpart)) = counterpart {
                drop(state);
                self.establish(local, &target, addr, role);
                let _ = counterpart.send(());
                return Ok(());
            }
            // A newer dial replaces a stale one from an earlier round.
            let (tx, rx) = oneshot::channel();
            state.next_punch += 1;
            let token = state.next_punch;
            state.punches.insert(key, (token, tx));
            (token, rx)
        };

        let window = *self.punch_window.lock();
        trace!(local = %local.peer_id, remote = %target.peer_id, ?window, "waiting for counterpart dial");
        match tokio::time::timeout(window, waiting).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                let mut state = self.state.lock();
                if state.punches.get(&key).is_some_and(|(t, _)| *t == token) {
                    state.punches.remove(&key);
                }
                Err(HostError::Dial("no counterpart dial within punch window".into()))
            }
        }
    }
}

/// Scripted connect behaviour of a host.
#[derive(Debug, Default)]
struct Behavior {
    connect_failures: u32,
    connect_delay: Duration,
    hang_connects: bool,
    fail_streams: bool,
}

/// A recorded outbound dial.
#[derive(Debug, Clone)]
pub struct DialRecord {
    pub at: Instant,
    pub request: DialRequest,
}

/// Simulated host implementing [`Host`].
pub struct SimHost {
    network: SimNetwork,
    peer_id: PeerId,
    nat: Nat,
    listen_addrs: Vec<Multiaddr>,
    events: broadcast::Sender<ConnectionEvent>,
    inbound_tx: mpsc::UnboundedSender<SimStream>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<SimStream>>>,
    connections: Mutex<Vec<ConnectionInfo>>,
    peerstore: Mutex<HashMap<PeerId, Vec<Multiaddr>>>,
    behavior: Mutex<Behavior>,
    dials: Mutex<Vec<DialRecord>>,
    streams: Mutex<Vec<StreamProbe>>,
    resources: Arc<ResourceScope>,
}

impl SimHost {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.clone()
    }

    /// Broadcasts a `NewListenAddr` event for every listen address.
    pub fn announce_listen_addrs(&self) {
        for addr in &self.listen_addrs {
            let _ = self.events.send(ConnectionEvent::NewListenAddr(addr.clone()));
        }
    }

    /// Records addresses for `peer` in the peerstore.
    pub fn add_peer_addrs(&self, peer: PeerId, addrs: impl IntoIterator<Item = Multiaddr>) {
        self.peerstore.lock().entry(peer).or_default().extend(addrs);
    }

    /// Fail the next `n` connect calls.
    pub fn fail_next_connects(&self, n: u32) {
        self.behavior.lock().connect_failures = n;
    }

    /// Delay every connect call.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.behavior.lock().connect_delay = delay;
    }

    /// Make every connect call hang forever.
    pub fn hang_connects(&self) {
        self.behavior.lock().hang_connects = true;
    }

    /// Make stream negotiation fail.
    pub fn fail_streams(&self) {
        self.behavior.lock().fail_streams = true;
    }

    /// Make service attachment and memory reservation fail.
    pub fn fail_resources(&self) {
        self.resources.fail.store(true, Ordering::SeqCst);
    }

    /// Make closing this host's streams hang forever.
    pub fn stall_stream_close(&self) {
        self.resources.stall_close.store(true, Ordering::SeqCst);
    }

    /// Bytes currently reserved by streams of this host.
    pub fn reserved_memory(&self) -> usize {
        self.resources.reserved.load(Ordering::SeqCst)
    }

    /// Every connect call made so far.
    pub fn dials(&self) -> Vec<DialRecord> {
        self.dials.lock().clone()
    }

    /// Simultaneous-open dials made so far.
    pub fn punch_dials(&self) -> Vec<DialRecord> {
        self.dials()
            .into_iter()
            .filter(|d| d.request.role_override.is_some())
            .collect()
    }

    /// Probes of every stream this host opened.
    pub fn opened_streams(&self) -> Vec<StreamProbe> {
        self.streams.lock().clone()
    }

    /// Takes the receiver of streams opened to this host. Returns `None` after the first call.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<SimStream>> {
        self.inbound_rx.lock().take()
    }

    pub fn has_direct_connection(&self, peer: &PeerId) -> bool {
        self.direct_connection(peer).is_some()
    }

    fn add_connection(&self, info: ConnectionInfo) {
        self.connections.lock().push(info.clone());
        let _ = self.events.send(ConnectionEvent::Established(info));
    }

    fn reachable_addr(&self, candidates: &[Multiaddr]) -> Result<Multiaddr, HostError> {
        if candidates.is_empty() {
            return Err(HostError::NoAddresses);
        }
        candidates
            .iter()
            .find(|a| self.listen_addrs.contains(a))
            .cloned()
            .ok_or_else(|| HostError::Dial("no reachable address".into()))
    }
}

#[async_trait]
impl Host for SimHost {
    type Stream = SimStream;

    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn connections(&self, peer: &PeerId) -> Vec<ConnectionInfo> {
        self.connections
            .lock()
            .iter()
            .filter(|c| c.peer_id == *peer)
            .cloned()
            .collect()
    }

    fn peer_addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.peerstore.lock().get(peer).cloned().unwrap_or_default()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn new_stream(
        &self,
        peer: PeerId,
        _protocol: StreamProtocol,
        options: StreamOptions,
    ) -> Result<SimStream, HostError> {
        if self.behavior.lock().fail_streams {
            return Err(HostError::Negotiation("protocol not supported".into()));
        }
        let connection = self
            .connections(&peer)
            .into_iter()
            .find(|c| options.allow_limited || !c.is_relayed())
            .ok_or(HostError::NotConnected)?;
        let remote = self.network.host(&peer).ok_or(HostError::NotConnected)?;
        let latency = if connection.is_relayed() {
            *self.network.relay_latency.lock()
        } else {
            Duration::ZERO
        };

        let remote_view = remote
            .connections(&self.peer_id)
            .into_iter()
            .find(|c| c.id == connection.id)
            .map(|c| c.remote_addr)
            .ok_or(HostError::NotConnected)?;

        let (local, inbound) = SimStream::pair(
            StreamEnd {
                peer,
                remote_addr: connection.remote_addr,
                resources: self.resources.clone(),
            },
            StreamEnd {
                peer: self.peer_id,
                remote_addr: remote_view,
                resources: remote.resources.clone(),
            },
            latency,
        );
        self.streams.lock().push(local.probe());
        remote
            .inbound_tx
            .send(inbound)
            .map_err(|_| HostError::Negotiation("remote stopped accepting streams".into()))?;
        Ok(local)
    }

    async fn connect(&self, request: DialRequest) -> Result<(), HostError> {
        self.dials.lock().push(DialRecord {
            at: Instant::now(),
            request: request.clone(),
        });

        let (delay, hang) = {
            let behavior = self.behavior.lock();
            (behavior.connect_delay, behavior.hang_connects)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if hang {
            futures::future::pending::<()>().await;
        }
        {
            let mut behavior = self.behavior.lock();
            if behavior.connect_failures > 0 {
                behavior.connect_failures -= 1;
                return Err(HostError::Dial("injected connect failure".into()));
            }
        }

        if !request.force_direct && !self.connections(&request.peer_id).is_empty() {
            return Ok(());
        }
        match request.role_override {
            None => self.network.plain_dial(self, &request),
            Some(role) => self.network.simultaneous_open(self, &request, role).await,
        }
    }
}

/// Hands every stream opened to `host` to `puncher`.
///
/// # Panics
///
/// Panics if the inbound receiver of `host` was already taken.
#[allow(clippy::expect_used)]
pub fn serve_inbound(host: &SimHost, puncher: Arc<HolePuncher<SimHost>>) -> JoinHandle<()> {
    let mut inbound = host.take_inbound().expect("inbound streams already taken");
    tokio::spawn(async move {
        while let Some(stream) = inbound.recv().await {
            let puncher = puncher.clone();
            tokio::spawn(async move {
                if let Err(error) = puncher.handle_inbound_stream(stream).await {
                    debug!(%error, "inbound hole punch failed");
                }
            });
        }
    })
}
