//! Seams to the network stack the hole puncher runs on.
//!
//! The hole puncher does not own a transport. It drives whatever implements
//! [`Host`]: a libp2p swarm adapter in production, an in-memory network in
//! tests.

use std::fmt;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite, future::BoxFuture};
use libp2p::{Multiaddr, PeerId, StreamProtocol, core::Endpoint, swarm::ConnectionId};
use tokio::sync::broadcast;

/// Snapshot of an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_id: PeerId,
    pub remote_addr: Multiaddr,
    /// Our role when the connection was established; `Listener` means inbound.
    pub endpoint: Endpoint,
}

impl ConnectionInfo {
    pub fn is_relayed(&self) -> bool {
        vertex_net_utils::is_relayed(&self.remote_addr)
    }

    pub fn is_inbound(&self) -> bool {
        self.endpoint == Endpoint::Listener
    }
}

/// Connection lifecycle notifications pushed by the network stack.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Established(ConnectionInfo),
    Closed(ConnectionInfo),
    NewListenAddr(Multiaddr),
    ExpiredListenAddr(Multiaddr),
}

/// How a rendezvous stream may be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Fail instead of dialing when no connection to the peer exists.
    pub no_dial: bool,
    /// Allow the stream on a limited (relayed) connection.
    pub allow_limited: bool,
    /// Reason recorded by the stack for the above overrides.
    pub reason: &'static str,
}

impl StreamOptions {
    /// Options for a rendezvous stream: reuse the relayed connection, never dial.
    pub const fn rendezvous() -> Self {
        Self {
            no_dial: true,
            allow_limited: true,
            reason: "hole-punch",
        }
    }
}

/// A dial issued by the hole puncher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
    /// Dial even though a (relayed) connection to the peer already exists.
    pub force_direct: bool,
    /// Role for the security/muxer upgrade of a simultaneous connect.
    /// `Dialer` acts as client, `Listener` as server. `None` for a plain dial.
    pub role_override: Option<Endpoint>,
}

impl DialRequest {
    /// A plain direct dial that bypasses the "already connected" shortcut.
    pub fn direct(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self {
            peer_id,
            addrs,
            force_direct: true,
            role_override: None,
        }
    }

    /// A timed simultaneous connect taking the given role.
    pub fn simultaneous(peer_id: PeerId, addrs: Vec<Multiaddr>, role: Endpoint) -> Self {
        Self {
            peer_id,
            addrs,
            force_direct: true,
            role_override: Some(role),
        }
    }
}

/// Errors reported by the network stack.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("not connected to peer")]
    NotConnected,
    #[error("no addresses to dial")]
    NoAddresses,
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("stream negotiation failed: {0}")]
    Negotiation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by the stream's resource scope.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("failed to attach stream to service {service}: {reason}")]
    Service { service: &'static str, reason: String },
    #[error("failed to reserve {bytes} bytes: {reason}")]
    Memory { bytes: usize, reason: String },
}

/// Memory reserved in a stream's resource scope, released on drop.
#[must_use = "the reservation is released as soon as it is dropped"]
pub struct MemoryReservation {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl MemoryReservation {
    /// A reservation that runs `release` when dropped.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A reservation for scopes that do not account memory.
    pub fn untracked() -> Self {
        Self { release: None }
    }
}

impl fmt::Debug for MemoryReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryReservation")
            .field("tracked", &self.release.is_some())
            .finish()
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// A bidirectional stream carrying the rendezvous exchange.
pub trait HolePunchStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    fn remote_peer(&self) -> PeerId;

    /// Remote address of the connection the stream runs on.
    fn remote_addr(&self) -> &Multiaddr;

    /// Attach the stream to a resource-manager service.
    fn set_service(&mut self, service: &'static str) -> Result<(), ResourceError>;

    fn reserve_memory(&mut self, bytes: usize) -> Result<MemoryReservation, ResourceError>;

    /// Abort the stream so the remote sees an error rather than a clean close.
    fn reset(&mut self);
}

/// The network stack, as far as hole punching is concerned.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    type Stream: HolePunchStream;

    fn local_peer_id(&self) -> PeerId;

    /// Currently established connections to `peer`.
    fn connections(&self, peer: &PeerId) -> Vec<ConnectionInfo>;

    /// Addresses known for `peer`, public and private.
    fn peer_addrs(&self, peer: &PeerId) -> Vec<Multiaddr>;

    /// Subscribe to connection lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    async fn new_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
        options: StreamOptions,
    ) -> Result<Self::Stream, HostError>;

    /// Dial until a connection per the request is established.
    async fn connect(&self, request: DialRequest) -> Result<(), HostError>;

    /// The first connection to `peer` that does not go through a relay.
    fn direct_connection(&self, peer: &PeerId) -> Option<ConnectionInfo> {
        self.connections(peer).into_iter().find(|c| !c.is_relayed())
    }
}

/// Address observation (identify) service.
pub trait IdentifyService: Send + Sync + 'static {
    /// Resolves once the peer on `connection` has been identified.
    fn identify_wait(&self, connection: &ConnectionInfo) -> BoxFuture<'static, ()>;
}

/// Identify service for hosts that know peer addresses up front.
impl IdentifyService for () {
    fn identify_wait(&self, _connection: &ConnectionInfo) -> BoxFuture<'static, ()> {
        Box::pin(futures::future::ready(()))
    }
}
