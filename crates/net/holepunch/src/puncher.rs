//! The hole punch coordinator.

use std::{fmt, sync::Arc};

use libp2p::{Multiaddr, PeerId};
use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};
use vertex_net_utils::{is_public, is_relayed};

use crate::{
    active::ActiveAttempts,
    config::HolePunchConfig,
    constants::PROTOCOL,
    error::HolePunchError,
    exchange::{self, ExchangeContext, Rendezvous},
    filter::{AddrFilter, ListenAddrs},
    host::{DialRequest, HolePunchStream, Host, IdentifyService, StreamOptions},
    listener::{self, ListenAddrSet},
    timing::{connect_role, punch, sleep_or_cancel, sync_delay},
    tracer::{Side, TraceEvent, Tracer},
};

/// Upgrades relayed connections to direct ones by coordinated hole punching.
///
/// Building a hole puncher subscribes to the host's connection events: every
/// inbound relayed connection triggers [`direct_connect`](Self::direct_connect)
/// once the remote peer has been identified. Inbound rendezvous streams are
/// handed over by the host through
/// [`handle_inbound_stream`](Self::handle_inbound_stream).
///
/// Call [`close`](Self::close) to shut down and wait for in-flight work.
/// Dropping the hole puncher cancels in-flight work without waiting.
pub struct HolePuncher<H: Host> {
    inner: Arc<Inner<H>>,
}

pub(crate) struct Inner<H: Host> {
    host: Arc<H>,
    pub(crate) identify: Arc<dyn IdentifyService>,
    config: HolePunchConfig,
    listen_addrs: ListenAddrs,
    pub(crate) observed_listen_addrs: ListenAddrSet,
    filter: Option<Arc<dyn AddrFilter>>,
    tracer: Arc<dyn Tracer>,
    active: ActiveAttempts,
    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: TaskTracker,
}

impl<H: Host> HolePuncher<H> {
    pub fn builder(host: Arc<H>) -> HolePuncherBuilder<H> {
        HolePuncherBuilder::new(host)
    }

    /// Establishes a direct connection to `peer`.
    ///
    /// Returns immediately if one already exists. Otherwise tries a plain
    /// dial when the peer has a public address, then hole punches over the
    /// relayed connection.
    ///
    /// Fails with [`HolePunchError::AlreadyActive`] if another call for the
    /// same peer is still running.
    pub async fn direct_connect(&self, peer: PeerId) -> Result<(), HolePunchError> {
        self.inner.direct_connect(peer).await
    }

    /// Serves a rendezvous stream opened by a remote peer, then dials it.
    ///
    /// The stream must run over a relayed connection; anything else is reset.
    pub async fn handle_inbound_stream<S: HolePunchStream>(
        &self,
        stream: S,
    ) -> Result<(), HolePunchError> {
        self.inner.handle_inbound_stream(stream).await
    }

    /// Whether a hole punch to `peer` is in progress.
    pub fn is_active(&self, peer: &PeerId) -> bool {
        self.inner.active.contains(peer)
    }

    /// Number of peers with a hole punch in progress.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    pub fn config(&self) -> &HolePunchConfig {
        &self.inner.config
    }

    /// Stops accepting work, cancels in-flight work and waits for it to finish.
    ///
    /// Calling it again is a no-op that still waits.
    pub async fn close(&self) {
        if self.inner.active.close() {
            debug!("closing hole puncher");
        }
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

impl<H: Host> Drop for HolePuncher<H> {
    fn drop(&mut self) {
        self.inner.active.close();
        self.inner.cancel.cancel();
        self.inner.tasks.close();
    }
}

impl<H: Host> fmt::Debug for HolePuncher<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HolePuncher")
            .field("local_peer_id", &self.inner.host.local_peer_id())
            .field("active", &self.inner.active.len())
            .field("closed", &self.inner.active.is_closed())
            .finish_non_exhaustive()
    }
}

impl<H: Host> Inner<H> {
    pub(crate) async fn direct_connect(&self, peer: PeerId) -> Result<(), HolePunchError> {
        let guard = self.active.begin(peer, self.tasks.token())?;
        let result = self.run_initiator(guard.peer()).await;
        drop(guard);
        result
    }

    async fn run_initiator(&self, peer: PeerId) -> Result<(), HolePunchError> {
        if self.host.direct_connection(&peer).is_some() {
            debug!(%peer, "already connected directly");
            return Ok(());
        }

        let known = self.host.peer_addrs(&peer);
        if known.iter().any(|a| !is_relayed(a) && is_public(a)) {
            match self.direct_dial(peer, known).await {
                Ok(()) => return Ok(()),
                Err(HolePunchError::Cancelled) => return Err(HolePunchError::Cancelled),
                Err(error) => debug!(%peer, %error, "direct dial failed, hole punching"),
            }
        }

        let max_retries = self.config.max_retries();
        let role = connect_role(true, self.config.legacy_role_behavior);
        let mut last = Rendezvous {
            remote_addrs: Vec::new(),
            local_addrs: Vec::new(),
            rtt: Default::default(),
        };

        for attempt in 1..=max_retries {
            let rendezvous = match self.rendezvous(peer).await {
                Ok(rendezvous) => rendezvous,
                Err(HolePunchError::Cancelled) => return Err(HolePunchError::Cancelled),
                Err(error) => {
                    debug!(%peer, %error, "hole punch rendezvous failed");
                    self.tracer.trace(TraceEvent::ProtocolError {
                        peer,
                        error: error.to_string(),
                    });
                    return Err(error);
                }
            };

            sleep_or_cancel(sync_delay(rendezvous.rtt), &self.cancel).await?;
            self.tracer.trace(TraceEvent::HolePunchStarted {
                peer,
                remote_addrs: rendezvous.remote_addrs.clone(),
                rtt: rendezvous.rtt,
            });

            match self.connect(peer, rendezvous.remote_addrs.clone(), role).await {
                Ok(()) => {
                    info!(%peer, attempt, "hole punch succeeded");
                    self.finished(peer, Side::Initiator, attempt, rendezvous);
                    return Ok(());
                }
                Err(error) if error.is_retryable() => {
                    debug!(%peer, attempt, %error, "hole punch attempt failed");
                    last = rendezvous;
                }
                Err(error) => return Err(error),
            }
        }

        self.finished(peer, Side::Initiator, max_retries, last);
        Err(HolePunchError::RetriesExhausted {
            peer,
            attempts: max_retries,
        })
    }

    async fn direct_dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), HolePunchError> {
        debug!(%peer, addrs = addrs.len(), "trying direct dial");
        let start = Instant::now();
        let dial = tokio::time::timeout(
            self.config.direct_dial_timeout(),
            self.host.connect(DialRequest::direct(peer, addrs)),
        );
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(HolePunchError::Cancelled),
            result = dial => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(HolePunchError::ConnectFailed(error)),
                Err(_) => Err(HolePunchError::ConnectTimeout),
            },
        };

        let elapsed = start.elapsed();
        self.tracer.trace(match &result {
            Ok(()) => TraceEvent::DirectDialSucceeded { peer, elapsed },
            Err(error) => TraceEvent::DirectDialFailed {
                peer,
                elapsed,
                error: error.to_string(),
            },
        });
        result
    }

    /// Opens a rendezvous stream over the existing relayed connection and runs the exchange.
    async fn rendezvous(&self, peer: PeerId) -> Result<Rendezvous, HolePunchError> {
        let open = self
            .host
            .new_stream(peer, PROTOCOL, StreamOptions::rendezvous());
        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(HolePunchError::Cancelled),
            stream = open => stream.map_err(HolePunchError::OpenStream)?,
        };
        exchange::initiate(stream, self.exchange_context(peer)).await
    }

    async fn connect(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        role: libp2p::core::Endpoint,
    ) -> Result<(), HolePunchError> {
        punch(
            self.host.as_ref(),
            self.tracer.as_ref(),
            peer,
            addrs,
            role,
            self.config.direct_dial_timeout(),
            &self.cancel,
        )
        .await
    }

    pub(crate) async fn handle_inbound_stream<S: HolePunchStream>(
        &self,
        mut stream: S,
    ) -> Result<(), HolePunchError> {
        let peer = stream.remote_peer();
        if !is_relayed(stream.remote_addr()) {
            debug!(%peer, addr = %stream.remote_addr(), "hole punch stream over direct connection");
            stream.reset();
            return Err(HolePunchError::Protocol(
                "hole punch stream over non-relayed connection".into(),
            ));
        }

        // Keeps `close` waiting for this stream.
        let _token = self.tasks.token();
        if self.active.is_closed() {
            stream.reset();
            return Err(HolePunchError::Closed);
        }

        let rendezvous = match exchange::respond(stream, self.exchange_context(peer)).await {
            Ok(rendezvous) => rendezvous,
            Err(error) => {
                debug!(%peer, %error, "inbound hole punch rendezvous failed");
                self.tracer.trace(TraceEvent::ProtocolError {
                    peer,
                    error: error.to_string(),
                });
                return Err(error);
            }
        };

        self.tracer.trace(TraceEvent::HolePunchStarted {
            peer,
            remote_addrs: rendezvous.remote_addrs.clone(),
            rtt: rendezvous.rtt,
        });
        let role = connect_role(false, self.config.legacy_role_behavior);
        let result = self
            .connect(peer, rendezvous.remote_addrs.clone(), role)
            .await;
        self.finished(peer, Side::Receiver, 1, rendezvous);
        result
    }

    fn exchange_context(&self, peer: PeerId) -> ExchangeContext<'_> {
        ExchangeContext {
            peer,
            listen_addrs: &self.listen_addrs,
            filter: self.filter.as_deref(),
            timeout: self.config.stream_timeout(),
        }
    }

    fn finished(&self, peer: PeerId, side: Side, attempts: u32, rendezvous: Rendezvous) {
        self.tracer.trace(TraceEvent::HolePunchFinished {
            peer,
            side,
            attempts,
            remote_addrs: rendezvous.remote_addrs,
            local_addrs: rendezvous.local_addrs,
            direct_addr: self.host.direct_connection(&peer).map(|c| c.remote_addr),
        });
    }
}

/// Builder for [`HolePuncher`].
pub struct HolePuncherBuilder<H: Host> {
    host: Arc<H>,
    identify: Arc<dyn IdentifyService>,
    config: HolePunchConfig,
    listen_addrs: Option<ListenAddrs>,
    filter: Option<Arc<dyn AddrFilter>>,
    tracer: Arc<dyn Tracer>,
}

impl<H: Host> HolePuncherBuilder<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self {
            host,
            identify: Arc::new(()),
            config: HolePunchConfig::default(),
            listen_addrs: None,
            filter: None,
            tracer: Arc::new(()),
        }
    }

    /// Service to wait on before punching an inbound relayed connection.
    ///
    /// Defaults to not waiting.
    pub fn identify(mut self, identify: impl IdentifyService) -> Self {
        self.identify = Arc::new(identify);
        self
    }

    pub fn config(mut self, config: HolePunchConfig) -> Self {
        self.config = config;
        self
    }

    /// Source of the addresses offered to remote peers.
    ///
    /// Defaults to the listen addresses announced through the host's
    /// connection events.
    pub fn listen_addrs<F>(mut self, listen_addrs: F) -> Self
    where
        F: Fn() -> Vec<Multiaddr> + Send + Sync + 'static,
    {
        self.listen_addrs = Some(Arc::new(listen_addrs));
        self
    }

    pub fn filter(mut self, filter: impl AddrFilter) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Builds the hole puncher and starts listening for connection events.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> HolePuncher<H> {
        let observed_listen_addrs = ListenAddrSet::default();
        let listen_addrs = self.listen_addrs.unwrap_or_else(|| {
            let addrs = observed_listen_addrs.clone();
            Arc::new(move || addrs.snapshot())
        });
        let events = self.host.subscribe();

        let inner = Arc::new(Inner {
            host: self.host,
            identify: self.identify,
            config: self.config,
            listen_addrs,
            observed_listen_addrs,
            filter: self.filter,
            tracer: self.tracer,
            active: ActiveAttempts::default(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        listener::spawn(inner.clone(), events);

        HolePuncher { inner }
    }
}
