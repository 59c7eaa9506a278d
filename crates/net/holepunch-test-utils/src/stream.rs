//! In-memory stream with one-way latency.

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::{Context, Poll, ready},
    time::Duration,
};

use futures::{AsyncRead, AsyncWrite};
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    time::{Instant, Sleep},
};
use vertex_net_holepunch::{HolePunchStream, MemoryReservation, ResourceError};

type Chunk = (Instant, Vec<u8>);

/// Observable state of one end of a [`SimStream`].
#[derive(Debug, Default)]
struct Flags {
    reset: AtomicBool,
    closed: AtomicBool,
    service: Mutex<Option<&'static str>>,
}

/// Handle for inspecting a stream end after it has been handed out.
#[derive(Debug, Clone)]
pub struct StreamProbe {
    flags: Arc<Flags>,
}

impl StreamProbe {
    pub fn is_reset(&self) -> bool {
        self.flags.reset.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::SeqCst)
    }

    /// Service the stream was attached to, if any.
    pub fn service(&self) -> Option<&'static str> {
        *self.flags.service.lock()
    }
}

/// Memory accounting and failure knobs shared by all streams of a host.
#[derive(Debug, Default)]
pub(crate) struct ResourceScope {
    pub(crate) reserved: AtomicUsize,
    pub(crate) fail: AtomicBool,
    /// Closing never completes, as with a remote that stopped reading.
    pub(crate) stall_close: AtomicBool,
}

/// One end of an in-memory stream.
///
/// Bytes written become readable at the other end after the stream's
/// latency has elapsed on the Tokio clock. Resetting an end makes the other
/// end's reads fail with [`io::ErrorKind::ConnectionReset`].
pub struct SimStream {
    peer: PeerId,
    remote_addr: Multiaddr,
    latency: Duration,
    outgoing: Option<mpsc::UnboundedSender<Chunk>>,
    incoming: mpsc::UnboundedReceiver<Chunk>,
    pending: Option<Chunk>,
    sleep: Option<Pin<Box<Sleep>>>,
    read_buf: Vec<u8>,
    local: Arc<Flags>,
    remote: Arc<Flags>,
    resources: Arc<ResourceScope>,
}

/// A connected pair of stream ends.
pub(crate) struct StreamEnd {
    pub(crate) peer: PeerId,
    pub(crate) remote_addr: Multiaddr,
    pub(crate) resources: Arc<ResourceScope>,
}

impl SimStream {
    /// Creates both ends. `a.peer` is the peer `a` talks to.
    pub(crate) fn pair(a: StreamEnd, b: StreamEnd, latency: Duration) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a_flags = Arc::new(Flags::default());
        let b_flags = Arc::new(Flags::default());

        let a = Self::new(a, latency, a_tx, a_rx, a_flags.clone(), b_flags.clone());
        let b = Self::new(b, latency, b_tx, b_rx, b_flags, a_flags);
        (a, b)
    }

    fn new(
        end: StreamEnd,
        latency: Duration,
        outgoing: mpsc::UnboundedSender<Chunk>,
        incoming: mpsc::UnboundedReceiver<Chunk>,
        local: Arc<Flags>,
        remote: Arc<Flags>,
    ) -> Self {
        Self {
            peer: end.peer,
            remote_addr: end.remote_addr,
            latency,
            outgoing: Some(outgoing),
            incoming,
            pending: None,
            sleep: None,
            read_buf: Vec::new(),
            local,
            remote,
            resources: end.resources,
        }
    }

    pub fn probe(&self) -> StreamProbe {
        StreamProbe {
            flags: self.local.clone(),
        }
    }
}

impl AsyncRead for SimStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.local.reset.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        }

        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.len());
                for (dst, src) in buf.iter_mut().zip(this.read_buf.drain(..n)) {
                    *dst = src;
                }
                return Poll::Ready(Ok(n));
            }

            if let Some((deliver_at, _)) = &this.pending {
                if Instant::now() < *deliver_at {
                    let deliver_at = *deliver_at;
                    let sleep = this
                        .sleep
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deliver_at)));
                    ready!(sleep.as_mut().poll(cx));
                }
                this.sleep = None;
                if let Some((_, data)) = this.pending.take() {
                    this.read_buf = data;
                }
                continue;
            }

            match ready!(this.incoming.poll_recv(cx)) {
                Some(chunk) => this.pending = Some(chunk),
                None if this.remote.reset.load(Ordering::SeqCst) => {
                    return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
                }
                None => return Poll::Ready(Ok(0)),
            }
        }
    }
}

impl AsyncWrite for SimStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.local.reset.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        }
        if this.remote.reset.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        let Some(outgoing) = &this.outgoing else {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        };
        let chunk = (Instant::now() + this.latency, buf.to_vec());
        if outgoing.send(chunk).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.resources.stall_close.load(Ordering::SeqCst) {
            return Poll::Pending;
        }
        this.outgoing = None;
        this.local.closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

impl HolePunchStream for SimStream {
    fn remote_peer(&self) -> PeerId {
        self.peer
    }

    fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    fn set_service(&mut self, service: &'static str) -> Result<(), ResourceError> {
        if self.resources.fail.load(Ordering::SeqCst) {
            return Err(ResourceError::Service {
                service,
                reason: "resource limit exceeded".into(),
            });
        }
        *self.local.service.lock() = Some(service);
        Ok(())
    }

    fn reserve_memory(&mut self, bytes: usize) -> Result<MemoryReservation, ResourceError> {
        if self.resources.fail.load(Ordering::SeqCst) {
            return Err(ResourceError::Memory {
                bytes,
                reason: "resource limit exceeded".into(),
            });
        }
        self.resources.reserved.fetch_add(bytes, Ordering::SeqCst);
        let resources = self.resources.clone();
        Ok(MemoryReservation::new(move || {
            resources.reserved.fetch_sub(bytes, Ordering::SeqCst);
        }))
    }

    fn reset(&mut self) {
        self.local.reset.store(true, Ordering::SeqCst);
        self.outgoing = None;
    }
}
