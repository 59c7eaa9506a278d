//! Hole punching observability.
//!
//! The hole puncher reports what it does as [`TraceEvent`]s to a [`Tracer`].
//! Tracers are fire-and-forget: they cannot fail and must not block.

use std::{fmt, sync::Arc, time::Duration};

use libp2p::{Multiaddr, PeerId};

mod events;
mod metrics;

pub use events::EventTracer;
pub use metrics::MetricsTracer;

/// Which side of the rendezvous a finished hole punch was on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// We opened the rendezvous stream after an inbound relayed connection.
    Initiator,
    /// The remote opened the rendezvous stream to us.
    Receiver,
}

impl Side {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the hole puncher did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    DirectDialSucceeded {
        peer: PeerId,
        elapsed: Duration,
    },
    DirectDialFailed {
        peer: PeerId,
        elapsed: Duration,
        error: String,
    },
    /// The rendezvous exchange failed; the attempt was abandoned.
    ProtocolError {
        peer: PeerId,
        error: String,
    },
    /// A punch round is about to dial, after any synchronization wait.
    HolePunchStarted {
        peer: PeerId,
        remote_addrs: Vec<Multiaddr>,
        rtt: Duration,
    },
    HolePunchAttempt {
        peer: PeerId,
    },
    HolePunchEnded {
        peer: PeerId,
        elapsed: Duration,
        error: Option<String>,
    },
    /// Terminal outcome of a hole punch, successful or not.
    HolePunchFinished {
        peer: PeerId,
        side: Side,
        attempts: u32,
        remote_addrs: Vec<Multiaddr>,
        local_addrs: Vec<Multiaddr>,
        /// Remote address of the resulting direct connection, if any.
        direct_addr: Option<Multiaddr>,
    },
}

impl TraceEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            Self::DirectDialSucceeded { peer, .. }
            | Self::DirectDialFailed { peer, .. }
            | Self::ProtocolError { peer, .. }
            | Self::HolePunchStarted { peer, .. }
            | Self::HolePunchAttempt { peer }
            | Self::HolePunchEnded { peer, .. }
            | Self::HolePunchFinished { peer, .. } => peer,
        }
    }
}

/// Sink for [`TraceEvent`]s.
#[auto_impl::auto_impl(Arc, Box)]
pub trait Tracer: Send + Sync + 'static {
    fn trace(&self, event: TraceEvent);
}

/// Discards all events.
impl Tracer for () {
    fn trace(&self, _event: TraceEvent) {}
}

/// Forwards every event to each tracer in turn.
impl Tracer for Vec<Arc<dyn Tracer>> {
    fn trace(&self, event: TraceEvent) {
        for tracer in self {
            tracer.trace(event.clone());
        }
    }
}
