//! Direct Connection Upgrade through Relay (DCUtR).
//!
//! Two peers behind NATs can only reach each other through a relay. This
//! crate upgrades such a relayed connection to a direct one: both peers
//! exchange candidate addresses over the relay, measure the round trip, and
//! dial each other at the same moment so that each NAT admits the other's
//! packets.
//!
//! # Protocol
//!
//! ```text
//! Initiator (B)                         Responder (A)
//!     |                                      |
//!     |--------- CONNECT(addrs B) ---------->|  start RTT clock
//!     |<-------- CONNECT(addrs A) -----------|  stop RTT clock
//!     |--------------- SYNC ---------------->|
//!     |                                      |  dial A -> B now
//!     |  wait RTT/2, dial B -> A             |
//! ```
//!
//! The initiator is the peer that *received* the relayed connection. The
//! rendezvous runs at most [`HolePunchConfig::max_retries`] times.
//!
//! # Usage
//!
//! The crate drives a [`Host`], the network stack's view of connections,
//! streams and dials. Build a [`HolePuncher`] over it and route inbound
//! [`PROTOCOL`] streams to [`HolePuncher::handle_inbound_stream`]:
//!
//! ```ignore
//! let puncher = HolePuncher::builder(host)
//!     .config(HolePunchConfig::default())
//!     .tracer(MetricsTracer::new())
//!     .build();
//! ```

mod active;
mod codec;
mod config;
pub mod constants;
mod error;
mod exchange;
mod filter;
mod host;
mod listener;
mod puncher;
mod timing;
pub mod tracer;

#[allow(unreachable_pub)]
mod proto {
    include!(concat!(env!("OUT_DIR"), "/proto/mod.rs"));
}

pub use codec::{HolePunchCodecError, HolePunchMessage};
pub use config::HolePunchConfig;
pub use constants::{PROTOCOL, PROTOCOL_NAME};
pub use error::{AddrOrigin, HolePunchError};
pub use filter::{AddrFilter, ListenAddrs};
pub use host::{
    ConnectionEvent, ConnectionInfo, DialRequest, HolePunchStream, Host, HostError,
    IdentifyService, MemoryReservation, ResourceError, StreamOptions,
};
pub use puncher::{HolePuncher, HolePuncherBuilder};
pub use tracer::{EventTracer, MetricsTracer, Side, TraceEvent, Tracer};
