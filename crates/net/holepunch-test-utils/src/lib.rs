//! Test utilities for `vertex-net-holepunch`.
//!
//! - [`SimNetwork`] / [`SimHost`]: in-memory hosts with relayed and direct
//!   connections, latency-injecting streams and NAT'd simultaneous-open dials.
//! - [`SimIdentify`]: identify service stand-in.
//! - [`RecordingTracer`]: keeps every trace event with its timestamp.

mod identify;
mod network;
mod stream;
mod tracer;

pub use identify::SimIdentify;
pub use network::{DialRecord, Nat, SimHost, SimNetwork, serve_inbound};
pub use stream::{SimStream, StreamProbe};
pub use tracer::RecordingTracer;

use libp2p::Multiaddr;

/// Install a test-writer tracing subscriber. Honours `RUST_LOG`, defaults to `debug`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Parse a multiaddr literal.
///
/// # Panics
///
/// Panics if `s` is not a valid multiaddr.
#[allow(clippy::expect_used)]
pub fn addr(s: &str) -> Multiaddr {
    s.parse().expect("valid multiaddr literal")
}
