#![allow(dead_code)]

use std::sync::Arc;

use libp2p::Multiaddr;
use vertex_net_holepunch::{HolePunchConfig, HolePuncher};
use vertex_net_holepunch_test_utils::{
    Nat, RecordingTracer, SimHost, SimIdentify, SimNetwork, addr, init_tracing,
};

/// A publicly routable QUIC address, distinct per `n`.
pub fn public_addr(n: u8) -> Multiaddr {
    addr(&format!("/ip4/8.8.4.{n}/udp/4001/quic-v1"))
}

pub struct Peer {
    pub host: Arc<SimHost>,
    pub puncher: Arc<HolePuncher<SimHost>>,
    pub tracer: RecordingTracer,
}

/// Builds a host with a hole puncher offering the host's listen addresses.
pub fn peer(
    net: &SimNetwork,
    nat: Nat,
    listen: Vec<Multiaddr>,
    config: HolePunchConfig,
    identify: SimIdentify,
) -> Peer {
    let host = net.add_host(nat, listen);
    let tracer = RecordingTracer::new();
    let addrs = host.clone();
    let puncher = HolePuncher::builder(host.clone())
        .identify(identify)
        .config(config)
        .listen_addrs(move || addrs.listen_addrs())
        .tracer(tracer.clone())
        .build();
    Peer {
        host,
        puncher: Arc::new(puncher),
        tracer,
    }
}

/// Two NAT'd peers, `x` and `y`, connected through the relay with `y` as the
/// dialer. `y` serves inbound rendezvous streams; `x` is driven by the test.
///
/// Neither side ever finishes identify, so the inbound relayed connection
/// does not trigger a hole punch on its own.
pub fn relayed_pair(net: &SimNetwork, config: HolePunchConfig) -> (Peer, Peer) {
    init_tracing();
    let x = peer(net, Nat::Behind, vec![public_addr(1)], config.clone(), SimIdentify::Never);
    let y = peer(net, Nat::Behind, vec![public_addr(2)], config, SimIdentify::Never);
    vertex_net_holepunch_test_utils::serve_inbound(&y.host, y.puncher.clone());
    net.connect_relayed(&y.host, &x.host);
    (x, y)
}
