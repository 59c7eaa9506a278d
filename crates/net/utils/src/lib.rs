//! Multiaddr utilities shared by the vertex network crates.
//!
//! Classification helpers answer the questions NAT traversal keeps asking:
//! is this address routed through a relay, is it reachable from the public
//! internet, and which IP version / transport does it use.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use libp2p::{Multiaddr, multiaddr::Protocol};
use tracing::trace;

/// IP version of an address, used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// Label value for metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::V4 => "ip4",
            Self::V6 => "ip6",
        }
    }
}

/// Returns `true` if the address is routed through a circuit relay.
pub fn is_relayed(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// Drop every relayed address, preserving the order of the rest.
pub fn remove_relay_addrs<I>(addrs: I) -> Vec<Multiaddr>
where
    I: IntoIterator<Item = Multiaddr>,
{
    addrs.into_iter().filter(|a| !is_relayed(a)).collect()
}

/// Returns `true` if the address is plausibly reachable from the public internet.
///
/// Only the first component is inspected. DNS names count as public unless they
/// point at the local host or an mDNS domain.
pub fn is_public(addr: &Multiaddr) -> bool {
    match addr.iter().next() {
        Some(Protocol::Ip4(ip)) => is_public_ipv4(ip),
        Some(Protocol::Ip6(ip)) => is_public_ipv6(ip),
        Some(
            Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) | Protocol::Dnsaddr(name),
        ) => is_public_dns_name(&name),
        _ => false,
    }
}

/// Returns `true` if the IP address is globally routable.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_ipv4(v4),
        IpAddr::V6(v6) => is_public_ipv6(v6),
    }
}

fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    let shared = a == 100 && (b & 0b1100_0000) == 64; // 100.64.0.0/10 (CGNAT)
    let protocol_assignments = a == 192 && b == 0 && c == 0; // 192.0.0.0/24
    let relay_anycast = a == 192 && b == 88 && c == 99; // 192.88.99.0/24 (6to4)
    let benchmarking = a == 198 && (b & 0xfe) == 18; // 198.18.0.0/15
    let this_network = a == 0; // 0.0.0.0/8
    let reserved = a >= 240; // 240.0.0.0/4 and broadcast

    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || shared
        || protocol_assignments
        || relay_anycast
        || benchmarking
        || this_network
        || reserved)
}

fn is_public_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_public_ipv4(v4);
    }

    let segments = ip.segments();
    let unique_local = (segments[0] & 0xfe00) == 0xfc00; // fc00::/7
    let link_local = (segments[0] & 0xffc0) == 0xfe80; // fe80::/10
    let documentation = segments[0] == 0x2001 && segments[1] == 0x0db8; // 2001:db8::/32
    let discard = segments[0] == 0x0100 && segments[1] == 0 && segments[2] == 0 && segments[3] == 0; // 100::/64

    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        || unique_local
        || link_local
        || documentation
        || discard)
}

fn is_public_dns_name(name: &str) -> bool {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    !(name == "localhost" || name.ends_with(".localhost") || name.ends_with(".local"))
}

/// IP version of the address's first component, if it is an IP address.
pub fn ip_version(addr: &Multiaddr) -> Option<IpVersion> {
    match addr.iter().next() {
        Some(Protocol::Ip4(_) | Protocol::Dns4(_)) => Some(IpVersion::V4),
        Some(Protocol::Ip6(_) | Protocol::Dns6(_)) => Some(IpVersion::V6),
        _ => None,
    }
}

/// The most specific transport label for the address.
pub fn transport(addr: &Multiaddr) -> Option<&'static str> {
    let mut found = None;
    for protocol in addr.iter() {
        let label = match protocol {
            Protocol::WebTransport => return Some("webtransport"),
            Protocol::WebRTCDirect => return Some("webrtc-direct"),
            Protocol::QuicV1 => "quic-v1",
            Protocol::Quic => "quic",
            Protocol::Tcp(_) => "tcp",
            Protocol::Udp(_) if found.is_none() => "udp",
            _ => continue,
        };
        found = Some(label);
    }
    found
}

/// Binary encoding of each address.
pub fn addrs_to_bytes(addrs: &[Multiaddr]) -> Vec<Vec<u8>> {
    addrs.iter().map(|a| a.to_vec()).collect()
}

/// Decode binary addresses, skipping any that fail to parse.
pub fn addrs_from_bytes<I>(raw: I) -> Vec<Multiaddr>
where
    I: IntoIterator<Item = Vec<u8>>,
{
    raw.into_iter()
        .filter_map(|bytes| match Multiaddr::try_from(bytes) {
            Ok(addr) => Some(addr),
            Err(error) => {
                trace!(%error, "skipping undecodable multiaddr");
                None
            }
        })
        .collect()
}
