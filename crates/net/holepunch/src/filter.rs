//! Candidate address selection.

use std::sync::Arc;

use libp2p::{Multiaddr, PeerId};
use vertex_net_utils::remove_relay_addrs;

/// Narrows the addresses exchanged during a rendezvous.
///
/// Both methods must be pure: they are called from within the exchange and
/// may run concurrently for different peers.
#[auto_impl::auto_impl(Arc, Box)]
pub trait AddrFilter: Send + Sync + 'static {
    /// Addresses we offer to `remote`.
    fn filter_local(&self, remote: &PeerId, addrs: Vec<Multiaddr>) -> Vec<Multiaddr>;

    /// Addresses offered by `remote` that we are willing to dial.
    fn filter_remote(&self, remote: &PeerId, addrs: Vec<Multiaddr>) -> Vec<Multiaddr>;
}

/// Source of our current listen and observed addresses.
pub type ListenAddrs = Arc<dyn Fn() -> Vec<Multiaddr> + Send + Sync>;

/// Our candidates for `remote`: non-relayed addresses, filtered.
pub(crate) fn local_candidates(
    listen_addrs: &ListenAddrs,
    filter: Option<&dyn AddrFilter>,
    remote: &PeerId,
) -> Vec<Multiaddr> {
    let addrs = remove_relay_addrs(listen_addrs());
    match filter {
        Some(filter) => filter.filter_local(remote, addrs),
        None => addrs,
    }
}

/// Candidates received from `remote`: non-relayed addresses, filtered.
pub(crate) fn remote_candidates(
    received: Vec<Multiaddr>,
    filter: Option<&dyn AddrFilter>,
    remote: &PeerId,
) -> Vec<Multiaddr> {
    let addrs = remove_relay_addrs(received);
    match filter {
        Some(filter) => filter.filter_remote(remote, addrs),
        None => addrs,
    }
}
