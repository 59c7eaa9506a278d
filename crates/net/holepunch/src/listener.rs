//! Reacts to the host's connection events.

use std::sync::Arc;

use libp2p::Multiaddr;
use parking_lot::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace, warn};

use crate::{
    host::{ConnectionEvent, ConnectionInfo, Host},
    puncher::Inner,
};

/// Listen addresses announced by the host.
#[derive(Debug, Clone, Default)]
pub(crate) struct ListenAddrSet {
    addrs: Arc<RwLock<Vec<Multiaddr>>>,
}

impl ListenAddrSet {
    pub(crate) fn insert(&self, addr: Multiaddr) {
        let mut addrs = self.addrs.write();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    pub(crate) fn remove(&self, addr: &Multiaddr) {
        self.addrs.write().retain(|a| a != addr);
    }

    pub(crate) fn snapshot(&self) -> Vec<Multiaddr> {
        self.addrs.read().clone()
    }
}

/// Spawns the event consumer onto the hole puncher's task tracker.
pub(crate) fn spawn<H: Host>(inner: Arc<Inner<H>>, events: broadcast::Receiver<ConnectionEvent>) {
    let tasks = inner.tasks.clone();
    tasks.spawn(run(inner, events));
}

async fn run<H: Host>(inner: Arc<Inner<H>>, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        let event = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(ConnectionEvent::Established(connection)) => {
                if connection.is_inbound() && connection.is_relayed() {
                    upgrade(&inner, connection);
                }
            }
            Ok(ConnectionEvent::NewListenAddr(addr)) => inner.observed_listen_addrs.insert(addr),
            Ok(ConnectionEvent::ExpiredListenAddr(addr)) => {
                inner.observed_listen_addrs.remove(&addr)
            }
            Ok(ConnectionEvent::Closed(_)) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "hole puncher fell behind on connection events");
            }
            Err(RecvError::Closed) => {
                debug!("connection event channel closed");
                break;
            }
        }
    }
    trace!("connection event listener stopped");
}

/// Hole punches an inbound relayed connection once its peer is identified.
fn upgrade<H: Host>(inner: &Arc<Inner<H>>, connection: ConnectionInfo) {
    let peer = connection.peer_id;
    debug!(%peer, addr = %connection.remote_addr, "inbound relayed connection");

    let inner = inner.clone();
    let tasks = inner.tasks.clone();
    tasks.spawn(async move {
        let identified = inner.identify.identify_wait(&connection);
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => return,
            _ = identified => {}
        }

        if let Err(error) = inner.direct_connect(peer).await {
            debug!(%peer, %error, "direct connection upgrade failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addr_set() {
        let set = ListenAddrSet::default();
        let a: Multiaddr = "/ip4/1.2.3.4/tcp/4001".parse().unwrap();
        let b: Multiaddr = "/ip4/1.2.3.4/udp/4001/quic-v1".parse().unwrap();

        set.insert(a.clone());
        set.insert(b.clone());
        set.insert(a.clone());
        assert_eq!(set.snapshot(), vec![a.clone(), b.clone()]);

        set.remove(&a);
        assert_eq!(set.snapshot(), vec![b]);
    }
}
