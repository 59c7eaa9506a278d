//! Bookkeeping of in-flight hole punches.

use std::{collections::HashSet, sync::Arc};

use libp2p::PeerId;
use parking_lot::Mutex;
use tokio_util::task::task_tracker::TaskTrackerToken;

use crate::error::HolePunchError;

#[derive(Debug, Default)]
struct State {
    closed: bool,
    peers: HashSet<PeerId>,
}

/// Peers with a hole punch in progress, plus the closed flag.
///
/// Both live under one lock so that admission and shutdown are mutually
/// ordered: once [`close`](Self::close) returns, no new attempt is admitted.
#[derive(Debug, Clone, Default)]
pub(crate) struct ActiveAttempts {
    state: Arc<Mutex<State>>,
}

impl ActiveAttempts {
    /// Admits an attempt for `peer`.
    ///
    /// The peer stays registered until the returned guard is dropped. The
    /// tracker token keeps shutdown waiting for the attempt.
    pub(crate) fn begin(
        &self,
        peer: PeerId,
        token: TaskTrackerToken,
    ) -> Result<AttemptGuard, HolePunchError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HolePunchError::Closed);
        }
        if !state.peers.insert(peer) {
            return Err(HolePunchError::AlreadyActive(peer));
        }
        Ok(AttemptGuard {
            peer,
            state: self.state.clone(),
            _token: token,
        })
    }

    /// Refuses every later attempt. Returns `false` if already closed.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.closed, true)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn contains(&self, peer: &PeerId) -> bool {
        self.state.lock().peers.contains(peer)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().peers.len()
    }
}

/// Registration of one in-flight attempt. Dropping it releases the peer.
#[derive(Debug)]
pub(crate) struct AttemptGuard {
    peer: PeerId,
    state: Arc<Mutex<State>>,
    _token: TaskTrackerToken,
}

impl AttemptGuard {
    pub(crate) fn peer(&self) -> PeerId {
        self.peer
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.state.lock().peers.remove(&self.peer);
    }
}
