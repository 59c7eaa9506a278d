//! Error types for hole punching.

use std::fmt;

use libp2p::PeerId;

use crate::{
    codec::HolePunchCodecError,
    host::{HostError, ResourceError},
};

/// Which side of the rendezvous ran out of usable addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrOrigin {
    /// We have nothing to offer the remote peer.
    Local,
    /// The remote peer offered nothing we can dial.
    Remote,
}

impl fmt::Display for AddrOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("no local public address to offer"),
            Self::Remote => f.write_str("remote peer offered no public address"),
        }
    }
}

/// Error from a hole punching attempt.
#[derive(Debug, thiserror::Error)]
pub enum HolePunchError {
    #[error("hole puncher is closed")]
    Closed,
    #[error("another hole punching attempt to {0} is active")]
    AlreadyActive(PeerId),
    #[error("aborting hole punch: {0}")]
    NoPublicAddress(AddrOrigin),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("codec error: {0}")]
    Codec(#[from] HolePunchCodecError),
    #[error("stream error: {0}")]
    Stream(#[from] std::io::Error),
    #[error("failed to open hole punching stream: {0}")]
    OpenStream(#[source] HostError),
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),
    #[error("rendezvous exchange timed out")]
    Timeout,
    #[error("hole punch connect failed: {0}")]
    ConnectFailed(#[source] HostError),
    #[error("hole punch connect timed out")]
    ConnectTimeout,
    #[error("all {attempts} hole punch attempts with peer {peer} failed")]
    RetriesExhausted { peer: PeerId, attempts: u32 },
    #[error("hole punch cancelled")]
    Cancelled,
}

impl HolePunchError {
    /// Whether the retry loop may start another round after this error.
    ///
    /// Only a failed or timed out connect is retried. Anything that went wrong
    /// while negotiating the rendezvous is fatal to the whole attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectFailed(_) | Self::ConnectTimeout)
    }
}
