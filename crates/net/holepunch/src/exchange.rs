//! The rendezvous exchange: CONNECT, CONNECT, SYNC over a relayed stream.
//!
//! Both sides attach the stream to the hole punching service and reserve
//! memory for one message before touching it. The whole exchange, closing the
//! stream included, runs under one deadline. On any error the stream is reset
//! so the remote notices, otherwise it is closed.

use std::time::Duration;

use asynchronous_codec::Framed;
use futures::{AsyncWriteExt, SinkExt};
use libp2p::{Multiaddr, PeerId};
use tokio::time::Instant;
use tracing::{debug, trace};
use vertex_net_codec::next_message;

use crate::{
    codec::{HolePunchCodec, HolePunchMessage},
    constants::{MAX_MESSAGE_SIZE, SERVICE_NAME},
    error::{AddrOrigin, HolePunchError},
    filter::{AddrFilter, ListenAddrs, local_candidates, remote_candidates},
    host::HolePunchStream,
};

/// Outcome of a completed rendezvous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rendezvous {
    /// Candidates offered by the remote peer, filtered.
    pub(crate) remote_addrs: Vec<Multiaddr>,
    /// Candidates we offered.
    pub(crate) local_addrs: Vec<Multiaddr>,
    /// Time between sending our CONNECT and receiving the matching message.
    pub(crate) rtt: Duration,
}

/// What both sides of the exchange need besides the stream.
#[derive(Clone, Copy)]
pub(crate) struct ExchangeContext<'a> {
    pub(crate) peer: PeerId,
    pub(crate) listen_addrs: &'a ListenAddrs,
    pub(crate) filter: Option<&'a dyn AddrFilter>,
    pub(crate) timeout: Duration,
}

/// Runs the initiator side: send CONNECT, read CONNECT, send SYNC.
pub(crate) async fn initiate<S: HolePunchStream>(
    mut stream: S,
    cx: ExchangeContext<'_>,
) -> Result<Rendezvous, HolePunchError> {
    let start = Instant::now();
    let result = tokio::time::timeout(cx.timeout, run_initiator(&mut stream, cx))
        .await
        .unwrap_or(Err(HolePunchError::Timeout));
    finish(stream, result, cx.timeout.saturating_sub(start.elapsed())).await
}

/// Runs the responder side: read CONNECT, send CONNECT, read SYNC.
pub(crate) async fn respond<S: HolePunchStream>(
    mut stream: S,
    cx: ExchangeContext<'_>,
) -> Result<Rendezvous, HolePunchError> {
    let start = Instant::now();
    let result = tokio::time::timeout(cx.timeout, run_responder(&mut stream, cx))
        .await
        .unwrap_or(Err(HolePunchError::Timeout));
    finish(stream, result, cx.timeout.saturating_sub(start.elapsed())).await
}

async fn run_initiator<S: HolePunchStream>(
    stream: &mut S,
    cx: ExchangeContext<'_>,
) -> Result<Rendezvous, HolePunchError> {
    stream.set_service(SERVICE_NAME)?;
    let _reservation = stream.reserve_memory(MAX_MESSAGE_SIZE)?;

    let local_addrs = local_candidates(cx.listen_addrs, cx.filter, &cx.peer);
    if local_addrs.is_empty() {
        return Err(HolePunchError::NoPublicAddress(AddrOrigin::Local));
    }

    let mut framed = Framed::new(stream, HolePunchCodec::new(MAX_MESSAGE_SIZE));

    framed
        .send(HolePunchMessage::connect(local_addrs.clone()))
        .await?;
    let start = Instant::now();

    let observed = expect_connect(next_message(&mut framed).await?)?;
    let rtt = start.elapsed();
    trace!(peer = %cx.peer, ?rtt, received = observed.len(), "received CONNECT");

    let remote_addrs = remote_candidates(observed, cx.filter, &cx.peer);
    if remote_addrs.is_empty() {
        return Err(HolePunchError::NoPublicAddress(AddrOrigin::Remote));
    }

    framed.send(HolePunchMessage::Sync).await?;

    Ok(Rendezvous {
        remote_addrs,
        local_addrs,
        rtt,
    })
}

async fn run_responder<S: HolePunchStream>(
    stream: &mut S,
    cx: ExchangeContext<'_>,
) -> Result<Rendezvous, HolePunchError> {
    stream.set_service(SERVICE_NAME)?;
    let _reservation = stream.reserve_memory(MAX_MESSAGE_SIZE)?;

    let mut framed = Framed::new(stream, HolePunchCodec::new(MAX_MESSAGE_SIZE));

    let observed = expect_connect(next_message(&mut framed).await?)?;
    let remote_addrs = remote_candidates(observed, cx.filter, &cx.peer);
    if remote_addrs.is_empty() {
        return Err(HolePunchError::NoPublicAddress(AddrOrigin::Remote));
    }

    let local_addrs = local_candidates(cx.listen_addrs, cx.filter, &cx.peer);
    if local_addrs.is_empty() {
        return Err(HolePunchError::NoPublicAddress(AddrOrigin::Local));
    }

    framed
        .send(HolePunchMessage::connect(local_addrs.clone()))
        .await?;
    let start = Instant::now();

    match next_message(&mut framed).await? {
        HolePunchMessage::Sync => {}
        other => {
            return Err(HolePunchError::Protocol(format!(
                "expected SYNC, got {}",
                other.kind()
            )));
        }
    }
    let rtt = start.elapsed();
    trace!(peer = %cx.peer, ?rtt, "received SYNC");

    Ok(Rendezvous {
        remote_addrs,
        local_addrs,
        rtt,
    })
}

fn expect_connect(message: HolePunchMessage) -> Result<Vec<Multiaddr>, HolePunchError> {
    match message {
        HolePunchMessage::Connect { observed_addrs } => Ok(observed_addrs),
        other => Err(HolePunchError::Protocol(format!(
            "expected CONNECT, got {}",
            other.kind()
        ))),
    }
}

/// Closes the stream within what is left of the exchange deadline, resetting
/// it if the close does not complete in time.
async fn finish<S: HolePunchStream>(
    mut stream: S,
    result: Result<Rendezvous, HolePunchError>,
    remaining: Duration,
) -> Result<Rendezvous, HolePunchError> {
    match &result {
        Ok(_) => match tokio::time::timeout(remaining, stream.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                debug!(peer = %stream.remote_peer(), %error, "failed to close hole punch stream");
            }
            Err(_) => {
                debug!(peer = %stream.remote_peer(), "timed out closing hole punch stream");
                stream.reset();
            }
        },
        Err(error) => {
            debug!(peer = %stream.remote_peer(), %error, "resetting hole punch stream");
            stream.reset();
        }
    }
    result
}
