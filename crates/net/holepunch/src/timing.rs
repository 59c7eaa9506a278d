//! Timing of the simultaneous connect.
//!
//! The initiator measured the RTT between sending CONNECT and receiving the
//! reply. Its SYNC reaches the responder after roughly half that time, and the
//! responder dials as soon as SYNC arrives. Waiting `rtt / 2` before dialing
//! makes both sides' packets cross the NATs at about the same time.

use std::time::Duration;

use libp2p::{Multiaddr, PeerId, core::Endpoint};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::HolePunchError,
    host::{DialRequest, Host},
    tracer::{TraceEvent, Tracer},
};

/// Time to wait after the rendezvous before dialing.
pub(crate) fn sync_delay(rtt: Duration) -> Duration {
    rtt / 2
}

/// Role for the security and muxer upgrade of the timed connect.
///
/// `Dialer` acts as client. The responder always takes the opposite of the
/// initiator.
pub(crate) fn connect_role(initiator: bool, legacy_role_behavior: bool) -> Endpoint {
    let initiator_role = if legacy_role_behavior {
        Endpoint::Listener
    } else {
        Endpoint::Dialer
    };
    if initiator {
        initiator_role
    } else {
        match initiator_role {
            Endpoint::Dialer => Endpoint::Listener,
            Endpoint::Listener => Endpoint::Dialer,
        }
    }
}

/// Waits `delay`, giving up with [`HolePunchError::Cancelled`] when `cancel` fires.
pub(crate) async fn sleep_or_cancel(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), HolePunchError> {
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HolePunchError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// One timed connect to `addrs`, reported to the tracer as a hole punch attempt.
pub(crate) async fn punch<H: Host>(
    host: &H,
    tracer: &dyn Tracer,
    peer: PeerId,
    addrs: Vec<Multiaddr>,
    role: Endpoint,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), HolePunchError> {
    tracer.trace(TraceEvent::HolePunchAttempt { peer });
    debug!(%peer, ?role, addrs = addrs.len(), "hole punch connect");

    let start = tokio::time::Instant::now();
    let connect = tokio::time::timeout(
        timeout,
        host.connect(DialRequest::simultaneous(peer, addrs, role)),
    );
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HolePunchError::Cancelled),
        result = connect => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(HolePunchError::ConnectFailed(error)),
            Err(_) => Err(HolePunchError::ConnectTimeout),
        },
    };

    tracer.trace(TraceEvent::HolePunchEnded {
        peer,
        elapsed: start.elapsed(),
        error: result.as_ref().err().map(ToString::to_string),
    });
    result
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_sync_delay_is_half_rtt() {
        assert_eq!(sync_delay(Duration::from_millis(200)), Duration::from_millis(100));
        assert_eq!(sync_delay(Duration::from_millis(1)), Duration::from_micros(500));
        assert_eq!(sync_delay(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_roles_are_complementary() {
        for legacy in [true, false] {
            assert_ne!(connect_role(true, legacy), connect_role(false, legacy));
        }
        assert_eq!(connect_role(true, true), Endpoint::Listener);
        assert_eq!(connect_role(true, false), Endpoint::Dialer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_runs_full_delay() {
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        sleep_or_cancel(Duration::from_millis(100), &cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_aborts_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        assert_matches!(
            sleep_or_cancel(Duration::from_secs(5), &cancel).await,
            Err(HolePunchError::Cancelled)
        );
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_zero_delay_does_not_observe_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(sleep_or_cancel(Duration::ZERO, &cancel).await.is_ok());
    }
}
