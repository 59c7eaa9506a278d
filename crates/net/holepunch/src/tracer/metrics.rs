//! Metrics tracer.

use std::collections::BTreeSet;

use libp2p::Multiaddr;
use metrics::{counter, histogram};
use vertex_net_utils::{ip_version, transport};

use super::{Side, TraceEvent, Tracer};

/// Records hole punching outcomes through the [`metrics`] facade.
///
/// Attempt counts are bucketed so label cardinality stays bounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsTracer;

impl MetricsTracer {
    pub fn new() -> Self {
        Self
    }
}

impl Tracer for MetricsTracer {
    fn trace(&self, event: TraceEvent) {
        match event {
            TraceEvent::DirectDialSucceeded { elapsed, .. } => {
                counter!("holepunch.direct_dials_total", "outcome" => "success").increment(1);
                histogram!("holepunch.direct_dial_time_secs").record(elapsed.as_secs_f64());
            }
            TraceEvent::DirectDialFailed { elapsed, .. } => {
                counter!("holepunch.direct_dials_total", "outcome" => "failed").increment(1);
                histogram!("holepunch.direct_dial_time_secs").record(elapsed.as_secs_f64());
            }
            TraceEvent::ProtocolError { .. } => {
                counter!("holepunch.protocol_errors_total").increment(1);
            }
            TraceEvent::HolePunchStarted { rtt, .. } => {
                histogram!("holepunch.rendezvous_rtt_secs").record(rtt.as_secs_f64());
            }
            TraceEvent::HolePunchAttempt { .. } => {
                counter!("holepunch.attempts_total").increment(1);
            }
            TraceEvent::HolePunchEnded { elapsed, error, .. } => {
                let outcome = if error.is_none() { "success" } else { "failed" };
                histogram!("holepunch.attempt_time_secs", "outcome" => outcome)
                    .record(elapsed.as_secs_f64());
            }
            TraceEvent::HolePunchFinished {
                side,
                attempts,
                remote_addrs,
                local_addrs,
                direct_addr,
                ..
            } => record_finished(side, attempts, &remote_addrs, &local_addrs, direct_addr.as_ref()),
        }
    }
}

fn record_finished(
    side: Side,
    attempts: u32,
    remote_addrs: &[Multiaddr],
    local_addrs: &[Multiaddr],
    direct_addr: Option<&Multiaddr>,
) {
    let num_attempts = attempts_label(attempts);
    let winner = direct_addr.map(address_labels);

    let outcome = match (winner, remote_addrs.is_empty() || local_addrs.is_empty()) {
        (Some(_), _) => "success",
        (None, true) => "no_suitable_address",
        (None, false) => "failed",
    };
    let (ipv, transport) = winner.unwrap_or(("unknown", "unknown"));
    counter!(
        "holepunch.outcomes_total",
        "side" => side.as_str(),
        "num_attempts" => num_attempts,
        "ipv" => ipv,
        "transport" => transport,
        "outcome" => outcome,
    )
    .increment(1);

    // One sample per (ip version, transport) pair that both sides offered.
    let local: BTreeSet<_> = local_addrs.iter().map(address_labels).collect();
    for pair in remote_addrs
        .iter()
        .map(address_labels)
        .filter(|pair| local.contains(pair))
        .collect::<BTreeSet<_>>()
    {
        let outcome = if Some(pair) == winner {
            "success"
        } else {
            "failed"
        };
        counter!(
            "holepunch.address_outcomes_total",
            "side" => side.as_str(),
            "num_attempts" => num_attempts,
            "ipv" => pair.0,
            "transport" => pair.1,
            "outcome" => outcome,
        )
        .increment(1);
    }
}

fn address_labels(addr: &Multiaddr) -> (&'static str, &'static str) {
    (
        ip_version(addr).map_or("unknown", |v| v.as_str()),
        transport(addr).unwrap_or("unknown"),
    )
}

fn attempts_label(attempts: u32) -> &'static str {
    match attempts {
        0 => "0",
        1 => "1",
        2 => "2",
        3 => "3",
        _ => "4+",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_label_is_bucketed() {
        assert_eq!(attempts_label(1), "1");
        assert_eq!(attempts_label(3), "3");
        assert_eq!(attempts_label(17), "4+");
    }

    #[test]
    fn test_address_labels() {
        let quic: Multiaddr = "/ip4/1.2.3.4/udp/4001/quic-v1".parse().unwrap();
        let tcp6: Multiaddr = "/ip6/2606:4700::1111/tcp/4001".parse().unwrap();
        assert_eq!(address_labels(&quic), ("ip4", "quic-v1"));
        assert_eq!(address_labels(&tcp6), ("ip6", "tcp"));
    }

    #[test]
    fn test_trace_without_recorder_is_noop() {
        let peer = libp2p::PeerId::random();
        MetricsTracer::new().trace(TraceEvent::HolePunchFinished {
            peer,
            side: Side::Initiator,
            attempts: 2,
            remote_addrs: vec!["/ip4/1.2.3.4/tcp/1".parse().unwrap()],
            local_addrs: vec!["/ip4/5.6.7.8/tcp/1".parse().unwrap()],
            direct_addr: None,
        });
    }
}
