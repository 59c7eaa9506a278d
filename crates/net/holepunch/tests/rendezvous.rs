mod common;

use std::{io, time::Duration};

use assert_matches::assert_matches;
use futures::{AsyncReadExt, AsyncWriteExt};
use libp2p::{Multiaddr, PeerId};
use vertex_net_holepunch::{
    AddrFilter, AddrOrigin, HolePunchConfig, HolePunchError, HolePuncher, Host, PROTOCOL,
    StreamOptions, TraceEvent,
    constants::SERVICE_NAME,
};
use vertex_net_holepunch_test_utils::{
    Nat, RecordingTracer, SimIdentify, SimNetwork, addr, init_tracing, serve_inbound,
};

use common::{peer, public_addr, relayed_pair};

/// Length-prefixed `HolePunch { type: SYNC }`.
const SYNC_FRAME: [u8; 4] = [0x03, 0x08, 0xAC, 0x02];

/// Length-prefixed `HolePunch { type: CONNECT, ObsAddrs: addrs }`.
fn connect_frame(addrs: &[Multiaddr]) -> Vec<u8> {
    let mut body = vec![0x08, 0x64];
    for addr in addrs {
        let raw = addr.to_vec();
        body.push(0x12);
        body.push(u8::try_from(raw.len()).unwrap());
        body.extend_from_slice(&raw);
    }
    let mut frame = vec![u8::try_from(body.len()).unwrap()];
    frame.extend(body);
    frame
}

/// Refuses every address the remote peer offers.
struct RejectRemote;

impl AddrFilter for RejectRemote {
    fn filter_local(&self, _remote: &PeerId, addrs: Vec<Multiaddr>) -> Vec<Multiaddr> {
        addrs
    }

    fn filter_remote(&self, _remote: &PeerId, _addrs: Vec<Multiaddr>) -> Vec<Multiaddr> {
        Vec::new()
    }
}

#[tokio::test(start_paused = true)]
async fn empty_remote_candidates_abort_before_sync() {
    init_tracing();
    let net = SimNetwork::new();
    let host = net.add_host(Nat::Behind, vec![public_addr(1)]);
    let tracer = RecordingTracer::new();
    let listen = host.clone();
    let x = HolePuncher::builder(host.clone())
        .identify(SimIdentify::Never)
        .listen_addrs(move || listen.listen_addrs())
        .filter(RejectRemote)
        .tracer(tracer.clone())
        .build();
    let y = peer(
        &net,
        Nat::Behind,
        vec![public_addr(2)],
        HolePunchConfig::default(),
        SimIdentify::Never,
    );
    serve_inbound(&y.host, y.puncher.clone());
    net.connect_relayed(&y.host, &host);

    let result = x.direct_connect(y.host.peer_id()).await;

    assert_matches!(
        result,
        Err(HolePunchError::NoPublicAddress(AddrOrigin::Remote))
    );
    let streams = host.opened_streams();
    assert_eq!(streams.len(), 1);
    assert!(streams[0].is_reset());
    assert!(host.punch_dials().is_empty());
    assert_eq!(
        tracer.count(|e| matches!(e, TraceEvent::ProtocolError { .. })),
        1
    );

    // The responder never got a SYNC.
    y.tracer
        .wait_for(|e| matches!(e, TraceEvent::ProtocolError { .. }))
        .await;
    assert_eq!(
        y.tracer
            .count(|e| matches!(e, TraceEvent::HolePunchStarted { .. })),
        0
    );
    assert!(y.host.punch_dials().is_empty());
}

#[tokio::test(start_paused = true)]
async fn relay_only_listen_addrs_abort_before_connect() {
    init_tracing();
    let net = SimNetwork::new();
    let relayed = addr("/ip4/198.51.100.1/tcp/4001/p2p-circuit");
    let x = peer(
        &net,
        Nat::Behind,
        vec![relayed],
        HolePunchConfig::default(),
        SimIdentify::Never,
    );
    let y = peer(
        &net,
        Nat::Behind,
        vec![public_addr(2)],
        HolePunchConfig::default(),
        SimIdentify::Never,
    );
    serve_inbound(&y.host, y.puncher.clone());
    net.connect_relayed(&y.host, &x.host);

    assert_matches!(
        x.puncher.direct_connect(y.host.peer_id()).await,
        Err(HolePunchError::NoPublicAddress(AddrOrigin::Local))
    );
    assert!(x.host.opened_streams()[0].is_reset());
    assert_eq!(x.host.reserved_memory(), 0);
}

#[tokio::test(start_paused = true)]
async fn rtt_covers_relay_round_trip() {
    let net = SimNetwork::new();
    net.set_relay_latency(Duration::from_millis(50));
    let (x, y) = relayed_pair(&net, HolePunchConfig::default());

    x.puncher.direct_connect(y.host.peer_id()).await.unwrap();

    let started = x
        .tracer
        .find(|e| matches!(e, TraceEvent::HolePunchStarted { .. }))
        .map(|(_, e)| e);
    assert_matches!(
        started,
        Some(TraceEvent::HolePunchStarted { rtt, .. }) if rtt >= Duration::from_millis(100)
    );
}

#[tokio::test(start_paused = true)]
async fn exchange_uses_service_scope_and_releases_memory() {
    let net = SimNetwork::new();
    let (x, y) = relayed_pair(&net, HolePunchConfig::default());

    x.puncher.direct_connect(y.host.peer_id()).await.unwrap();

    let streams = x.host.opened_streams();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].service(), Some(SERVICE_NAME));
    assert!(streams[0].is_closed());
    assert!(!streams[0].is_reset());
    assert_eq!(x.host.reserved_memory(), 0);
}

#[tokio::test(start_paused = true)]
async fn protocol_error_ends_after_one_iteration() {
    let net = SimNetwork::new();
    let (x, y) = relayed_pair(&net, HolePunchConfig::default());
    // The responder cannot attach the stream and resets it.
    y.host.fail_resources();

    let error = x.puncher.direct_connect(y.host.peer_id()).await.unwrap_err();

    assert!(!error.is_retryable(), "unexpected error: {error}");
    assert_eq!(x.host.opened_streams().len(), 1);
    assert!(x.host.punch_dials().is_empty());
    assert_eq!(
        x.tracer
            .count(|e| matches!(e, TraceEvent::ProtocolError { .. })),
        1
    );
    assert_eq!(
        x.tracer
            .count(|e| matches!(e, TraceEvent::HolePunchFinished { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn local_resource_failure_is_fatal() {
    let net = SimNetwork::new();
    let (x, y) = relayed_pair(&net, HolePunchConfig::default());
    x.host.fail_resources();

    assert_matches!(
        x.puncher.direct_connect(y.host.peer_id()).await,
        Err(HolePunchError::Resource(_))
    );
    assert!(x.host.opened_streams()[0].is_reset());
}

#[tokio::test(start_paused = true)]
async fn silent_responder_hits_stream_timeout() {
    init_tracing();
    let net = SimNetwork::new();
    let config = HolePunchConfig::default().with_stream_timeout(Duration::from_secs(5));
    let x = peer(&net, Nat::Behind, vec![public_addr(1)], config, SimIdentify::Never);
    // Accepts streams but never answers.
    let y = net.add_host(Nat::Behind, vec![public_addr(2)]);
    let _inbound = y.take_inbound();
    net.connect_relayed(&y, &x.host);

    let start = tokio::time::Instant::now();
    assert_matches!(
        x.puncher.direct_connect(y.peer_id()).await,
        Err(HolePunchError::Timeout)
    );
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(x.host.opened_streams()[0].is_reset());
}

#[tokio::test(start_paused = true)]
async fn inbound_stream_over_direct_connection_is_rejected() {
    init_tracing();
    let net = SimNetwork::new();
    let config = HolePunchConfig::default();
    let x = peer(&net, Nat::Public, vec![public_addr(1)], config.clone(), SimIdentify::Never);
    let y = peer(&net, Nat::Public, vec![public_addr(2)], config, SimIdentify::Never);
    net.connect_direct(&x.host, &y.host, public_addr(2));
    let mut inbound = y.host.take_inbound().unwrap();

    let _outbound = x
        .host
        .new_stream(y.host.peer_id(), PROTOCOL, StreamOptions::rendezvous())
        .await
        .unwrap();
    let stream = inbound.recv().await.unwrap();
    let probe = stream.probe();

    assert_matches!(
        y.puncher.handle_inbound_stream(stream).await,
        Err(HolePunchError::Protocol(_))
    );
    assert!(probe.is_reset());
}

#[tokio::test(start_paused = true)]
async fn sync_in_place_of_connect_is_a_protocol_error() {
    init_tracing();
    let net = SimNetwork::new();
    let x = peer(
        &net,
        Nat::Behind,
        vec![public_addr(1)],
        HolePunchConfig::default(),
        SimIdentify::Never,
    );
    let y = net.add_host(Nat::Behind, vec![public_addr(2)]);
    let mut inbound = y.take_inbound().unwrap();
    net.connect_relayed(&y, &x.host);

    // Answers the initiator's CONNECT with a SYNC.
    let remote = tokio::spawn(async move {
        let mut stream = inbound.recv().await.unwrap();
        let mut buf = [0u8; 256];
        assert!(stream.read(&mut buf).await.unwrap() > 0);
        stream.write_all(&SYNC_FRAME).await.unwrap();
        stream
    });

    let result = x.puncher.direct_connect(y.peer_id()).await;

    assert_matches!(result, Err(HolePunchError::Protocol(reason)) if reason.contains("CONNECT"));
    let streams = x.host.opened_streams();
    assert_eq!(streams.len(), 1);
    assert!(streams[0].is_reset());
    assert!(x.host.punch_dials().is_empty());
    assert_eq!(
        x.tracer
            .count(|e| matches!(e, TraceEvent::ProtocolError { .. })),
        1
    );
    assert_eq!(x.host.reserved_memory(), 0);
    drop(remote.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn connect_in_place_of_sync_is_a_protocol_error() {
    init_tracing();
    let net = SimNetwork::new();
    let x = net.add_host(Nat::Behind, vec![public_addr(1)]);
    let y = peer(
        &net,
        Nat::Behind,
        vec![public_addr(2)],
        HolePunchConfig::default(),
        SimIdentify::Never,
    );
    serve_inbound(&y.host, y.puncher.clone());
    net.connect_relayed(&y.host, &x);

    let mut stream = x
        .new_stream(y.host.peer_id(), PROTOCOL, StreamOptions::rendezvous())
        .await
        .unwrap();
    let connect = connect_frame(&[public_addr(1)]);
    stream.write_all(&connect).await.unwrap();
    let mut buf = [0u8; 256];
    assert!(stream.read(&mut buf).await.unwrap() > 0);
    // A second CONNECT where the SYNC belongs.
    stream.write_all(&connect).await.unwrap();

    let event = y
        .tracer
        .wait_for(|e| matches!(e, TraceEvent::ProtocolError { .. }))
        .await;
    assert_matches!(event, TraceEvent::ProtocolError { error, .. } if error.contains("SYNC"));

    let error = stream.read(&mut buf).await.unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::ConnectionReset);
    assert!(y.host.punch_dials().is_empty());
    assert_eq!(
        y.tracer
            .count(|e| matches!(e, TraceEvent::HolePunchStarted { .. })),
        0
    );
    assert_eq!(y.host.reserved_memory(), 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_close_is_bounded_by_stream_timeout() {
    init_tracing();
    let net = SimNetwork::new();
    // Room for the responder's dial to wait out the stalled close.
    net.set_punch_window(Duration::from_secs(10));
    let config = HolePunchConfig::default().with_stream_timeout(Duration::from_secs(5));
    let (x, y) = relayed_pair(&net, config);
    x.host.stall_stream_close();

    let start = tokio::time::Instant::now();
    x.puncher.direct_connect(y.host.peer_id()).await.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(start.elapsed() < Duration::from_secs(6));
    let streams = x.host.opened_streams();
    assert_eq!(streams.len(), 1);
    assert!(streams[0].is_reset());
    assert!(!streams[0].is_closed());
    assert!(x.host.has_direct_connection(&y.host.peer_id()));
    assert_eq!(x.puncher.active_count(), 0);

    tokio::time::timeout(Duration::from_secs(1), x.puncher.close())
        .await
        .unwrap();
}
