//! Integration tests: time bounds and abort/close behaviour of the
//! direct-message exchange over the in-memory transport.
//!
//! Time-bound scenarios run on tokio's paused clock.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio::time::Instant;

use dmlink_crypto::signing::Keypair;
use dmlink_network::client::DirectMessageClient;
use dmlink_network::events::InboundDirectMessage;
use dmlink_network::identity::NodeIdentity;
use dmlink_network::memory::{
    MemoryDialer, MemoryNetwork, MemoryStream, PeerBehaviour, StreamEvent, StreamLog,
};
use dmlink_network::protocol::DM_PROTOCOL;
use dmlink_network::server::{serve_inbound, DirectMessageServer, InboundOutcome};
use dmlink_network::transport::{Connection, Dialer, MessageStream};
use dmlink_protocol::message::{DirectMessageRequest, Envelope};
use dmlink_protocol::signing::seal;
use dmlink_types::config::DirectMessageConfig;
use dmlink_types::DirectMessageError;

const MAX_FRAME: usize = 64 * 1024;

fn identity(seed: u8) -> Arc<NodeIdentity> {
    Arc::new(NodeIdentity::from_keypair(Keypair::from_seed(&[seed; 32])).unwrap())
}

fn server(id: &Arc<NodeIdentity>) -> (Arc<DirectMessageServer>, mpsc::UnboundedReceiver<InboundDirectMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = DirectMessageServer::new(Arc::clone(id), DirectMessageConfig::default(), tx);
    (Arc::new(server), rx)
}

fn spawn_server(net: &MemoryNetwork, id: &Arc<NodeIdentity>) -> mpsc::UnboundedReceiver<InboundDirectMessage> {
    let listener = net.register(id.peer_id());
    let (server, rx) = server(id);
    tokio::spawn(serve_inbound(server, listener));
    rx
}

fn client(net: &MemoryNetwork, id: &Arc<NodeIdentity>) -> DirectMessageClient<MemoryDialer> {
    DirectMessageClient::new(
        net.dialer(id.peer_id()),
        Arc::clone(id),
        DirectMessageConfig::default(),
    )
}

async fn wait_for_events(log: &StreamLog, count: usize) -> Vec<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let events = log.events();
            if events.len() >= count {
                return events;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap()
}

// ---------------------------------------------------------------------------
// Dial and upgrade bounds
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn dial_that_never_completes_times_out() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    let _inbox_b = spawn_server(&net, &b);
    net.set_behaviour(
        b.peer_id(),
        PeerBehaviour {
            dial_delay: Some(Duration::from_secs(3600)),
            ..PeerBehaviour::default()
        },
    );

    let started = Instant::now();
    let err = client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();

    assert!(matches!(err, DirectMessageError::DialTimeout { timeout_ms: 5_000 }));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(5));
    assert!(waited < Duration::from_secs(6));
    assert!(net.streams().is_empty(), "no stream may be left open");
}

#[tokio::test(start_paused = true)]
async fn slow_dial_within_bound_succeeds() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    let mut inbox_b = spawn_server(&net, &b);
    net.set_behaviour(
        b.peer_id(),
        PeerBehaviour {
            dial_delay: Some(Duration::from_millis(4_500)),
            ..PeerBehaviour::default()
        },
    );

    client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap();
    assert_eq!(inbox_b.recv().await.unwrap().message, "hello");
}

#[tokio::test(start_paused = true)]
async fn connection_that_stays_transient_times_out() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    let _inbox_b = spawn_server(&net, &b);
    net.set_behaviour(
        b.peer_id(),
        PeerBehaviour {
            upgrade_after: Some(Duration::MAX),
            ..PeerBehaviour::default()
        },
    );

    let err = client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();
    match err {
        DirectMessageError::ConnectionUpgradeTimeout { waited_ms } => {
            assert!((2_000..2_100).contains(&waited_ms), "waited {waited_ms} ms");
        }
        other => panic!("expected upgrade timeout, got {other:?}"),
    }
    assert!(net.streams().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_connection_upgrades_then_delivers() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    let mut inbox_b = spawn_server(&net, &b);
    net.set_behaviour(
        b.peer_id(),
        PeerBehaviour {
            upgrade_after: Some(Duration::from_millis(750)),
            ..PeerBehaviour::default()
        },
    );

    let started = Instant::now();
    client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(750));
    assert_eq!(inbox_b.recv().await.unwrap().sender, a.peer_id());
}

#[tokio::test]
async fn unreachable_peer_is_network_error() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    let _inbox_b = spawn_server(&net, &b);
    net.set_behaviour(
        b.peer_id(),
        PeerBehaviour {
            unreachable: true,
            ..PeerBehaviour::default()
        },
    );

    let err = client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, DirectMessageError::NetworkError { .. }));
    assert!(net.streams().is_empty());
}

// ---------------------------------------------------------------------------
// Abort then close
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_failure_aborts_then_closes_once() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));

    // Reads the request, then resets the stream instead of answering.
    let mut listener = net.register(b.peer_id());
    tokio::spawn(async move {
        let (_, mut stream) = listener.next().await.unwrap();
        stream.read_frame(MAX_FRAME).await.unwrap();
        stream.abort();
    });

    let err = client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, DirectMessageError::StreamIoFailure { .. }));

    let streams = net.streams();
    assert_eq!(streams.len(), 1);
    assert_eq!(
        streams[0].outbound.events(),
        vec![StreamEvent::Abort, StreamEvent::Close]
    );
}

#[tokio::test]
async fn oversized_response_aborts() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));

    let mut listener = net.register(b.peer_id());
    tokio::spawn(async move {
        let (_, mut stream) = listener.next().await.unwrap();
        stream.read_frame(MAX_FRAME).await.unwrap();
        stream.write_frame(&vec![0u8; 1024]).await.unwrap();
        let _ = stream.read_frame(MAX_FRAME).await;
    });

    let config = DirectMessageConfig {
        max_frame_bytes: 512,
        ..DirectMessageConfig::default()
    };
    let small = DirectMessageClient::new(net.dialer(a.peer_id()), Arc::clone(&a), config);
    let err = small
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, DirectMessageError::StreamIoFailure { .. }));
    assert_eq!(
        net.streams()[0].outbound.events(),
        vec![StreamEvent::Abort, StreamEvent::Close]
    );
}

// ---------------------------------------------------------------------------
// Server stream handling
// ---------------------------------------------------------------------------

/// Opens a raw stream from `from` to `to` and returns both halves.
async fn raw_pair(
    net: &MemoryNetwork,
    from: PeerId,
    to: PeerId,
) -> (MemoryStream, MemoryStream) {
    let mut listener = net.register(to);
    let conn = net.dialer(from).dial(&to).await.unwrap();
    let client_half = conn.open_stream(&DM_PROTOCOL).await.unwrap();
    let (opener, server_half) = listener.next().await.unwrap();
    assert_eq!(opener, from);
    (client_half, server_half)
}

#[tokio::test]
async fn malformed_request_aborts_without_response() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    let (server, mut inbox) = server(&b);

    let (mut client_half, server_half) = raw_pair(&net, a.peer_id(), b.peer_id()).await;
    client_half.write_frame(b"\xFFnot cbor").await.unwrap();

    let result = server.handle_stream(a.peer_id(), server_half).await;
    assert!(matches!(result, Err(DirectMessageError::MalformedEnvelope { .. })));

    let err = client_half.read_frame(MAX_FRAME).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    assert!(inbox.try_recv().is_err());

    let events = wait_for_events(&net.streams()[0].inbound, 2).await;
    assert_eq!(events, vec![StreamEvent::Abort, StreamEvent::Close]);
}

#[tokio::test]
async fn request_without_metadata_aborts_without_response() {
    use ciborium::value::Value;

    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    let (server, _inbox) = server(&b);

    let (mut client_half, server_half) = raw_pair(&net, a.peer_id(), b.peer_id()).await;
    let mut bytes = Vec::new();
    let map = Value::Map(vec![(Value::Text("message".into()), Value::Text("hello".into()))]);
    ciborium::into_writer(&map, &mut bytes).unwrap();
    client_half.write_frame(&bytes).await.unwrap();

    let result = server.handle_stream(a.peer_id(), server_half).await;
    assert!(matches!(result, Err(DirectMessageError::MalformedEnvelope { .. })));
    assert!(client_half.read_frame(MAX_FRAME).await.is_err());
}

#[tokio::test]
async fn handled_stream_outcomes() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    let (server, mut inbox) = server(&b);

    // Valid request.
    let (mut client_half, server_half) = raw_pair(&net, a.peer_id(), b.peer_id()).await;
    let mut request = DirectMessageRequest::new("hello", a.metadata("dmlink/test")).unwrap();
    let wire = seal(&mut request, |bytes| a.sign(bytes)).unwrap();
    client_half.write_frame(&wire).await.unwrap();
    let outcome = server.handle_stream(a.peer_id(), server_half).await.unwrap();
    assert_eq!(outcome, InboundOutcome::Delivered);
    assert!(client_half.read_frame(MAX_FRAME).await.is_ok());
    assert_eq!(inbox.try_recv().unwrap().message, "hello");

    // Same request replayed from a different transport peer.
    let intruder = PeerId::random();
    let (mut client_half, server_half) = raw_pair(&net, intruder, b.peer_id()).await;
    client_half.write_frame(&request.encode().unwrap()).await.unwrap();
    let outcome = server.handle_stream(intruder, server_half).await.unwrap();
    assert_eq!(outcome, InboundOutcome::Rejected);
    assert!(inbox.try_recv().is_err());

    // Both server halves closed gracefully.
    for record in net.streams() {
        assert_eq!(record.inbound.events(), vec![StreamEvent::Close]);
    }
}
