//! Integration tests: client and server flows over the in-memory
//! transport.
//!
//! Covers delivery with acknowledgement, rejection paths on both
//! sides and concurrent exchanges.

use std::sync::Arc;

use futures::future::join_all;
use futures::StreamExt;
use libp2p::PeerId;
use tokio::sync::mpsc;

use dmlink_crypto::signing::Keypair;
use dmlink_network::client::DirectMessageClient;
use dmlink_network::events::InboundDirectMessage;
use dmlink_network::identity::{verify_envelope, NodeIdentity};
use dmlink_network::memory::{MemoryDialer, MemoryNetwork, StreamEvent};
use dmlink_network::protocol::DM_PROTOCOL;
use dmlink_network::server::{serve_inbound, DirectMessageServer};
use dmlink_network::transport::{Connection, Dialer, MessageStream};
use dmlink_protocol::message::{DirectMessageRequest, DirectMessageResponse, Envelope};
use dmlink_protocol::signing::seal;
use dmlink_types::config::DirectMessageConfig;
use dmlink_types::{DirectMessageError, MessageStatus};

const MAX_FRAME: usize = 64 * 1024;

fn identity(seed: u8) -> Arc<NodeIdentity> {
    Arc::new(NodeIdentity::from_keypair(Keypair::from_seed(&[seed; 32])).unwrap())
}

fn spawn_server(net: &MemoryNetwork, id: &Arc<NodeIdentity>) -> mpsc::UnboundedReceiver<InboundDirectMessage> {
    let listener = net.register(id.peer_id());
    let (tx, rx) = mpsc::unbounded_channel();
    let server = Arc::new(DirectMessageServer::new(
        Arc::clone(id),
        DirectMessageConfig::default(),
        tx,
    ));
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

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hello_is_delivered_and_acknowledged() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    let mut inbox_b = spawn_server(&net, &b);

    let ack = client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap();
    assert_eq!(ack.responder_node_id, b.node_id());
    assert_ne!(ack.request_id, ack.response_id);
    assert!(ack.responded_at > 0);

    let delivered = inbox_b.recv().await.unwrap();
    assert_eq!(delivered.sender, a.peer_id());
    assert_eq!(delivered.message, "hello");
    assert_eq!(delivered.message_id, ack.request_id);
    assert_eq!(delivered.client_version, DirectMessageConfig::default().client_version);

    let streams = net.streams();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].from, a.peer_id());
    assert_eq!(streams[0].to, b.peer_id());
    assert_eq!(streams[0].outbound.events(), vec![StreamEvent::Close]);
}

#[tokio::test]
async fn unicode_text_survives_the_exchange() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    let mut inbox_b = spawn_server(&net, &b);

    let text = "héllo, 世界 👋";
    client(&net, &a).send_direct_message(&b.peer_id(), text).await.unwrap();
    assert_eq!(inbox_b.recv().await.unwrap().message, text);
}

#[tokio::test]
async fn concurrent_exchanges_are_independent() {
    let net = MemoryNetwork::new();
    let b = identity(0xB2);
    let mut inbox_b = spawn_server(&net, &b);

    let senders: Vec<_> = [0x01, 0x02, 0x03].into_iter().map(identity).collect();
    let clients: Vec<_> = senders.iter().map(|id| client(&net, id)).collect();

    let target = b.peer_id();
    let sends = clients.iter().flat_map(|c| {
        (0..4).map(move |i| async move { c.send_direct_message(&target, &format!("msg {i}")).await })
    });
    let results = join_all(sends).await;
    assert_eq!(results.len(), 12);
    assert!(results.iter().all(|r| r.is_ok()));

    let mut per_sender = std::collections::HashMap::<PeerId, usize>::new();
    for _ in 0..12 {
        let m = inbox_b.recv().await.unwrap();
        *per_sender.entry(m.sender).or_default() += 1;
    }
    for id in &senders {
        assert_eq!(per_sender.get(&id.peer_id()), Some(&4));
    }

    let streams = net.streams();
    assert_eq!(streams.len(), 12);
    assert!(streams.iter().all(|s| s.outbound.events() == vec![StreamEvent::Close]));
}

// ---------------------------------------------------------------------------
// Client-side preconditions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_message_rejected_without_network_activity() {
    let net = MemoryNetwork::new();
    let a = identity(0xA1);

    // The target is not even registered: any dial would fail differently.
    let err = client(&net, &a)
        .send_direct_message(&PeerId::random(), "")
        .await
        .unwrap_err();
    assert!(matches!(err, DirectMessageError::EmptyMessage));
    assert!(net.streams().is_empty());
}

#[tokio::test]
async fn verify_only_identity_cannot_send() {
    let net = MemoryNetwork::new();
    let b = identity(0xB2);
    let _inbox_b = spawn_server(&net, &b);

    let full = identity(0xA1);
    let public = Arc::new(NodeIdentity::verify_only(full.public_key().as_bytes()).unwrap());
    let err = client(&net, &public)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, DirectMessageError::NoPrivateKey));
    assert!(net.streams().is_empty());
}

// ---------------------------------------------------------------------------
// Server-side rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bad_request_signature_gets_signed_error_response() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    let mut inbox_b = spawn_server(&net, &b);

    let conn = net.dialer(a.peer_id()).dial(&b.peer_id()).await.unwrap();
    let mut stream = conn.open_stream(&DM_PROTOCOL).await.unwrap();

    let mut request = DirectMessageRequest::new("hello", a.metadata("dmlink/test")).unwrap();
    seal(&mut request, |bytes| a.sign(bytes)).unwrap();
    request.message = "goodbye".into();
    stream.write_frame(&request.encode().unwrap()).await.unwrap();

    let reply = stream.read_frame(MAX_FRAME).await.unwrap();
    let response = DirectMessageResponse::decode(&reply).unwrap();
    assert_eq!(response.status, MessageStatus::Error);
    verify_envelope(&response, &b.peer_id()).unwrap();

    // Nothing reached the application.
    assert!(inbox_b.try_recv().is_err());
}

#[tokio::test]
async fn impersonating_sender_is_rejected_remotely() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    let mut inbox_b = spawn_server(&net, &b);

    // Signs as A, but the transport authenticates a different peer.
    let impostor = DirectMessageClient::new(
        net.dialer(PeerId::random()),
        Arc::clone(&a),
        DirectMessageConfig::default(),
    );
    let err = impostor
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DirectMessageError::RemoteRejected {
            status: MessageStatus::Error
        }
    ));
    assert!(inbox_b.try_recv().is_err());

    let streams = net.streams();
    assert_eq!(
        streams[0].outbound.events(),
        vec![StreamEvent::Abort, StreamEvent::Close]
    );
}

#[tokio::test]
async fn closed_inbox_answers_error() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    drop(spawn_server(&net, &b));

    let err = client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DirectMessageError::RemoteRejected {
            status: MessageStatus::Error
        }
    ));
}

// ---------------------------------------------------------------------------
// Client-side response verification
// ---------------------------------------------------------------------------

/// Runs a hand-written responder for one exchange on `b`'s address.
fn fake_responder<F>(net: &MemoryNetwork, b: PeerId, respond: F)
where
    F: FnOnce() -> Vec<u8> + Send + 'static,
{
    let mut listener = net.register(b);
    tokio::spawn(async move {
        let (_, mut stream) = listener.next().await.unwrap();
        let _request = stream.read_frame(MAX_FRAME).await.unwrap();
        stream.write_frame(&respond()).await.unwrap();
        // Hold the stream until the client is done with it.
        let _ = stream.read_frame(MAX_FRAME).await;
    });
}

#[tokio::test]
async fn response_claiming_another_node_id_is_rejected() {
    let net = MemoryNetwork::new();
    let (a, b, c) = (identity(0xA1), identity(0xB2), identity(0xC3));

    // Validly signed by C, but claims to come from B.
    let b_node_id = b.node_id();
    fake_responder(&net, b.peer_id(), move || {
        let mut md = c.metadata("dmlink/test");
        md.sender_node_id = b_node_id;
        let mut response = DirectMessageResponse::new(MessageStatus::Ok, md);
        seal(&mut response, |bytes| c.sign(bytes)).unwrap()
    });

    let err = client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, DirectMessageError::VerificationFailed { .. }));
    assert_eq!(
        net.streams()[0].outbound.events(),
        vec![StreamEvent::Abort, StreamEvent::Close]
    );
}

#[tokio::test]
async fn response_from_wrong_transport_peer_is_rejected() {
    let net = MemoryNetwork::new();
    let (a, b, c) = (identity(0xA1), identity(0xB2), identity(0xC3));

    // Self-consistent response from C, arriving on B's connection.
    fake_responder(&net, b.peer_id(), move || {
        let mut response = DirectMessageResponse::new(MessageStatus::Ok, c.metadata("dmlink/test"));
        seal(&mut response, |bytes| c.sign(bytes)).unwrap()
    });

    let err = client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, DirectMessageError::VerificationFailed { .. }));
}

#[tokio::test]
async fn tampered_response_status_is_rejected() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));

    let responder = Arc::clone(&b);
    fake_responder(&net, b.peer_id(), move || {
        let mut response = DirectMessageResponse::new(MessageStatus::Error, responder.metadata("dmlink/test"));
        seal(&mut response, |bytes| responder.sign(bytes)).unwrap();
        response.status = MessageStatus::Ok;
        response.encode().unwrap()
    });

    let err = client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, DirectMessageError::VerificationFailed { .. }));
}

#[tokio::test]
async fn unknown_status_is_remote_rejection() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));

    let responder = Arc::clone(&b);
    fake_responder(&net, b.peer_id(), move || {
        let mut response = DirectMessageResponse::new(MessageStatus::Unknown, responder.metadata("dmlink/test"));
        seal(&mut response, |bytes| responder.sign(bytes)).unwrap()
    });

    let err = client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DirectMessageError::RemoteRejected {
            status: MessageStatus::Unknown
        }
    ));
}

#[tokio::test]
async fn signed_nonstandard_status_is_remote_rejection() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));

    let responder = Arc::clone(&b);
    fake_responder(&net, b.peer_id(), move || {
        let mut response =
            DirectMessageResponse::new(MessageStatus::from_code(418), responder.metadata("dmlink/test"));
        seal(&mut response, |bytes| responder.sign(bytes)).unwrap()
    });

    let err = client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();
    match err {
        DirectMessageError::RemoteRejected { status } => {
            assert_eq!(status.code(), 418);
            assert!(status.is_unknown());
        }
        other => panic!("expected remote rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn garbage_response_is_malformed() {
    let net = MemoryNetwork::new();
    let (a, b) = (identity(0xA1), identity(0xB2));
    fake_responder(&net, b.peer_id(), || b"\xFFnot cbor".to_vec());

    let err = client(&net, &a)
        .send_direct_message(&b.peer_id(), "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, DirectMessageError::MalformedEnvelope { .. }));
    assert_eq!(
        net.streams()[0].outbound.events(),
        vec![StreamEvent::Abort, StreamEvent::Close]
    );
}
