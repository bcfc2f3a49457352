//! In-process transport.
//!
//! [`MemoryNetwork`] connects peers inside one process through tokio
//! channels. Per-peer [`PeerBehaviour`] knobs simulate slow or
//! unreachable dials and connections that stay transient for a while,
//! and every stream carries a [`StreamLog`] recording abort/close
//! calls so the lifecycle can be observed from outside.
//!
//! Delays use `tokio::time`, so they compose with a paused clock.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use libp2p::{PeerId, StreamProtocol};
use tokio::sync::mpsc;
use tokio::time::Instant;

use dmlink_types::{DirectMessageError, Result};

use crate::protocol::DM_PROTOCOL;
use crate::transport::{Connection, ConnectionStatus, Dialer, MessageStream};

// ---------------------------------------------------------------------------
// Event logs
// ---------------------------------------------------------------------------

/// Lifecycle calls observed on a stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamEvent {
    Abort,
    Close,
}

/// Shared log of the [`StreamEvent`]s of one stream.
#[derive(Clone, Debug, Default)]
pub struct StreamLog(Arc<Mutex<Vec<StreamEvent>>>);

impl StreamLog {
    fn record(&self, event: StreamEvent) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }

    /// Events recorded so far, in order.
    pub fn events(&self) -> Vec<StreamEvent> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

// ---------------------------------------------------------------------------
// MemoryNetwork
// ---------------------------------------------------------------------------

/// Simulated conditions for dials to one peer.
#[derive(Clone, Debug, Default)]
pub struct PeerBehaviour {
    /// Delay before a dial completes.
    pub dial_delay: Option<Duration>,
    /// Dials fail immediately.
    pub unreachable: bool,
    /// Connections report `Transient` for this long after the dial.
    pub upgrade_after: Option<Duration>,
}

/// An opened stream as recorded by the network.
#[derive(Clone, Debug)]
pub struct StreamRecord {
    pub from: PeerId,
    pub to: PeerId,
    /// Event log of the dialer's half.
    pub outbound: StreamLog,
    /// Event log of the listener's half.
    pub inbound: StreamLog,
}

struct PeerEntry {
    inbound: mpsc::UnboundedSender<(PeerId, MemoryStream)>,
    behaviour: PeerBehaviour,
}

#[derive(Default)]
struct NetworkState {
    peers: HashMap<PeerId, PeerEntry>,
    streams: Vec<StreamRecord>,
}

/// A set of in-process peers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes `peer` reachable and returns the stream of inbound streams
    /// opened to it. Registering again replaces the previous listener.
    pub fn register(&self, peer: PeerId) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let behaviour = state
            .peers
            .remove(&peer)
            .map(|entry| entry.behaviour)
            .unwrap_or_default();
        state.peers.insert(peer, PeerEntry { inbound: tx, behaviour });
        MemoryListener { rx }
    }

    /// Sets the dial conditions for `peer`. Has no effect on peers that
    /// were never registered.
    pub fn set_behaviour(&self, peer: PeerId, behaviour: PeerBehaviour) {
        if let Some(entry) = self.lock().peers.get_mut(&peer) {
            entry.behaviour = behaviour;
        }
    }

    /// A dialer whose connections authenticate as `local`.
    pub fn dialer(&self, local: PeerId) -> MemoryDialer {
        MemoryDialer {
            network: self.clone(),
            local,
        }
    }

    /// Every stream opened so far.
    pub fn streams(&self) -> Vec<StreamRecord> {
        self.lock().streams.clone()
    }

    fn open(&self, from: PeerId, to: PeerId) -> io::Result<MemoryStream> {
        let (local, remote, record) = MemoryStream::pair(from, to);
        let mut state = self.lock();
        let entry = state.peers.get(&to).ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, format!("{to} is not registered"))
        })?;
        entry
            .inbound
            .send((from, remote))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, format!("{to} is not listening")))?;
        state.streams.push(record);
        Ok(local)
    }
}

/// Inbound streams for one registered peer, tagged with the opener.
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<(PeerId, MemoryStream)>,
}

impl Stream for MemoryListener {
    type Item = (PeerId, MemoryStream);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ---------------------------------------------------------------------------
// Dialer / Connection
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MemoryDialer {
    network: MemoryNetwork,
    local: PeerId,
}

#[async_trait]
impl Dialer for MemoryDialer {
    type Connection = MemoryConnection;

    async fn dial(&self, peer: &PeerId) -> Result<MemoryConnection> {
        let behaviour = self
            .network
            .lock()
            .peers
            .get(peer)
            .map(|entry| entry.behaviour.clone())
            .ok_or_else(|| DirectMessageError::NetworkError {
                reason: format!("no route to {peer}"),
            })?;

        if behaviour.unreachable {
            return Err(DirectMessageError::NetworkError {
                reason: format!("{peer} is unreachable"),
            });
        }
        if let Some(delay) = behaviour.dial_delay {
            tokio::time::sleep(delay).await;
        }

        Ok(MemoryConnection {
            network: self.network.clone(),
            local: self.local,
            remote: *peer,
            established: Instant::now(),
            upgrade_after: behaviour.upgrade_after,
        })
    }
}

pub struct MemoryConnection {
    network: MemoryNetwork,
    local: PeerId,
    remote: PeerId,
    established: Instant,
    upgrade_after: Option<Duration>,
}

#[async_trait]
impl Connection for MemoryConnection {
    type Stream = MemoryStream;

    fn remote_peer(&self) -> PeerId {
        self.remote
    }

    async fn status(&self) -> ConnectionStatus {
        match self.upgrade_after {
            Some(after) if self.established.elapsed() < after => ConnectionStatus::Transient,
            _ => ConnectionStatus::Open,
        }
    }

    async fn open_stream(&self, protocol: &StreamProtocol) -> io::Result<MemoryStream> {
        if *protocol != DM_PROTOCOL {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("protocol {protocol} not supported"),
            ));
        }
        self.network.open(self.local, self.remote)
    }
}

// ---------------------------------------------------------------------------
// MemoryStream
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Chunk {
    Frame(Vec<u8>),
    Reset,
}

/// One half of an in-process stream.
pub struct MemoryStream {
    tx: Option<mpsc::UnboundedSender<Chunk>>,
    rx: mpsc::UnboundedReceiver<Chunk>,
    events: StreamLog,
}

impl MemoryStream {
    fn pair(from: PeerId, to: PeerId) -> (Self, Self, StreamRecord) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let record = StreamRecord {
            from,
            to,
            outbound: StreamLog::default(),
            inbound: StreamLog::default(),
        };
        let a = Self {
            tx: Some(a_tx),
            rx: a_rx,
            events: record.outbound.clone(),
        };
        let b = Self {
            tx: Some(b_tx),
            rx: b_rx,
            events: record.inbound.clone(),
        };
        (a, b, record)
    }

    /// Event log of this half.
    pub fn event_log(&self) -> StreamLog {
        self.events.clone()
    }
}

#[async_trait]
impl MessageStream for MemoryStream {
    async fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "write side closed"))?;
        tx.send(Chunk::Frame(payload.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "remote dropped the stream"))
    }

    async fn read_frame(&mut self, max_len: usize) -> io::Result<Vec<u8>> {
        match self.rx.recv().await {
            Some(Chunk::Frame(frame)) if frame.len() > max_len => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit of {max_len} bytes", frame.len()),
            )),
            Some(Chunk::Frame(frame)) => Ok(frame),
            Some(Chunk::Reset) => Err(io::Error::new(io::ErrorKind::ConnectionReset, "stream reset by remote")),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed by remote")),
        }
    }

    fn abort(&mut self) {
        self.events.record(StreamEvent::Abort);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Chunk::Reset);
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.events.record(StreamEvent::Close);
        self.tx = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
