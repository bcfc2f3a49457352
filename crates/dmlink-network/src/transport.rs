//! Transport seam consumed by the direct-message flows.
//!
//! The client and server flows never touch libp2p directly. They
//! drive a [`Dialer`], the [`Connection`] it yields and the
//! [`MessageStream`]s opened on that connection. Two implementations
//! exist: [`crate::swarm`] over a real libp2p swarm and
//! [`crate::memory`] for deterministic in-process exchanges.

use std::io;

use async_trait::async_trait;
use dmlink_types::Result;
use libp2p::{PeerId, StreamProtocol};

/// Whether a connection can carry protocol streams yet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    /// The connection exists but has not finished its upgrade
    /// (e.g. only a relayed circuit is up).
    Transient,
    /// Streams may be opened.
    Open,
}

/// Establishes connections to peers.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connection type produced by a successful dial.
    type Connection: Connection;

    /// Dials `peer`.
    ///
    /// No bound is applied here; callers wrap the future in their own
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns [`dmlink_types::DirectMessageError::NetworkError`] if
    /// the peer cannot be reached.
    async fn dial(&self, peer: &PeerId) -> Result<Self::Connection>;
}

/// An established (possibly transient) connection to one peer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Stream type opened on this connection.
    type Stream: MessageStream;

    /// Transport-authenticated identity of the remote side.
    fn remote_peer(&self) -> PeerId;

    /// Current upgrade state of the connection.
    async fn status(&self) -> ConnectionStatus;

    /// Opens a new stream negotiated for `protocol`.
    async fn open_stream(&self, protocol: &StreamProtocol) -> io::Result<Self::Stream>;
}

/// An ordered, bidirectional, frame-oriented stream.
#[async_trait]
pub trait MessageStream: Send {
    /// Writes one length-prefixed frame.
    async fn write_frame(&mut self, payload: &[u8]) -> io::Result<()>;

    /// Reads one length-prefixed frame of at most `max_len` bytes.
    async fn read_frame(&mut self, max_len: usize) -> io::Result<Vec<u8>>;

    /// Signals cancellation to the remote side and releases the stream
    /// without a graceful close.
    fn abort(&mut self);

    /// Gracefully closes the write side. Closing twice is a no-op.
    async fn close(&mut self) -> io::Result<()>;
}
