//! libp2p swarm hosting the direct-message protocol.
//!
//! The swarm is owned by a driver task. Everything else talks to it
//! through a [`SwarmHandle`] (commands over an mpsc channel) and a
//! cloned `libp2p_stream::Control` (stream open/accept), which the
//! [`Libp2pDialer`], [`Libp2pConnection`] and [`Libp2pStream`]
//! adapters wrap into the [`crate::transport`] traits.
//!
//! # Connection status
//!
//! A peer is `Transient` while only relayed circuits to it exist and
//! `Open` as soon as one direct connection does (a plain dial, or a
//! DCUtR hole punch upgrading a relayed connection).

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::io::AsyncWriteExt;
use futures::{Stream, StreamExt};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, NetworkBehaviour, SwarmEvent};
use libp2p::{dcutr, identify, noise, relay, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm};
use tokio::sync::{mpsc, oneshot};

use dmlink_protocol::framing;
use dmlink_types::DirectMessageError;

use crate::config::NetworkConfig;
use crate::identity::NodeIdentity;
use crate::protocol::DM_PROTOCOL;
use crate::transport::{Connection, ConnectionStatus, Dialer, MessageStream};

/// Alias that keeps `std::result::Result` unshadowed for the
/// `#[derive(NetworkBehaviour)]` expansion.
type NResult<T> = std::result::Result<T, DirectMessageError>;

fn network_error(context: &str, err: impl std::fmt::Display) -> DirectMessageError {
    DirectMessageError::NetworkError {
        reason: format!("{context}: {err}"),
    }
}

// ---------------------------------------------------------------------------
// Combined behaviour
// ---------------------------------------------------------------------------

/// Combined libp2p behaviour for a dmlink node.
///
/// The derive generates `DmBehaviourEvent` with one variant per field.
#[derive(NetworkBehaviour)]
pub struct DmBehaviour {
    /// Reach peers behind NAT through relay circuits.
    pub relay_client: relay::client::Behaviour,
    /// Upgrade relayed connections to direct ones.
    pub dcutr: dcutr::Behaviour,
    /// Exchange listen addresses and protocol versions.
    pub identify: identify::Behaviour,
    /// Raw protocol streams for direct messages.
    pub streams: libp2p_stream::Behaviour,
}

fn build_swarm(config: &NetworkConfig, identity: &NodeIdentity) -> NResult<Swarm<DmBehaviour>> {
    let keypair = identity.to_libp2p_keypair()?;
    let identify_protocol = config.identify_protocol.clone();
    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);

    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| network_error("failed to configure TCP transport", e))?
        .with_quic()
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| network_error("failed to configure relay transport", e))?
        .with_behaviour(|key, relay_client| DmBehaviour {
            relay_client,
            dcutr: dcutr::Behaviour::new(key.public().to_peer_id()),
            identify: identify::Behaviour::new(identify::Config::new(identify_protocol, key.public())),
            streams: libp2p_stream::Behaviour::new(),
        })
        .map_err(|e| network_error("failed to build network behaviour", e))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
        .build();

    Ok(swarm)
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

enum SwarmCommand {
    Listen {
        addr: Multiaddr,
        reply: oneshot::Sender<NResult<()>>,
    },
    AddAddress {
        peer: PeerId,
        addr: Multiaddr,
    },
    Dial {
        peer: PeerId,
        reply: oneshot::Sender<NResult<()>>,
    },
    Status {
        peer: PeerId,
        reply: oneshot::Sender<ConnectionStatus>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

struct SwarmDriver {
    swarm: Swarm<DmBehaviour>,
    commands: mpsc::UnboundedReceiver<SwarmCommand>,
    /// Known addresses per peer (configured or learned via Identify).
    addresses: HashMap<PeerId, Vec<Multiaddr>>,
    /// Live connections per peer; the value is `true` for relayed ones.
    connections: HashMap<PeerId, HashMap<ConnectionId, bool>>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<NResult<()>>>>,
}

impl SwarmDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        tracing::debug!("all swarm handles dropped, stopping driver");
                        break;
                    }
                },
            }
        }
    }

    fn on_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Listen { addr, reply } => {
                let result = self
                    .swarm
                    .listen_on(addr)
                    .map(|_| ())
                    .map_err(|e| network_error("failed to start listening", e));
                let _ = reply.send(result);
            }
            SwarmCommand::AddAddress { peer, addr } => self.remember_address(peer, addr),
            SwarmCommand::Dial { peer, reply } => self.dial(peer, reply),
            SwarmCommand::Status { peer, reply } => {
                let _ = reply.send(self.status_of(&peer));
            }
            SwarmCommand::ListenAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
        }
    }

    fn remember_address(&mut self, peer: PeerId, addr: Multiaddr) {
        let book = self.addresses.entry(peer).or_default();
        if !book.contains(&addr) {
            book.push(addr);
        }
    }

    fn dial(&mut self, peer: PeerId, reply: oneshot::Sender<NResult<()>>) {
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }
        if let Some(waiters) = self.pending_dials.get_mut(&peer) {
            waiters.push(reply);
            return;
        }

        let addresses = self.addresses.get(&peer).cloned().unwrap_or_default();
        match self.swarm.dial(DialOpts::peer_id(peer).addresses(addresses).build()) {
            Ok(()) => {
                tracing::debug!(%peer, "dialing");
                self.pending_dials.insert(peer, vec![reply]);
            }
            Err(e) => {
                let _ = reply.send(Err(network_error(&format!("failed to dial {peer}"), e)));
            }
        }
    }

    fn status_of(&self, peer: &PeerId) -> ConnectionStatus {
        match self.connections.get(peer) {
            Some(conns) if conns.values().any(|relayed| !relayed) => ConnectionStatus::Open,
            _ => ConnectionStatus::Transient,
        }
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<DmBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(%address, "listening");
            }

            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                let relayed = endpoint.is_relayed();
                tracing::info!(%peer_id, relayed, num_established, "connection established");
                self.connections
                    .entry(peer_id)
                    .or_default()
                    .insert(connection_id, relayed);
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                cause,
                num_established,
                ..
            } => {
                tracing::info!(%peer_id, ?cause, num_established, "connection closed");
                if let Some(conns) = self.connections.get_mut(&peer_id) {
                    conns.remove(&connection_id);
                    if conns.is_empty() {
                        self.connections.remove(&peer_id);
                    }
                }
            }

            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                tracing::warn!(%peer_id, %error, "outgoing connection error");
                if !self.swarm.is_connected(&peer_id) {
                    if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                        let reason = format!("failed to dial {peer_id}: {error}");
                        for waiter in waiters {
                            let _ = waiter.send(Err(DirectMessageError::NetworkError {
                                reason: reason.clone(),
                            }));
                        }
                    }
                }
            }

            SwarmEvent::IncomingConnectionError {
                local_addr,
                send_back_addr,
                error,
                ..
            } => {
                tracing::warn!(%local_addr, %send_back_addr, %error, "incoming connection error");
            }

            SwarmEvent::Behaviour(event) => self.on_behaviour_event(event),

            other => {
                tracing::trace!(?other, "unhandled swarm event");
            }
        }
    }

    fn on_behaviour_event(&mut self, event: DmBehaviourEvent) {
        match event {
            DmBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                tracing::debug!(
                    %peer_id,
                    protocol_version = %info.protocol_version,
                    addrs = info.listen_addrs.len(),
                    "identify received"
                );
                for addr in info.listen_addrs {
                    self.remember_address(peer_id, addr);
                }
            }
            DmBehaviourEvent::Dcutr(dcutr::Event {
                remote_peer_id,
                result,
            }) => match result {
                Ok(connection_id) => {
                    tracing::info!(peer = %remote_peer_id, ?connection_id, "hole punch succeeded");
                }
                Err(error) => {
                    tracing::warn!(peer = %remote_peer_id, %error, "hole punch failed");
                }
            },
            DmBehaviourEvent::RelayClient(event) => {
                tracing::debug!(?event, "relay client event");
            }
            other => {
                tracing::trace!(?other, "unhandled behaviour event");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SwarmHandle
// ---------------------------------------------------------------------------

/// Cloneable access to a running swarm driver.
#[derive(Clone)]
pub struct SwarmHandle {
    local_peer_id: PeerId,
    commands: mpsc::UnboundedSender<SwarmCommand>,
    control: libp2p_stream::Control,
}

/// Builds the swarm, registers the direct-message protocol for
/// inbound streams and spawns the driver task.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// - [`DirectMessageError::NoPrivateKey`] for a verify-only identity.
/// - [`DirectMessageError::NetworkError`] if transport or behaviour
///   construction fails.
pub fn spawn_swarm(config: &NetworkConfig, identity: &NodeIdentity) -> NResult<(SwarmHandle, InboundStreams)> {
    let swarm = build_swarm(config, identity)?;
    let mut control = swarm.behaviour().streams.new_control();
    let incoming = control
        .accept(DM_PROTOCOL)
        .map_err(|e| network_error("failed to register direct-message protocol", e))?;

    let local_peer_id = *swarm.local_peer_id();
    let (tx, rx) = mpsc::unbounded_channel();
    let driver = SwarmDriver {
        swarm,
        commands: rx,
        addresses: HashMap::new(),
        connections: HashMap::new(),
        pending_dials: HashMap::new(),
    };
    tokio::spawn(driver.run());

    let handle = SwarmHandle {
        local_peer_id,
        commands: tx,
        control,
    };
    Ok((handle, InboundStreams { inner: incoming }))
}

impl SwarmHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn send(&self, command: SwarmCommand) -> NResult<()> {
        self.commands.send(command).map_err(|_| DirectMessageError::NetworkError {
            reason: "swarm driver has stopped".into(),
        })
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> SwarmCommand) -> NResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| DirectMessageError::NetworkError {
            reason: "swarm driver dropped the request".into(),
        })
    }

    /// Starts listening on `addr`.
    pub async fn listen(&self, addr: Multiaddr) -> NResult<()> {
        self.request(|reply| SwarmCommand::Listen { addr, reply }).await?
    }

    /// Records an address at which `peer` can be dialed.
    pub fn add_address(&self, peer: PeerId, addr: Multiaddr) -> NResult<()> {
        self.send(SwarmCommand::AddAddress { peer, addr })
    }

    /// Addresses the swarm currently listens on.
    pub async fn listen_addrs(&self) -> NResult<Vec<Multiaddr>> {
        self.request(|reply| SwarmCommand::ListenAddrs { reply }).await
    }

    pub fn dialer(&self) -> Libp2pDialer {
        Libp2pDialer {
            handle: self.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport adapters
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Libp2pDialer {
    handle: SwarmHandle,
}

#[async_trait]
impl Dialer for Libp2pDialer {
    type Connection = Libp2pConnection;

    async fn dial(&self, peer: &PeerId) -> NResult<Libp2pConnection> {
        let peer = *peer;
        self.handle
            .request(|reply| SwarmCommand::Dial { peer, reply })
            .await??;
        Ok(Libp2pConnection {
            peer,
            handle: self.handle.clone(),
        })
    }
}

pub struct Libp2pConnection {
    peer: PeerId,
    handle: SwarmHandle,
}

#[async_trait]
impl Connection for Libp2pConnection {
    type Stream = Libp2pStream;

    fn remote_peer(&self) -> PeerId {
        self.peer
    }

    async fn status(&self) -> ConnectionStatus {
        let peer = self.peer;
        self.handle
            .request(|reply| SwarmCommand::Status { peer, reply })
            .await
            .unwrap_or(ConnectionStatus::Transient)
    }

    async fn open_stream(&self, protocol: &StreamProtocol) -> io::Result<Libp2pStream> {
        let mut control = self.handle.control.clone();
        control
            .open_stream(self.peer, protocol.clone())
            .await
            .map(Libp2pStream::new)
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

/// A negotiated libp2p substream carrying varint-framed payloads.
pub struct Libp2pStream {
    inner: Option<libp2p::Stream>,
}

impl Libp2pStream {
    fn new(stream: libp2p::Stream) -> Self {
        Self {
            inner: Some(stream),
        }
    }

    fn open(&mut self) -> io::Result<&mut libp2p::Stream> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stream already released"))
    }
}

#[async_trait]
impl MessageStream for Libp2pStream {
    async fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        framing::write_frame(self.open()?, payload).await
    }

    async fn read_frame(&mut self, max_len: usize) -> io::Result<Vec<u8>> {
        framing::read_frame(self.open()?, max_len).await
    }

    // Dropping the substream without closing it resets it at the muxer.
    fn abort(&mut self) {
        self.inner = None;
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.inner.take() {
            Some(mut stream) => stream.close().await,
            None => Ok(()),
        }
    }
}

/// Inbound direct-message streams accepted by the swarm.
pub struct InboundStreams {
    inner: libp2p_stream::IncomingStreams,
}

impl Stream for InboundStreams {
    type Item = (PeerId, Libp2pStream);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner
            .poll_next_unpin(cx)
            .map(|next| next.map(|(peer, stream)| (peer, Libp2pStream::new(stream))))
    }
}
