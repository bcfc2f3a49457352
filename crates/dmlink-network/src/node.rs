//! Call-once node bring-up.
//!
//! [`NodeLifecycle::initialize`] builds the swarm, starts listening,
//! installs the server flow with the caller's inbox channel and
//! returns a [`NodeHandle`]. Later calls return the same handle and
//! ignore their arguments.

use std::sync::Arc;

use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, OnceCell};

use dmlink_types::{Acknowledged, Result};

use crate::client::DirectMessageClient;
use crate::config::NetworkConfig;
use crate::events::InboundDirectMessage;
use crate::identity::NodeIdentity;
use crate::server::{serve_inbound, DirectMessageServer};
use crate::swarm::{spawn_swarm, Libp2pDialer, SwarmHandle};

/// Owner of the process's single node.
#[derive(Default)]
pub struct NodeLifecycle {
    node: OnceCell<NodeHandle>,
}

impl NodeLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Brings the node up once and returns its handle.
    ///
    /// Concurrent callers wait for the first initialization; a failed
    /// initialization leaves the lifecycle uninitialized so it can be
    /// retried.
    ///
    /// # Errors
    ///
    /// - [`dmlink_types::DirectMessageError::ConfigError`] for an invalid config.
    /// - [`dmlink_types::DirectMessageError::NoPrivateKey`] for a verify-only identity.
    /// - [`dmlink_types::DirectMessageError::NetworkError`] if the swarm cannot be built
    ///   or cannot listen.
    pub async fn initialize(
        &self,
        config: NetworkConfig,
        identity: Arc<NodeIdentity>,
        inbox: mpsc::UnboundedSender<InboundDirectMessage>,
    ) -> Result<NodeHandle> {
        let handle = self
            .node
            .get_or_try_init(|| NodeHandle::start(config, identity, inbox))
            .await?;
        Ok(handle.clone())
    }

    /// The handle, if [`NodeLifecycle::initialize`] has succeeded.
    pub fn get(&self) -> Option<NodeHandle> {
        self.node.get().cloned()
    }

    pub fn is_initialized(&self) -> bool {
        self.node.initialized()
    }
}

/// Running node: swarm access plus the client flow.
#[derive(Clone)]
pub struct NodeHandle {
    swarm: SwarmHandle,
    client: Arc<DirectMessageClient<Libp2pDialer>>,
}

impl NodeHandle {
    async fn start(
        config: NetworkConfig,
        identity: Arc<NodeIdentity>,
        inbox: mpsc::UnboundedSender<InboundDirectMessage>,
    ) -> Result<Self> {
        config.validate()?;

        let (swarm, incoming) = spawn_swarm(&config, &identity)?;
        swarm.listen(config.listen_addr.clone()).await?;

        let server = Arc::new(DirectMessageServer::new(
            Arc::clone(&identity),
            config.direct_message.clone(),
            inbox,
        ));
        tokio::spawn(serve_inbound(server, incoming));

        let client = Arc::new(DirectMessageClient::new(
            swarm.dialer(),
            identity,
            config.direct_message,
        ));

        tracing::info!(peer_id = %swarm.local_peer_id(), "node initialized");
        Ok(Self { swarm, client })
    }

    pub fn peer_id(&self) -> PeerId {
        self.swarm.local_peer_id()
    }

    /// Listens on an additional address.
    pub async fn listen(&self, addr: Multiaddr) -> Result<()> {
        self.swarm.listen(addr).await
    }

    /// Addresses the node currently listens on.
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        self.swarm.listen_addrs().await
    }

    /// Records an address at which `peer` can be dialed.
    pub fn add_address(&self, peer: PeerId, addr: Multiaddr) -> Result<()> {
        self.swarm.add_address(peer, addr)
    }

    /// See [`DirectMessageClient::send_direct_message`].
    pub async fn send_direct_message(&self, peer: &PeerId, text: &str) -> Result<Acknowledged> {
        self.client.send_direct_message(peer, text).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
