//! dmlink network layer.
//!
//! Everything between the envelope codec and the wire: the node's
//! signing identity, the transport seam, the per-exchange stream
//! lifecycle, the client and server halves of the direct-message
//! exchange, and the libp2p node that hosts them.
//!
//! # Architecture
//!
//! - [`identity`]: Node signing identity, peer-id derivation, envelope verification
//! - [`transport`]: Dialer / connection / stream traits consumed by the flows
//! - [`lifecycle`]: Stream lifecycle state machine and connection-upgrade wait
//! - [`client`]: Outbound request flow (`send_direct_message`)
//! - [`server`]: Inbound response flow and serve loop
//! - [`memory`]: Deterministic in-process transport
//! - [`swarm`]: libp2p swarm, driver task and transport adapter
//! - [`node`]: Call-once node bring-up
//! - [`config`]: Network configuration with defaults

pub mod client;
pub mod config;
pub mod events;
pub mod identity;
pub mod lifecycle;
pub mod memory;
pub mod node;
pub mod protocol;
pub mod server;
pub mod swarm;
pub mod transport;
