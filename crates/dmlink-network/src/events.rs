//! Values handed from the network layer to the application.

use libp2p::PeerId;

/// A direct message whose signature and identity binding verified.
///
/// Delivered on the inbox channel registered when the server flow
/// is installed, before the `OK` response is written.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboundDirectMessage {
    /// Transport-authenticated sender.
    pub sender: PeerId,
    /// Message text.
    pub message: String,
    /// Sender-assigned message id (correlation only).
    pub message_id: String,
    /// Sender's creation timestamp in milliseconds since the epoch.
    pub timestamp: u64,
    /// Sender's declared client version.
    pub client_version: String,
}
