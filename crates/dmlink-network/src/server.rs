//! Inbound half of the direct-message exchange.
//!
//! # Handling order
//!
//! 1. Read one request frame.
//! 2. Decode. A malformed envelope aborts the stream with no response.
//! 3. Verify the identity binding against the transport peer, then
//!    the signature. On failure respond with a signed `ERROR`.
//! 4. Hand the message to the inbox.
//! 5. Respond with a signed `OK` and close the stream.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use libp2p::PeerId;
use tokio::sync::mpsc;

use dmlink_protocol::message::{DirectMessageRequest, DirectMessageResponse, Envelope};
use dmlink_protocol::signing::seal;
use dmlink_types::config::DirectMessageConfig;
use dmlink_types::{MessageStatus, Result};

use crate::events::InboundDirectMessage;
use crate::identity::{verify_envelope, NodeIdentity};
use crate::lifecycle::{Role, StreamLifecycle};
use crate::transport::MessageStream;

/// How an inbound exchange that completed its response ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InboundOutcome {
    /// Verified, delivered to the inbox and acknowledged with `OK`.
    Delivered,
    /// Answered with `ERROR`.
    Rejected,
}

/// Answers inbound direct-message streams.
pub struct DirectMessageServer {
    identity: Arc<NodeIdentity>,
    config: DirectMessageConfig,
    inbox: mpsc::UnboundedSender<InboundDirectMessage>,
}

impl DirectMessageServer {
    /// Creates a server that delivers verified messages on `inbox`.
    pub fn new(
        identity: Arc<NodeIdentity>,
        config: DirectMessageConfig,
        inbox: mpsc::UnboundedSender<InboundDirectMessage>,
    ) -> Self {
        Self {
            identity,
            config,
            inbox,
        }
    }

    /// Runs one inbound exchange on `stream`, opened by `remote`.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the exchange without a response
    /// (malformed envelope, stream I/O, signing). The stream has been
    /// aborted and closed by then.
    pub async fn handle_stream<S: MessageStream>(&self, remote: PeerId, stream: S) -> Result<InboundOutcome> {
        let mut lifecycle = StreamLifecycle::new(remote, Role::Server);
        lifecycle.attach(stream);
        let outcome = self.respond(&mut lifecycle, remote).await;
        lifecycle.finish(outcome).await
    }

    async fn respond<S: MessageStream>(
        &self,
        lifecycle: &mut StreamLifecycle<S>,
        remote: PeerId,
    ) -> Result<InboundOutcome> {
        let bytes = lifecycle.read(self.config.max_frame_bytes).await?;

        lifecycle.verifying();
        let request = DirectMessageRequest::decode(&bytes)?;

        if let Err(e) = verify_envelope(&request, &remote) {
            tracing::warn!(
                %remote,
                message_id = %request.metadata.message_id,
                error = %e,
                "rejecting direct message"
            );
            self.reply(lifecycle, MessageStatus::Error).await?;
            return Ok(InboundOutcome::Rejected);
        }

        let message_id = request.metadata.message_id.clone();
        let inbound = InboundDirectMessage {
            sender: remote,
            message: request.message,
            message_id: request.metadata.message_id,
            timestamp: request.metadata.timestamp,
            client_version: request.metadata.client_version,
        };

        // `OK` only once the inbox has taken the message.
        if self.inbox.send(inbound).is_err() {
            tracing::warn!(%remote, %message_id, "inbox closed, rejecting direct message");
            self.reply(lifecycle, MessageStatus::Error).await?;
            return Ok(InboundOutcome::Rejected);
        }

        tracing::info!(%remote, %message_id, "direct message delivered");
        self.reply(lifecycle, MessageStatus::Ok).await?;
        Ok(InboundOutcome::Delivered)
    }

    async fn reply<S: MessageStream>(&self, lifecycle: &mut StreamLifecycle<S>, status: MessageStatus) -> Result<()> {
        let metadata = self.identity.metadata(&self.config.client_version);
        let mut response = DirectMessageResponse::new(status, metadata);
        let payload = seal(&mut response, |bytes| self.identity.sign(bytes))?;
        lifecycle.write(&payload).await
    }
}

/// Accepts inbound streams until `incoming` ends, running each
/// exchange as its own task.
pub async fn serve_inbound<St, S>(server: Arc<DirectMessageServer>, mut incoming: St)
where
    St: Stream<Item = (PeerId, S)> + Unpin,
    S: MessageStream + 'static,
{
    while let Some((remote, stream)) = incoming.next().await {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            match server.handle_stream(remote, stream).await {
                Ok(outcome) => tracing::debug!(%remote, ?outcome, "inbound exchange finished"),
                Err(e) => tracing::warn!(%remote, error = %e, "inbound exchange failed"),
            }
        });
    }
    tracing::debug!("inbound stream listener closed");
}
