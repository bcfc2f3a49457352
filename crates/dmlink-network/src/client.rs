//! Outbound half of the direct-message exchange.
//!
//! [`DirectMessageClient::send_direct_message`] signs a request,
//! dials the peer, waits for a transient connection to upgrade, writes
//! the request on a fresh stream and verifies the single response
//! read back from it. The call succeeds only if the peer returned a
//! verified `OK`. It is at-most-once: nothing is retried here.

use std::sync::Arc;

use libp2p::PeerId;

use dmlink_protocol::message::{DirectMessageRequest, DirectMessageResponse, Envelope};
use dmlink_protocol::signing::seal;
use dmlink_types::config::DirectMessageConfig;
use dmlink_types::{Acknowledged, DirectMessageError, MessageStatus, Result};

use crate::identity::{verify_envelope, NodeIdentity};
use crate::lifecycle::{wait_for_upgrade, Role, StreamLifecycle};
use crate::protocol::DM_PROTOCOL;
use crate::transport::{Connection, ConnectionStatus, Dialer};

type OutboundStream<D> = <<D as Dialer>::Connection as Connection>::Stream;

/// Sends signed direct messages through a [`Dialer`].
pub struct DirectMessageClient<D: Dialer> {
    dialer: D,
    identity: Arc<NodeIdentity>,
    config: DirectMessageConfig,
}

impl<D: Dialer> DirectMessageClient<D> {
    pub fn new(dialer: D, identity: Arc<NodeIdentity>, config: DirectMessageConfig) -> Self {
        Self {
            dialer,
            identity,
            config,
        }
    }

    /// Local identity used to sign requests.
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Sends `text` to `peer` and waits for its signed acknowledgement.
    ///
    /// # Errors
    ///
    /// - [`DirectMessageError::EmptyMessage`] before any network activity.
    /// - [`DirectMessageError::NoPrivateKey`] if the identity cannot sign.
    /// - [`DirectMessageError::DialTimeout`] / [`DirectMessageError::NetworkError`]
    ///   if the peer cannot be reached in time.
    /// - [`DirectMessageError::ConnectionUpgradeTimeout`] if the
    ///   connection stays transient.
    /// - [`DirectMessageError::StreamIoFailure`] on stream errors.
    /// - [`DirectMessageError::MalformedEnvelope`] /
    ///   [`DirectMessageError::VerificationFailed`] for a bad response.
    /// - [`DirectMessageError::RemoteRejected`] for any status but `OK`.
    pub async fn send_direct_message(&self, peer: &PeerId, text: &str) -> Result<Acknowledged> {
        if text.is_empty() {
            return Err(DirectMessageError::EmptyMessage);
        }

        let metadata = self.identity.metadata(&self.config.client_version);
        let mut request = DirectMessageRequest::new(text, metadata)?;
        let payload = seal(&mut request, |bytes| self.identity.sign(bytes))?;
        let request_id = request.metadata.message_id.clone();

        let mut lifecycle: StreamLifecycle<OutboundStream<D>> =
            StreamLifecycle::new(*peer, Role::Client);
        let outcome = self.exchange(&mut lifecycle, peer, &payload).await;
        let response = lifecycle.finish(outcome).await?;

        tracing::info!(
            %peer,
            message_id = %request_id,
            response_id = %response.metadata.message_id,
            "direct message acknowledged"
        );

        Ok(Acknowledged {
            request_id,
            response_id: response.metadata.message_id,
            responder_node_id: response.metadata.sender_node_id,
            responded_at: response.metadata.timestamp,
        })
    }

    async fn exchange(
        &self,
        lifecycle: &mut StreamLifecycle<OutboundStream<D>>,
        peer: &PeerId,
        payload: &[u8],
    ) -> Result<DirectMessageResponse> {
        lifecycle.dialing();
        let connection = tokio::time::timeout(self.config.dial_timeout(), self.dialer.dial(peer))
            .await
            .map_err(|_| DirectMessageError::DialTimeout {
                timeout_ms: self.config.dial_timeout_ms,
            })??;

        if connection.status().await == ConnectionStatus::Transient {
            lifecycle.upgrade_pending();
            wait_for_upgrade(
                &connection,
                self.config.upgrade_poll_interval(),
                self.config.upgrade_wait(),
            )
            .await?;
        }

        let stream = connection
            .open_stream(&DM_PROTOCOL)
            .await
            .map_err(DirectMessageError::stream_io)?;
        lifecycle.attach(stream);

        lifecycle.write(payload).await?;
        let bytes = lifecycle.read(self.config.max_frame_bytes).await?;

        lifecycle.verifying();
        let response = DirectMessageResponse::decode(&bytes)?;
        verify_envelope(&response, &connection.remote_peer())?;

        match response.status {
            MessageStatus::Ok => Ok(response),
            status => {
                tracing::warn!(%peer, %status, "direct message rejected by peer");
                Err(DirectMessageError::RemoteRejected { status })
            }
        }
    }
}
