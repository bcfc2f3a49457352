//! Core message types for the direct-message protocol.
//!
//! A [`DirectMessageRequest`] carries the text being sent, a
//! [`DirectMessageResponse`] carries the recipient's verdict. Both
//! carry a mandatory [`Metadata`] block whose `signature` field signs
//! the canonical encoding of the containing message.

use chrono::Utc;
use dmlink_types::{DirectMessageError, MessageStatus, Result};
use uuid::Uuid;

use crate::canonical::{self, SignatureField};

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Sender metadata attached to every request and response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Metadata {
    /// Protocol/software version of the sender.
    pub client_version: String,
    /// Milliseconds since the Unix epoch at creation time.
    pub timestamp: u64,
    /// Per-message identifier, used for correlation and logging only.
    pub message_id: String,
    /// String identity of the sender, derived from its public key.
    pub sender_node_id: String,
    /// Raw public-key bytes of the sender.
    pub sender_public_key: Vec<u8>,
    /// Signature over the canonical encoding with this field empty.
    pub signature: Vec<u8>,
}

impl Metadata {
    /// Creates unsigned metadata stamped with the current time and a
    /// fresh UUID v4 message id.
    pub fn new(
        client_version: impl Into<String>,
        sender_node_id: impl Into<String>,
        sender_public_key: Vec<u8>,
    ) -> Self {
        Self {
            client_version: client_version.into(),
            timestamp: now_millis(),
            message_id: Uuid::new_v4().to_string(),
            sender_node_id: sender_node_id.into(),
            sender_public_key,
            signature: Vec::new(),
        }
    }

    /// Returns `true` once a signature has been stored.
    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Clamped to zero for clocks set before 1970.
pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Envelope trait
// ---------------------------------------------------------------------------

/// Common surface of signed protocol messages.
///
/// Both message kinds carry [`Metadata`] and share one canonical
/// encoder; the trait lets the signing pipeline treat them uniformly.
pub trait Envelope: Sized {
    /// Short name used in log lines.
    const KIND: &'static str;

    /// Read access to the metadata block.
    fn metadata(&self) -> &Metadata;

    /// Write access to the metadata block.
    fn metadata_mut(&mut self) -> &mut Metadata;

    /// Canonical CBOR encoding, with or without the signature.
    fn encode_with(&self, signature: SignatureField) -> Result<Vec<u8>>;

    /// Decodes a wire payload.
    fn decode(bytes: &[u8]) -> Result<Self>;

    /// Wire encoding, signature included.
    fn encode(&self) -> Result<Vec<u8>> {
        self.encode_with(SignatureField::Include)
    }
}

// ---------------------------------------------------------------------------
// DirectMessageRequest
// ---------------------------------------------------------------------------

/// A direct message from one peer to another.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirectMessageRequest {
    /// Message text. Never empty.
    pub message: String,
    /// Sender metadata.
    pub metadata: Metadata,
}

impl DirectMessageRequest {
    /// Creates a request, rejecting empty text.
    ///
    /// # Errors
    ///
    /// Returns [`DirectMessageError::EmptyMessage`] if `message` is empty.
    pub fn new(message: impl Into<String>, metadata: Metadata) -> Result<Self> {
        let message = message.into();
        if message.is_empty() {
            return Err(DirectMessageError::EmptyMessage);
        }
        Ok(Self { message, metadata })
    }
}

impl Envelope for DirectMessageRequest {
    const KIND: &'static str = "request";

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn encode_with(&self, signature: SignatureField) -> Result<Vec<u8>> {
        canonical::encode_request(self, signature)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        canonical::decode_request(bytes)
    }
}

// ---------------------------------------------------------------------------
// DirectMessageResponse
// ---------------------------------------------------------------------------

/// The recipient's answer to a [`DirectMessageRequest`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirectMessageResponse {
    /// Verdict on the request.
    pub status: MessageStatus,
    /// Responder metadata.
    pub metadata: Metadata,
}

impl DirectMessageResponse {
    /// Creates an unsigned response.
    pub fn new(status: MessageStatus, metadata: Metadata) -> Self {
        Self { status, metadata }
    }
}

impl Envelope for DirectMessageResponse {
    const KIND: &'static str = "response";

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn encode_with(&self, signature: SignatureField) -> Result<Vec<u8>> {
        canonical::encode_response(self, signature)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        canonical::decode_response(bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
