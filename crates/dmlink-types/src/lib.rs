//! Core shared types for the dmlink direct-messaging protocol.
//!
//! This crate defines the types every other crate in the workspace
//! agrees on: the response status codes, the client-side success
//! outcome, the error taxonomy and the protocol configuration.

pub mod config;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// MessageStatus
// ---------------------------------------------------------------------------

/// Status carried by a `DirectMessageResponse`.
///
/// Wire codes are fixed: `UNKNOWN = 0`, `OK = 200`, `ERROR = 500`.
/// Any other code is kept verbatim in [`MessageStatus::Unrecognized`]
/// so a decoded response re-encodes to the bytes that were signed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// No status was set.
    Unknown,
    /// The request was verified and accepted.
    Ok,
    /// The request was received but rejected.
    Error,
    /// A code outside the known set, as it appeared on the wire.
    Unrecognized(u64),
}

impl MessageStatus {
    /// Returns the integer wire code for this status.
    pub fn code(self) -> u64 {
        match self {
            Self::Unknown => 0,
            Self::Ok => 200,
            Self::Error => 500,
            Self::Unrecognized(code) => code,
        }
    }

    /// Maps a wire code back to a status.
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => Self::Unknown,
            200 => Self::Ok,
            500 => Self::Error,
            other => Self::Unrecognized(other),
        }
    }

    /// `true` for `Unknown` and for unrecognized codes.
    pub fn is_unknown(self) -> bool {
        matches!(self, Self::Unknown | Self::Unrecognized(_))
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Ok => write!(f, "OK"),
            Self::Error => write!(f, "ERROR"),
            Self::Unrecognized(code) => write!(f, "UNKNOWN({code})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Acknowledged
// ---------------------------------------------------------------------------

/// Successful outcome of a client-side direct message exchange.
///
/// Only produced when the remote peer returned a response whose
/// signature and identity binding verified and whose status was `OK`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Acknowledged {
    /// Identifier of the request that was acknowledged.
    pub request_id: String,
    /// Identifier of the acknowledging response.
    pub response_id: String,
    /// Node id the response was signed by.
    pub responder_node_id: String,
    /// Responder's creation timestamp (ms since epoch, informational).
    pub responded_at: u64,
}

// ---------------------------------------------------------------------------
// DirectMessageError
// ---------------------------------------------------------------------------

/// Error taxonomy for the direct-message protocol.
///
/// Every failure of the client and server flows is surfaced as one of
/// these variants; none are silently swallowed.
#[derive(Debug, Error)]
pub enum DirectMessageError {
    /// The message text was empty. Raised before any network activity.
    #[error("message text must not be empty")]
    EmptyMessage,

    /// The local identity has no usable signing key.
    #[error("local identity has no private signing key")]
    NoPrivateKey,

    /// Public key bytes could not be parsed.
    #[error("malformed public key: {reason}")]
    MalformedKey {
        /// Human-readable description of the parse failure.
        reason: String,
    },

    /// Dialing the peer did not complete within the dial bound.
    #[error("dial timed out after {timeout_ms} ms")]
    DialTimeout {
        /// The bound that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// A transient connection did not become fully open in time.
    #[error("connection upgrade not completed within {waited_ms} ms")]
    ConnectionUpgradeTimeout {
        /// Total time waited, in milliseconds.
        waited_ms: u64,
    },

    /// A decoded envelope is missing required fields or is not valid CBOR.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// Human-readable description of the decoding failure.
        reason: String,
    },

    /// A signature or identity binding did not verify.
    #[error("verification failed: {reason}")]
    VerificationFailed {
        /// Human-readable description of which check failed.
        reason: String,
    },

    /// The remote peer answered with a status other than `OK`.
    #[error("remote peer rejected the message with status {status}")]
    RemoteRejected {
        /// The status returned by the remote peer.
        status: MessageStatus,
    },

    /// Opening, writing or reading the stream failed.
    #[error("stream I/O failure: {reason}")]
    StreamIoFailure {
        /// Human-readable description of the I/O failure.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    ConfigError {
        /// Human-readable description of the configuration problem.
        reason: String,
    },

    /// Node bring-up or transport plumbing failed.
    #[error("network error: {reason}")]
    NetworkError {
        /// Human-readable description of the network failure.
        reason: String,
    },
}

impl DirectMessageError {
    /// Wraps an I/O error raised while operating on a stream.
    pub fn stream_io(err: impl fmt::Display) -> Self {
        Self::StreamIoFailure {
            reason: err.to_string(),
        }
    }

    /// Shorthand for a [`DirectMessageError::MalformedEnvelope`].
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`DirectMessageError::VerificationFailed`].
    pub fn verification(reason: impl Into<String>) -> Self {
        Self::VerificationFailed {
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`DirectMessageError`].
pub type Result<T> = std::result::Result<T, DirectMessageError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
