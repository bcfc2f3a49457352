//! Canonical CBOR serialization per RFC 8949 §4.2 (Core Deterministic Encoding).
//!
//! Requests and responses are signed over their canonical CBOR
//! representation, so the encoding must be byte-identical on every
//! node. The encoder guarantees:
//!
//! - **Sorted keys**: map keys ordered by their CBOR-encoded byte form
//!   (shortest first, then bytewise lexicographic).
//! - **Definite-length**: all maps and byte/text strings use
//!   definite-length encoding.
//! - **Preferred integers**: integers use the shortest encoding.
//!
//! Canonical key orders:
//!
//! | Map        | Keys (in order) |
//! |------------|-----------------|
//! | request    | `message`, `metadata` |
//! | response   | `status`, `metadata` |
//! | metadata   | `signature`, `timestamp`, `message_id`, `client_version`, `sender_node_id`, `sender_public_key` |
//!
//! Signing uses the same encoder with [`SignatureField::Cleared`], which
//! writes `signature` as an empty byte string.

use std::collections::HashMap;

use ciborium::value::Integer;
use ciborium::Value;
use dmlink_types::{DirectMessageError, MessageStatus, Result};

use crate::message::{DirectMessageRequest, DirectMessageResponse, Metadata};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const KEY_MESSAGE: &str = "message";
const KEY_METADATA: &str = "metadata";
const KEY_STATUS: &str = "status";

const KEY_SIGNATURE: &str = "signature";
const KEY_TIMESTAMP: &str = "timestamp";
const KEY_MESSAGE_ID: &str = "message_id";
const KEY_CLIENT_VERSION: &str = "client_version";
const KEY_SENDER_NODE_ID: &str = "sender_node_id";
const KEY_SENDER_PUBLIC_KEY: &str = "sender_public_key";

/// Request keys in canonical order.
const REQUEST_KEYS: [&str; 2] = [KEY_MESSAGE, KEY_METADATA];

/// Response keys in canonical order.
const RESPONSE_KEYS: [&str; 2] = [KEY_STATUS, KEY_METADATA];

/// Metadata keys in canonical order.
///
/// Each key's CBOR text encoding starts with `0x60 + len`, so shorter
/// keys sort first; ties broken by UTF-8 byte comparison.
const METADATA_KEYS: [&str; 6] = [
    KEY_SIGNATURE,         // 0x69 (len 9, 's')
    KEY_TIMESTAMP,         // 0x69 (len 9, 't')
    KEY_MESSAGE_ID,        // 0x6A (len 10)
    KEY_CLIENT_VERSION,    // 0x6E (len 14, 'c')
    KEY_SENDER_NODE_ID,    // 0x6E (len 14, 's')
    KEY_SENDER_PUBLIC_KEY, // 0x71 (len 17)
];

// ---------------------------------------------------------------------------
// SignatureField
// ---------------------------------------------------------------------------

/// Whether the encoder writes the stored signature or an empty one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureField {
    /// Write `metadata.signature` as stored (wire encoding).
    Include,
    /// Write `metadata.signature` as an empty byte string (signing input).
    Cleared,
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Serializes a [`DirectMessageRequest`] to canonical CBOR.
///
/// # Errors
///
/// Returns [`DirectMessageError::MalformedEnvelope`] if CBOR
/// serialization fails.
pub fn encode_request(request: &DirectMessageRequest, signature: SignatureField) -> Result<Vec<u8>> {
    let map = Value::Map(vec![
        (
            Value::Text(KEY_MESSAGE.into()),
            Value::Text(request.message.clone()),
        ),
        (
            Value::Text(KEY_METADATA.into()),
            metadata_value(&request.metadata, signature),
        ),
    ]);
    write_value(&map)
}

/// Serializes a [`DirectMessageResponse`] to canonical CBOR.
///
/// # Errors
///
/// Returns [`DirectMessageError::MalformedEnvelope`] if CBOR
/// serialization fails.
pub fn encode_response(response: &DirectMessageResponse, signature: SignatureField) -> Result<Vec<u8>> {
    let map = Value::Map(vec![
        (
            Value::Text(KEY_STATUS.into()),
            Value::Integer(Integer::from(response.status.code())),
        ),
        (
            Value::Text(KEY_METADATA.into()),
            metadata_value(&response.metadata, signature),
        ),
    ]);
    write_value(&map)
}

/// Builds the metadata map in canonical key order.
fn metadata_value(metadata: &Metadata, signature: SignatureField) -> Value {
    let signature_bytes = match signature {
        SignatureField::Include => metadata.signature.clone(),
        SignatureField::Cleared => Vec::new(),
    };

    Value::Map(vec![
        (Value::Text(KEY_SIGNATURE.into()), Value::Bytes(signature_bytes)),
        (
            Value::Text(KEY_TIMESTAMP.into()),
            Value::Integer(Integer::from(metadata.timestamp)),
        ),
        (
            Value::Text(KEY_MESSAGE_ID.into()),
            Value::Text(metadata.message_id.clone()),
        ),
        (
            Value::Text(KEY_CLIENT_VERSION.into()),
            Value::Text(metadata.client_version.clone()),
        ),
        (
            Value::Text(KEY_SENDER_NODE_ID.into()),
            Value::Text(metadata.sender_node_id.clone()),
        ),
        (
            Value::Text(KEY_SENDER_PUBLIC_KEY.into()),
            Value::Bytes(metadata.sender_public_key.clone()),
        ),
    ])
}

fn write_value(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| DirectMessageError::malformed(format!("CBOR serialization failed: {e}")))?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Deserializes a [`DirectMessageRequest`] from CBOR bytes.
///
/// # Errors
///
/// Returns [`DirectMessageError::MalformedEnvelope`] if the bytes are
/// not a CBOR map, contain duplicate or unknown keys, or lack
/// `metadata` or a non-empty `message`.
pub fn decode_request(bytes: &[u8]) -> Result<DirectMessageRequest> {
    let mut fields = FieldMap::parse(read_value(bytes)?, &REQUEST_KEYS, "request")?;

    let metadata = decode_metadata(fields.take(KEY_METADATA)?)?;
    let message = fields.take_text(KEY_MESSAGE)?;
    if message.is_empty() {
        return Err(DirectMessageError::malformed("request message is empty"));
    }

    Ok(DirectMessageRequest { message, metadata })
}

/// Deserializes a [`DirectMessageResponse`] from CBOR bytes.
///
/// Codes outside the known set decode as
/// [`MessageStatus::Unrecognized`] with the code preserved.
///
/// # Errors
///
/// Returns [`DirectMessageError::MalformedEnvelope`] if the bytes are
/// not a CBOR map, contain duplicate or unknown keys, or lack
/// `metadata` or `status`.
pub fn decode_response(bytes: &[u8]) -> Result<DirectMessageResponse> {
    let mut fields = FieldMap::parse(read_value(bytes)?, &RESPONSE_KEYS, "response")?;

    let metadata = decode_metadata(fields.take(KEY_METADATA)?)?;
    let status = MessageStatus::from_code(fields.take_uint(KEY_STATUS)?);

    Ok(DirectMessageResponse { status, metadata })
}

fn decode_metadata(value: Value) -> Result<Metadata> {
    let mut fields = FieldMap::parse(value, &METADATA_KEYS, "metadata")?;

    Ok(Metadata {
        client_version: fields.take_text(KEY_CLIENT_VERSION)?,
        timestamp: fields.take_uint(KEY_TIMESTAMP)?,
        message_id: fields.take_text(KEY_MESSAGE_ID)?,
        sender_node_id: fields.take_text(KEY_SENDER_NODE_ID)?,
        sender_public_key: fields.take_bytes(KEY_SENDER_PUBLIC_KEY)?,
        signature: fields.take_bytes(KEY_SIGNATURE)?,
    })
}

fn read_value(bytes: &[u8]) -> Result<Value> {
    ciborium::from_reader(bytes)
        .map_err(|e| DirectMessageError::malformed(format!("CBOR deserialization failed: {e}")))
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Text-keyed view over a decoded CBOR map.
struct FieldMap {
    what: &'static str,
    fields: HashMap<String, Value>,
}

impl FieldMap {
    /// Validates the map shape: text keys only, no duplicates, and
    /// every key drawn from `allowed`.
    fn parse(value: Value, allowed: &[&str], what: &'static str) -> Result<Self> {
        let entries = match value {
            Value::Map(entries) => entries,
            _ => {
                return Err(DirectMessageError::malformed(format!(
                    "{what} must be a CBOR map"
                )));
            }
        };

        let mut fields = HashMap::with_capacity(entries.len());
        for (k, v) in entries {
            let key = match k {
                Value::Text(s) => s,
                _ => {
                    return Err(DirectMessageError::malformed(format!(
                        "{what}: map key must be a text string"
                    )));
                }
            };
            if !allowed.contains(&key.as_str()) {
                return Err(DirectMessageError::malformed(format!(
                    "{what}: unexpected key '{key}'"
                )));
            }
            if fields.insert(key.clone(), v).is_some() {
                return Err(DirectMessageError::malformed(format!(
                    "{what}: duplicate key '{key}'"
                )));
            }
        }

        Ok(Self { what, fields })
    }

    fn take(&mut self, key: &str) -> Result<Value> {
        self.fields.remove(key).ok_or_else(|| {
            DirectMessageError::malformed(format!("{}: missing field '{key}'", self.what))
        })
    }

    fn take_text(&mut self, key: &str) -> Result<String> {
        match self.take(key)? {
            Value::Text(s) => Ok(s),
            _ => Err(self.wrong_type(key, "text string")),
        }
    }

    fn take_bytes(&mut self, key: &str) -> Result<Vec<u8>> {
        match self.take(key)? {
            Value::Bytes(b) => Ok(b),
            _ => Err(self.wrong_type(key, "byte string")),
        }
    }

    fn take_uint(&mut self, key: &str) -> Result<u64> {
        match self.take(key)? {
            Value::Integer(i) => u64::try_from(i).map_err(|_| {
                DirectMessageError::malformed(format!(
                    "{}: field '{key}' is not an unsigned 64-bit integer",
                    self.what
                ))
            }),
            _ => Err(self.wrong_type(key, "unsigned integer")),
        }
    }

    fn wrong_type(&self, key: &str, expected: &str) -> DirectMessageError {
        DirectMessageError::malformed(format!(
            "{}: field '{key}' must be a CBOR {expected}",
            self.what
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
