//! Direct-message envelope protocol for dmlink.
//!
//! Defines the request/response schema, its deterministic CBOR
//! encoding (RFC 8949 §4.2), the signing canonicalization rule and
//! the length-prefixed framing used on streams.
//!
//! # Modules
//!
//! - [`message`]: `Metadata`, `DirectMessageRequest`, `DirectMessageResponse`
//! - [`canonical`]: Deterministic CBOR encoding/decoding
//! - [`signing`]: Signing-bytes canonicalization, sealing and signature checks
//! - [`framing`]: Varint length-prefixed frames over async byte streams

pub mod canonical;
pub mod framing;
pub mod message;
pub mod signing;
