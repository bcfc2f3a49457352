//! Envelope signing and signature verification.
//!
//! All signatures are computed over the canonical CBOR encoding of an
//! envelope with `metadata.signature` cleared to an empty byte string.
//! Verification rebuilds exactly those bytes and checks them against
//! the public key the envelope declares.
//!
//! Binding the declared key to a transport identity is not done here;
//! that needs the peer-id derivation of the network layer.

use dmlink_crypto::signing::{verify_signature, Signature};
use dmlink_types::{DirectMessageError, Result};

use crate::canonical::SignatureField;
use crate::message::Envelope;

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Returns the bytes that are signed for `envelope`.
///
/// Deterministic: the same envelope always yields the same bytes,
/// whatever is currently stored in `metadata.signature`.
pub fn signing_bytes<E: Envelope>(envelope: &E) -> Result<Vec<u8>> {
    envelope.encode_with(SignatureField::Cleared)
}

/// Signs `envelope` in place and returns its wire encoding.
///
/// # Process
///
/// 1. Encode canonically with the signature cleared.
/// 2. Sign those bytes with `sign`.
/// 3. Store the signature in `metadata.signature`.
/// 4. Re-encode with the signature to obtain the wire payload.
///
/// # Errors
///
/// Propagates any error from `sign` (e.g.
/// [`DirectMessageError::NoPrivateKey`]) and encoding errors.
pub fn seal<E, F>(envelope: &mut E, sign: F) -> Result<Vec<u8>>
where
    E: Envelope,
    F: FnOnce(&[u8]) -> Result<Signature>,
{
    let unsigned = signing_bytes(envelope)?;
    let signature = sign(&unsigned)?;
    envelope.metadata_mut().signature = signature.to_vec();
    envelope.encode()
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Checks the envelope signature against its declared public key.
///
/// # Errors
///
/// Returns [`DirectMessageError::VerificationFailed`] if the signature
/// does not verify or the declared key cannot be parsed.
pub fn verify_envelope_signature<E: Envelope>(envelope: &E) -> Result<()> {
    let bytes = signing_bytes(envelope)?;
    let metadata = envelope.metadata();

    match verify_signature(&metadata.sender_public_key, &bytes, &metadata.signature) {
        Ok(true) => Ok(()),
        Ok(false) => Err(DirectMessageError::verification(format!(
            "{} signature does not match sender_public_key",
            E::KIND
        ))),
        Err(DirectMessageError::MalformedKey { reason }) => Err(DirectMessageError::verification(
            format!("{} carries a malformed sender_public_key: {reason}", E::KIND),
        )),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
