//! Ed25519 digital signature operations.
//!
//! Provides keypair generation, message signing and a verification
//! predicate over raw key and signature bytes. The private key is
//! zeroized on drop via `ed25519-dalek`'s built-in `ZeroizeOnDrop`.

use dmlink_types::{DirectMessageError, Result};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

// ---------------------------------------------------------------------------
// PublicKey
// ---------------------------------------------------------------------------

/// Ed25519 public key (32 bytes).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Fixed byte length of an Ed25519 public key.
    pub const LEN: usize = 32;

    /// Creates a [`PublicKey`] from raw bytes without validation.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses and validates a public key from an arbitrary slice.
    ///
    /// # Errors
    ///
    /// Returns [`DirectMessageError::MalformedKey`] if the slice is not
    /// 32 bytes long or is not a valid compressed Edwards point.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| DirectMessageError::MalformedKey {
            reason: format!("expected {} bytes, got {}", Self::LEN, bytes.len()),
        })?;
        VerifyingKey::from_bytes(&arr).map_err(|e| DirectMessageError::MalformedKey {
            reason: format!("invalid Ed25519 point: {e}"),
        })?;
        Ok(Self(arr))
    }

    /// Returns the underlying 32-byte array.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Ed25519 signature (64 bytes).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Fixed byte length of an Ed25519 signature.
    pub const LEN: usize = 64;

    /// Creates a [`Signature`] from raw bytes.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying 64-byte array.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Copies the signature into an owned byte vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

// ---------------------------------------------------------------------------
// Keypair
// ---------------------------------------------------------------------------

/// Ed25519 signing keypair.
///
/// Wraps an `ed25519-dalek` [`SigningKey`].
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generates a new random keypair using OS-level entropy.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Reconstructs a keypair deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Returns the public half of this keypair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Signs an arbitrary message and returns the Ed25519 signature.
    ///
    /// Deterministic: the same keypair and message always yield the
    /// same signature (RFC 8032).
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.signing_key.sign(message);
        Signature(sig.to_bytes())
    }

    /// Returns the full 64-byte keypair encoding (seed ‖ public key).
    ///
    /// This is the format accepted by
    /// `libp2p::identity::ed25519::Keypair::try_from_bytes`.
    ///
    /// # Security
    ///
    /// The returned bytes contain the private key. Callers **must**
    /// discard the copy as soon as it is no longer needed.
    pub fn to_keypair_bytes(&self) -> [u8; 64] {
        self.signing_key.to_keypair_bytes()
    }
}

// Keypair intentionally does not implement Clone or Debug to prevent
// accidental leakage of the private key in logs or copies.

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Checks an Ed25519 signature over `message` against raw key bytes.
///
/// This is a predicate: a signature that does not verify, or that is
/// not 64 bytes long, yields `Ok(false)`.
///
/// # Errors
///
/// Returns [`DirectMessageError::MalformedKey`] only when `public_key`
/// cannot be parsed as an Ed25519 key.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
    let key = PublicKey::try_from_slice(public_key)?;
    let vk = VerifyingKey::from_bytes(key.as_bytes()).map_err(|e| DirectMessageError::MalformedKey {
        reason: format!("invalid Ed25519 point: {e}"),
    })?;

    let sig_bytes: [u8; 64] = match signature.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return Ok(false),
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    Ok(vk.verify_strict(message, &sig).is_ok())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
