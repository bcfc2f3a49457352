//! Node signing identity and peer-identity derivation.
//!
//! The node id of a peer is the libp2p `PeerId` of its Ed25519 public
//! key. The same keypair is converted deterministically into the
//! libp2p transport identity, so for an honest peer the id the
//! transport authenticates and the `sender_node_id` it writes into
//! its envelopes are the same value.

use std::fmt;

use libp2p::identity;
use libp2p::PeerId;

use dmlink_crypto::signing::{verify_signature, Keypair, PublicKey, Signature};
use dmlink_protocol::message::{Envelope, Metadata};
use dmlink_protocol::signing::verify_envelope_signature;
use dmlink_types::{DirectMessageError, Result};

// ---------------------------------------------------------------------------
// NodeIdentity
// ---------------------------------------------------------------------------

/// The local node's key material.
///
/// Immutable for its whole lifetime and shared read-only (behind an
/// `Arc`) between the client and server flows.
pub struct NodeIdentity {
    keypair: Option<Keypair>,
    public_key: PublicKey,
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Builds a signing-capable identity from a keypair.
    ///
    /// # Errors
    ///
    /// Returns [`DirectMessageError::MalformedKey`] if libp2p rejects
    /// the public key.
    pub fn from_keypair(keypair: Keypair) -> Result<Self> {
        let public_key = keypair.public_key();
        let peer_id = derive_identity(public_key.as_bytes())?;
        Ok(Self {
            keypair: Some(keypair),
            public_key,
            peer_id,
        })
    }

    /// Builds an identity that can verify but not sign.
    ///
    /// # Errors
    ///
    /// Returns [`DirectMessageError::MalformedKey`] if `public_key` is
    /// not a valid Ed25519 key.
    pub fn verify_only(public_key: &[u8]) -> Result<Self> {
        let public_key = PublicKey::try_from_slice(public_key)?;
        let peer_id = derive_identity(public_key.as_bytes())?;
        Ok(Self {
            keypair: None,
            public_key,
            peer_id,
        })
    }

    /// Generates a fresh random identity.
    pub fn generate() -> Result<Self> {
        Self::from_keypair(Keypair::generate())
    }

    /// Local peer id.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// String node id written into `metadata.sender_node_id`.
    pub fn node_id(&self) -> String {
        self.peer_id.to_base58()
    }

    /// Local public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Whether [`NodeIdentity::sign`] can succeed.
    pub fn can_sign(&self) -> bool {
        self.keypair.is_some()
    }

    /// Signs `bytes` with the local private key.
    ///
    /// # Errors
    ///
    /// Returns [`DirectMessageError::NoPrivateKey`] for a verify-only
    /// identity.
    pub fn sign(&self, bytes: &[u8]) -> Result<Signature> {
        self.keypair
            .as_ref()
            .map(|kp| kp.sign(bytes))
            .ok_or(DirectMessageError::NoPrivateKey)
    }

    /// Fresh unsigned metadata naming this node as sender.
    pub fn metadata(&self, client_version: &str) -> Metadata {
        Metadata::new(
            client_version,
            self.node_id(),
            self.public_key.as_bytes().to_vec(),
        )
    }

    /// Converts the keypair into a libp2p transport identity.
    ///
    /// `try_from_bytes` zeroes the intermediate 64-byte buffer on
    /// success.
    ///
    /// # Errors
    ///
    /// - [`DirectMessageError::NoPrivateKey`] for a verify-only identity.
    /// - [`DirectMessageError::NetworkError`] if libp2p rejects the bytes.
    pub fn to_libp2p_keypair(&self) -> Result<identity::Keypair> {
        let keypair = self
            .keypair
            .as_ref()
            .ok_or(DirectMessageError::NoPrivateKey)?;
        let mut raw = keypair.to_keypair_bytes();

        let ed25519_kp = identity::ed25519::Keypair::try_from_bytes(&mut raw).map_err(|e| {
            DirectMessageError::NetworkError {
                reason: format!("failed to convert keypair to libp2p ed25519 identity: {e}"),
            }
        })?;

        Ok(identity::Keypair::from(ed25519_kp))
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .field("can_sign", &self.can_sign())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Pure signature predicate over raw bytes.
///
/// # Errors
///
/// Fails only with [`DirectMessageError::MalformedKey`] when
/// `public_key` cannot be parsed.
pub fn verify(bytes: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool> {
    verify_signature(public_key, bytes, signature)
}

/// Derives the node id a public key is entitled to claim.
///
/// `PeerId = Multihash(protobuf(public_key))`, so the mapping is
/// deterministic.
///
/// # Errors
///
/// Returns [`DirectMessageError::MalformedKey`] if the bytes are not
/// a valid Ed25519 public key.
pub fn derive_identity(public_key: &[u8]) -> Result<PeerId> {
    let ed25519_pk = identity::ed25519::PublicKey::try_from_bytes(public_key).map_err(|e| {
        DirectMessageError::MalformedKey {
            reason: format!("not a libp2p ed25519 public key: {e}"),
        }
    })?;

    let libp2p_pk = identity::PublicKey::from(ed25519_pk);
    Ok(PeerId::from(libp2p_pk))
}

/// Full verification of a received envelope.
///
/// # Checks (in order)
///
/// 1. `sender_public_key` derives to `sender_node_id`.
/// 2. That derived id is the transport-authenticated `remote`.
/// 3. The signature verifies over the signature-cleared encoding.
///
/// A failed binding rejects the envelope even when its signature
/// would verify.
///
/// # Errors
///
/// Returns [`DirectMessageError::VerificationFailed`] naming the
/// first check that failed.
pub fn verify_envelope<E: Envelope>(envelope: &E, remote: &PeerId) -> Result<()> {
    let metadata = envelope.metadata();

    let derived = derive_identity(&metadata.sender_public_key).map_err(|e| {
        DirectMessageError::verification(format!("{} sender key unusable: {e}", E::KIND))
    })?;

    if derived.to_base58() != metadata.sender_node_id {
        return Err(DirectMessageError::verification(format!(
            "{} sender_node_id {} does not match sender_public_key (derives {derived})",
            E::KIND,
            metadata.sender_node_id,
        )));
    }

    if derived != *remote {
        return Err(DirectMessageError::verification(format!(
            "{} signed by {derived} but arrived from {remote}",
            E::KIND,
        )));
    }

    verify_envelope_signature(envelope)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
