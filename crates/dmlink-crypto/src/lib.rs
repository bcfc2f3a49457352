//! Cryptographic primitives for dmlink.
//!
//! This crate is the only place in the workspace that touches raw
//! Ed25519 operations. Higher layers sign and verify through
//! [`signing`].

pub mod signing;
