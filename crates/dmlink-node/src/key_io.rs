//! Key file persistence.
//!
//! # File format (v1)
//!
//! ```json
//! {
//!   "version": 1,
//!   "public_key": "<hex 32 bytes>",
//!   "secret_key": "<hex 32 bytes, optional>"
//! }
//! ```
//!
//! A file without `secret_key` loads as a verify-only identity.

use std::path::Path;

use dmlink_crypto::signing::Keypair;
use dmlink_network::identity::NodeIdentity;
use serde::{Deserialize, Serialize};

const CURRENT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct KeyFileData {
    version: u32,
    public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secret_key: Option<String>,
}

/// Writes `keypair` to `path`, replacing any existing file atomically.
pub fn save_key(path: &Path, keypair: &Keypair) -> Result<(), String> {
    let bytes = keypair.to_keypair_bytes();
    let data = KeyFileData {
        version: CURRENT_VERSION,
        public_key: hex::encode(keypair.public_key().as_bytes()),
        secret_key: Some(hex::encode(&bytes[..32])),
    };

    let json = serde_json::to_string_pretty(&data)
        .map_err(|e| format!("JSON serialization failed: {e}"))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json.as_bytes())
        .map_err(|e| format!("failed to write key file: {e}"))?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        format!("failed to rename key file: {e}")
    })?;

    tracing::info!(path = %path.display(), "key saved");
    Ok(())
}

/// Loads the identity stored at `path`.
pub fn load_key(path: &Path) -> Result<NodeIdentity, String> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read key file '{}': {e}", path.display()))?;
    let data: KeyFileData =
        serde_json::from_str(&json).map_err(|e| format!("invalid key file: {e}"))?;

    if data.version != CURRENT_VERSION {
        return Err(format!("unsupported key file version {}", data.version));
    }

    let public_key =
        hex::decode(&data.public_key).map_err(|e| format!("invalid public_key hex: {e}"))?;

    let Some(secret_hex) = data.secret_key else {
        return NodeIdentity::verify_only(&public_key).map_err(|e| e.to_string());
    };

    let secret = hex::decode(&secret_hex).map_err(|e| format!("invalid secret_key hex: {e}"))?;
    let seed: [u8; 32] = secret
        .as_slice()
        .try_into()
        .map_err(|_| format!("secret_key must be 32 bytes, got {}", secret.len()))?;

    let keypair = Keypair::from_seed(&seed);
    if keypair.public_key().as_bytes().as_slice() != public_key.as_slice() {
        return Err("public_key does not match secret_key".into());
    }
    NodeIdentity::from_keypair(keypair).map_err(|e| e.to_string())
}
