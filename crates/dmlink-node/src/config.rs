//! Config file support.
//!
//! The node can be configured via CLI flags, a JSON config file,
//! or a combination of both (CLI overrides config file).

use std::path::{Path, PathBuf};

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

use dmlink_network::config::NetworkConfig;

/// JSON config file format.
///
/// Example `dmlink.json`:
/// ```json
/// {
///   "key_file": "/opt/dmlink/key.json",
///   "network": {
///     "listen_addr": "/ip4/0.0.0.0/tcp/9000",
///     "idle_timeout_secs": 60,
///     "identify_protocol": "/dmlink/id/1.0.0",
///     "direct_message": { "dial_timeout_ms": 5000 }
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfigFile {
    pub key_file: Option<PathBuf>,
    pub network: Option<NetworkConfig>,
}

/// Resolved node configuration.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub key_file: Option<PathBuf>,
    pub network: NetworkConfig,
}

impl NodeConfig {
    /// Loads a JSON config file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config '{}': {e}", path.display()))?;
        let file: NodeConfigFile =
            serde_json::from_str(&json).map_err(|e| format!("invalid config file: {e}"))?;
        Ok(Self {
            key_file: file.key_file,
            network: file.network.unwrap_or_default(),
        })
    }

    /// Applies CLI overrides.
    pub fn merge_cli(mut self, listen: Option<Multiaddr>, key_file: Option<PathBuf>) -> Self {
        if let Some(addr) = listen {
            self.network.listen_addr = addr;
        }
        if key_file.is_some() {
            self.key_file = key_file;
        }
        self
    }
}
