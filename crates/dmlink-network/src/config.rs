//! Network configuration for the dmlink libp2p node.
//!
//! All values have documented defaults. This config lives in
//! `dmlink-network` rather than `dmlink-types` to keep
//! `libp2p::Multiaddr` out of the shared types crate.

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

use dmlink_types::config::DirectMessageConfig;
use dmlink_types::{DirectMessageError, Result};

/// Default Identify protocol version string.
pub const DEFAULT_IDENTIFY_PROTOCOL: &str = "/dmlink/id/1.0.0";

/// Node-level configuration. Missing fields take their default.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Multiaddr on which this node listens for incoming connections.
    ///
    /// Default: `/ip4/0.0.0.0/tcp/0` (OS-assigned port on all interfaces).
    #[serde(with = "multiaddr_serde")]
    pub listen_addr: Multiaddr,

    /// Seconds before an idle connection is closed by the swarm.
    pub idle_timeout_secs: u64,

    /// Protocol version announced over Identify.
    pub identify_protocol: String,

    /// Timeouts and limits of the direct-message exchange.
    pub direct_message: DirectMessageConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let mut listen_addr = Multiaddr::empty();
        listen_addr.push(Protocol::Ip4(std::net::Ipv4Addr::UNSPECIFIED));
        listen_addr.push(Protocol::Tcp(0));

        Self {
            listen_addr,
            idle_timeout_secs: 60,
            identify_protocol: DEFAULT_IDENTIFY_PROTOCOL.into(),
            direct_message: DirectMessageConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Validates all configuration values.
    ///
    /// Returns `Err(DirectMessageError::ConfigError)` if any value is
    /// outside its acceptable range.
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_secs == 0 {
            return Err(DirectMessageError::ConfigError {
                reason: "idle_timeout_secs must be greater than 0".into(),
            });
        }
        if !self.identify_protocol.starts_with('/') {
            return Err(DirectMessageError::ConfigError {
                reason: "identify_protocol must start with '/'".into(),
            });
        }
        self.direct_message.validate()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers: Multiaddr is written as its string form
// ---------------------------------------------------------------------------

mod multiaddr_serde {
    use libp2p::Multiaddr;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(addr: &Multiaddr, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Multiaddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
