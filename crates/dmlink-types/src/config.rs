//! Protocol configuration with documented defaults.
//!
//! The timeouts here are the hard bounds of the direct-message
//! exchange: the dial bound, the connection-upgrade poll interval and
//! the total upgrade wait.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DirectMessageError, Result};

/// Default dial bound (5 seconds).
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 5_000;

/// Default interval between connection status polls (100 ms).
pub const DEFAULT_UPGRADE_POLL_INTERVAL_MS: u64 = 100;

/// Default total wait for a transient connection to open (2 seconds).
pub const DEFAULT_UPGRADE_WAIT_MS: u64 = 2_000;

/// Default upper bound for a single length-prefixed frame (4 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Configuration shared by the client and server flows.
///
/// Missing fields take their default when deserialized.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectMessageConfig {
    /// Version string placed in `metadata.client_version`.
    pub client_version: String,

    /// Milliseconds before an outbound dial is abandoned.
    pub dial_timeout_ms: u64,

    /// Milliseconds between connection status checks while a
    /// connection is transient.
    pub upgrade_poll_interval_ms: u64,

    /// Total milliseconds to wait for a transient connection to open.
    pub upgrade_wait_ms: u64,

    /// Largest accepted frame, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for DirectMessageConfig {
    fn default() -> Self {
        Self {
            client_version: concat!("dmlink/", env!("CARGO_PKG_VERSION")).into(),
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
            upgrade_poll_interval_ms: DEFAULT_UPGRADE_POLL_INTERVAL_MS,
            upgrade_wait_ms: DEFAULT_UPGRADE_WAIT_MS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl DirectMessageConfig {
    /// Validates all configuration values.
    ///
    /// Returns an error if any value is outside its acceptable range.
    pub fn validate(&self) -> Result<()> {
        if self.client_version.trim().is_empty() {
            return Err(DirectMessageError::ConfigError {
                reason: "client_version must not be empty".into(),
            });
        }

        if self.dial_timeout_ms == 0 {
            return Err(DirectMessageError::ConfigError {
                reason: "dial_timeout_ms must be greater than 0".into(),
            });
        }

        if self.upgrade_poll_interval_ms == 0 {
            return Err(DirectMessageError::ConfigError {
                reason: "upgrade_poll_interval_ms must be greater than 0".into(),
            });
        }

        if self.upgrade_wait_ms == 0 {
            return Err(DirectMessageError::ConfigError {
                reason: "upgrade_wait_ms must be greater than 0".into(),
            });
        }

        if self.upgrade_poll_interval_ms > self.upgrade_wait_ms {
            return Err(DirectMessageError::ConfigError {
                reason: "upgrade_poll_interval_ms must not exceed upgrade_wait_ms".into(),
            });
        }

        if self.max_frame_bytes == 0 {
            return Err(DirectMessageError::ConfigError {
                reason: "max_frame_bytes must be greater than 0".into(),
            });
        }

        Ok(())
    }

    /// Dial bound as a [`Duration`].
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Upgrade poll interval as a [`Duration`].
    pub fn upgrade_poll_interval(&self) -> Duration {
        Duration::from_millis(self.upgrade_poll_interval_ms)
    }

    /// Total upgrade wait as a [`Duration`].
    pub fn upgrade_wait(&self) -> Duration {
        Duration::from_millis(self.upgrade_wait_ms)
    }
}
