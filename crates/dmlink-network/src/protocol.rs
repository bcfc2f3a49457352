//! Protocol identifier negotiated for direct-message streams.
//!
//! # Protocol ID
//!
//! `/dmlink/dm/1.0.0`

use libp2p::StreamProtocol;

/// Protocol identifier for dmlink direct messaging.
pub const DM_PROTOCOL: StreamProtocol = StreamProtocol::new("/dmlink/dm/1.0.0");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_id_is_versioned_path() {
        let proto = DM_PROTOCOL;
        let id = proto.as_ref();
        assert!(id.starts_with("/dmlink/"));
        assert!(id.ends_with("/1.0.0"));
    }
}
