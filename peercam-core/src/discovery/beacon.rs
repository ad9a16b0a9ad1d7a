//! UDP announcement datagrams.

use serde::{Deserialize, Serialize};

use crate::error::PeerError;
use crate::identity::{NodeId, NodeIdentity};

/// First bytes of every beacon.
pub const BEACON_MAGIC: [u8; 4] = *b"PCMB";

/// Bumped on incompatible beacon changes. Browsers ignore other versions.
pub const PROTOCOL_VERSION: u8 = 1;

/// Receive buffer size; larger datagrams are truncated and fail to decode.
pub const MAX_BEACON_SIZE: usize = 2048;

/// One advertiser announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    magic: [u8; 4],
    version: u8,
    pub service_type: String,
    pub identity: NodeIdentity,
    /// TCP port accepting invitations, on the beacon's source address.
    pub session_port: u16,
    /// Sent once on shutdown so browsers drop the peer without waiting.
    pub departing: bool,
}

impl Beacon {
    pub fn new(service_type: impl Into<String>, identity: NodeIdentity, session_port: u16) -> Self {
        Self {
            magic: BEACON_MAGIC,
            version: PROTOCOL_VERSION,
            service_type: service_type.into(),
            identity,
            session_port,
            departing: false,
        }
    }

    pub fn departing(mut self) -> Self {
        self.departing = true;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, PeerError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode and check magic and version.
    pub fn decode(datagram: &[u8]) -> Result<Self, PeerError> {
        if datagram.len() < BEACON_MAGIC.len() || datagram[..BEACON_MAGIC.len()] != BEACON_MAGIC {
            return Err(PeerError::InvalidMagic);
        }
        let beacon: Beacon = bincode::deserialize(datagram)?;
        if beacon.version != PROTOCOL_VERSION {
            return Err(PeerError::UnsupportedVersion(beacon.version));
        }
        Ok(beacon)
    }

    /// Whether a browser for `service_type` running as `local` should act
    /// on this beacon.
    pub fn is_relevant(&self, service_type: &str, local: &NodeId) -> bool {
        self.service_type == service_type && self.identity.id() != *local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_checks_magic() {
        let beacon = Beacon::new("x7z9", NodeIdentity::new("cam"), 4000);
        let mut bytes = beacon.encode().unwrap();
        assert_eq!(Beacon::decode(&bytes).unwrap(), beacon);

        bytes[0] = b'X';
        assert!(matches!(Beacon::decode(&bytes), Err(PeerError::InvalidMagic)));
        assert!(matches!(Beacon::decode(b"PC"), Err(PeerError::InvalidMagic)));
    }

    #[test]
    fn other_versions_are_refused() {
        let mut beacon = Beacon::new("x7z9", NodeIdentity::new("cam"), 4000);
        beacon.version = PROTOCOL_VERSION + 1;
        let bytes = beacon.encode().unwrap();
        assert!(matches!(
            Beacon::decode(&bytes),
            Err(PeerError::UnsupportedVersion(v)) if v == PROTOCOL_VERSION + 1
        ));
    }

    #[test]
    fn truncated_beacon_is_encoding_error() {
        let bytes = Beacon::new("x7z9", NodeIdentity::new("cam"), 4000)
            .encode()
            .unwrap();
        assert!(matches!(
            Beacon::decode(&bytes[..bytes.len() - 3]),
            Err(PeerError::Encoding(_))
        ));
    }

    #[test]
    fn relevance_filters_tag_and_self() {
        let me = NodeIdentity::new("me");
        let other = NodeIdentity::new("other");
        let beacon = Beacon::new("x7z9", other.clone(), 1);
        assert!(beacon.is_relevant("x7z9", &me.id()));
        assert!(!beacon.is_relevant("peercam", &me.id()));
        assert!(!beacon.is_relevant("x7z9", &other.id()));
    }

    #[test]
    fn departing_flag() {
        let beacon = Beacon::new("x7z9", NodeIdentity::new("cam"), 1).departing();
        let decoded = Beacon::decode(&beacon.encode().unwrap()).unwrap();
        assert!(decoded.departing);
    }
}
