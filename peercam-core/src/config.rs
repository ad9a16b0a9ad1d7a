//! Runtime configuration for a node.
//!
//! These are plain structs with defaults; the `peercam-node` binary maps
//! its TOML file onto them.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::error::PeerError;

/// Default multicast group and port for announcements.
pub const DEFAULT_ANNOUNCE_ADDR: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 70, 70), 47470);

/// Default service-type tag.
pub const DEFAULT_SERVICE_TYPE: &str = "peercam";

/// Longest accepted service-type tag.
pub const MAX_SERVICE_TYPE_LEN: usize = 15;

// ── DiscoveryConfig ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Tag shared by advertisers and browsers of one application.
    pub service_type: String,
    /// Where advertisers send beacons (multicast group or unicast address).
    pub announce_addr: SocketAddr,
    /// Where browsers listen for beacons.
    pub browse_bind: SocketAddr,
    /// Where advertisers accept invitations.
    pub session_bind: SocketAddr,
    /// Time between two beacons from one advertiser.
    pub beacon_interval: Duration,
    /// A browser forgets a peer it has not heard from for this long.
    pub peer_timeout: Duration,
    /// Upper bound on one invitation round-trip.
    pub invite_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.into(),
            announce_addr: SocketAddr::V4(DEFAULT_ANNOUNCE_ADDR),
            browse_bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_ANNOUNCE_ADDR.port())),
            session_bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            beacon_interval: Duration::from_secs(1),
            peer_timeout: Duration::from_secs(5),
            invite_timeout: Duration::from_secs(30),
        }
    }
}

// ── SessionConfig ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Keep-alive period on every link.
    pub heartbeat_interval: Duration,
    /// Frames queued per link before `send` waits.
    pub link_queue: usize,
    /// A send that cannot be queued within this time counts as failed.
    pub send_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            link_queue: 32,
            send_timeout: Duration::from_secs(10),
        }
    }
}

// ── CaptureConfig ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Initial interval between ticks, in seconds.
    pub interval_secs: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    /// How long one tick waits for the capture source before giving up.
    pub capture_grace: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_secs: 2,
            min_interval_secs: 1,
            max_interval_secs: 60,
            capture_grace: Duration::from_secs(2),
        }
    }
}

impl CaptureConfig {
    pub fn check_interval(&self, secs: u64) -> Result<Duration, PeerError> {
        if secs < self.min_interval_secs || secs > self.max_interval_secs {
            return Err(PeerError::IntervalOutOfRange {
                secs,
                min: self.min_interval_secs,
                max: self.max_interval_secs,
            });
        }
        Ok(Duration::from_secs(secs))
    }
}

// ── NodeConfig ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub capture: CaptureConfig,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), PeerError> {
        validate_service_type(&self.discovery.service_type)?;
        if self.capture.min_interval_secs == 0
            || self.capture.min_interval_secs > self.capture.max_interval_secs
        {
            return Err(PeerError::Other(format!(
                "invalid interval bounds {}..={}",
                self.capture.min_interval_secs, self.capture.max_interval_secs
            )));
        }
        self.capture.check_interval(self.capture.interval_secs)?;
        if self.session.link_queue == 0 {
            return Err(PeerError::Other("link_queue must be at least 1".into()));
        }
        Ok(())
    }
}

/// Service-type tags are 1 to 15 lowercase ASCII letters or digits.
pub fn validate_service_type(tag: &str) -> Result<(), PeerError> {
    let valid = !tag.is_empty()
        && tag.len() <= MAX_SERVICE_TYPE_LEN
        && tag
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(PeerError::InvalidServiceType(tag.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        NodeConfig::default().validate().unwrap();
        assert_eq!(DiscoveryConfig::default().invite_timeout, Duration::from_secs(30));
    }

    #[test]
    fn service_type_rules() {
        for ok in ["x7z9", "peercam", "a", "abcdefghijklmno"] {
            validate_service_type(ok).unwrap();
        }
        for bad in ["", "Peercam", "peer-cam", "peer cam", "abcdefghijklmnop", "ünï"] {
            assert!(validate_service_type(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn interval_bounds() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.check_interval(1).unwrap(), Duration::from_secs(1));
        assert_eq!(cfg.check_interval(60).unwrap(), Duration::from_secs(60));
        assert!(cfg.check_interval(0).is_err());
        assert!(cfg.check_interval(61).is_err());
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let mut cfg = NodeConfig::default();
        cfg.capture.min_interval_secs = 10;
        cfg.capture.max_interval_secs = 5;
        assert!(cfg.validate().is_err());
    }
}
