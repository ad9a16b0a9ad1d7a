//! Configuration for the node runner.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use peercam_core::config::{DEFAULT_ANNOUNCE_ADDR, DEFAULT_SERVICE_TYPE};
use peercam_core::{CaptureConfig, DiscoveryConfig, NodeConfig, PeerError, SessionConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFileConfig {
    /// Sockets and link settings.
    pub network: NetworkConfig,
    /// Announcement settings.
    pub discovery: DiscoverySection,
    /// Capture loop settings.
    pub capture: CaptureSection,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface address to bind (browse socket and session listener).
    pub bind_ip: String,
    /// Beacon destination: a multicast group or a unicast `ip:port`.
    pub announce_addr: String,
    /// TCP port for invitations (0 = any free port).
    pub session_port: u16,
    /// Keep-alive period on session links, in seconds.
    pub heartbeat_secs: u64,
    /// Frames queued per link.
    pub link_queue: usize,
    /// Per-peer send deadline, in seconds.
    pub send_timeout_secs: u64,
}

/// Discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// 1-15 lowercase letters or digits, shared by both roles.
    pub service_type: String,
    pub beacon_interval_ms: u64,
    pub peer_timeout_ms: u64,
    pub invite_timeout_secs: u64,
    /// Pause before inviting again after a failed invitation.
    pub retry_delay_ms: u64,
}

/// Capture loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    pub interval_secs: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    /// How long one tick waits for the image, in milliseconds.
    pub grace_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".into(),
            announce_addr: DEFAULT_ANNOUNCE_ADDR.to_string(),
            session_port: 0,
            heartbeat_secs: 5,
            link_queue: 32,
            send_timeout_secs: 10,
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.into(),
            beacon_interval_ms: 1000,
            peer_timeout_ms: 5000,
            invite_timeout_secs: 30,
            retry_delay_ms: 2000,
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            interval_secs: 2,
            min_interval_secs: 1,
            max_interval_secs: 60,
            grace_ms: 2000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl NodeFileConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Pause between invitations to a peer that keeps refusing.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.discovery.retry_delay_ms.max(100))
    }

    /// Convert to the library's runtime configuration.
    ///
    /// Durations are clamped to sane minimums and the initial interval is
    /// clamped into its bounds; addresses and the service tag are checked.
    pub fn to_node_config(&self) -> Result<NodeConfig, PeerError> {
        let bind_ip: IpAddr = self
            .network
            .bind_ip
            .parse()
            .map_err(|e| PeerError::Other(format!("bind_ip {:?}: {e}", self.network.bind_ip)))?;
        let announce_addr: SocketAddr = self.network.announce_addr.parse().map_err(|e| {
            PeerError::Other(format!("announce_addr {:?}: {e}", self.network.announce_addr))
        })?;

        let min = self.capture.min_interval_secs.max(1);
        let max = self.capture.max_interval_secs.max(min);
        let config = NodeConfig {
            discovery: DiscoveryConfig {
                service_type: self.discovery.service_type.clone(),
                announce_addr,
                browse_bind: SocketAddr::new(bind_ip, announce_addr.port()),
                session_bind: SocketAddr::new(bind_ip, self.network.session_port),
                beacon_interval: Duration::from_millis(self.discovery.beacon_interval_ms.max(10)),
                peer_timeout: Duration::from_millis(self.discovery.peer_timeout_ms.max(100)),
                invite_timeout: Duration::from_secs(self.discovery.invite_timeout_secs.max(1)),
            },
            session: SessionConfig {
                heartbeat_interval: Duration::from_secs(self.network.heartbeat_secs.max(1)),
                link_queue: self.network.link_queue.max(1),
                send_timeout: Duration::from_secs(self.network.send_timeout_secs.max(1)),
            },
            capture: CaptureConfig {
                interval_secs: self.capture.interval_secs.clamp(min, max),
                min_interval_secs: min,
                max_interval_secs: max,
                capture_grace: Duration::from_millis(self.capture.grace_ms.max(1)),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

// ── Tests ────────────────────────────────────────────────────────
