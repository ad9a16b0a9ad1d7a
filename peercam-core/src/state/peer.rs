//! Per-peer state machine.
//!
//! Provides a `PeerState` enum that models the lifecycle of one remote
//! node as seen by the registry, with validated transitions that return
//! `Result` instead of panicking.

use std::net::SocketAddr;

use crate::error::PeerError;
use crate::identity::{NodeId, NodeIdentity};

// ── PeerState ────────────────────────────────────────────────────

/// Connection state of a known peer.
///
/// ```text
///  Discovered ──► Connecting ──► Connected
///      ▲  ▲           │              │
///      │  └─ (reject/timeout)        ▼
///      └──────────────────────── Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeerState {
    /// Seen by discovery, no session.
    #[default]
    Discovered,

    /// Invitation in flight.
    Connecting,

    /// Session link established.
    Connected,

    /// Session ended while discovery still knows the peer.
    Disconnected,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovered => write!(f, "discovered"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl PeerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether an invitation or session is currently active.
    pub fn is_engaged(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Connecting`.
    ///
    /// Valid from: `Discovered`, `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), PeerError> {
        match self {
            Self::Discovered | Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(PeerError::ProtocolViolation(
                "cannot connect: invitation or session already active",
            )),
        }
    }

    /// Transition to `Connected`.
    ///
    /// Valid from: `Connecting`.
    pub fn complete_connect(&mut self) -> Result<(), PeerError> {
        match self {
            Self::Connecting => {
                *self = Self::Connected;
                Ok(())
            }
            _ => Err(PeerError::ProtocolViolation(
                "cannot complete connect: not in Connecting state",
            )),
        }
    }

    /// Back to `Discovered` after a rejected or timed-out invitation.
    ///
    /// Valid from: `Connecting`.
    pub fn abandon_connect(&mut self) -> Result<(), PeerError> {
        match self {
            Self::Connecting => {
                *self = Self::Discovered;
                Ok(())
            }
            _ => Err(PeerError::ProtocolViolation(
                "cannot abandon connect: not in Connecting state",
            )),
        }
    }

    /// Transition to `Disconnected`.
    ///
    /// Valid from: `Connecting`, `Connected`.
    pub fn disconnect(&mut self) -> Result<(), PeerError> {
        match self {
            Self::Connecting | Self::Connected => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(PeerError::ProtocolViolation(
                "cannot disconnect: no invitation or session active",
            )),
        }
    }
}

// ── PeerRecord ───────────────────────────────────────────────────

/// One remote node known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    identity: NodeIdentity,
    state: PeerState,
    /// Set once the local browser has issued `contact()` for this peer.
    contacted: bool,
    /// Session address learned from discovery. `None` for peers that
    /// contacted us or whose announcements have stopped.
    endpoint: Option<SocketAddr>,
}

impl PeerRecord {
    pub(crate) fn discovered(identity: NodeIdentity, endpoint: SocketAddr) -> Self {
        Self {
            identity,
            state: PeerState::Discovered,
            contacted: false,
            endpoint: Some(endpoint),
        }
    }

    /// Record for a peer that reached us through an inbound invitation.
    pub(crate) fn inviting(identity: NodeIdentity) -> Self {
        Self {
            identity,
            state: PeerState::Connecting,
            contacted: false,
            endpoint: None,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn id(&self) -> NodeId {
        self.identity.id()
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn contacted(&self) -> bool {
        self.contacted
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    pub(crate) fn state_mut(&mut self) -> &mut PeerState {
        &mut self.state
    }

    pub(crate) fn mark_contacted(&mut self) {
        self.contacted = true;
    }

    pub(crate) fn set_endpoint(&mut self, endpoint: Option<SocketAddr>) -> bool {
        let changed = self.endpoint != endpoint;
        self.endpoint = endpoint;
        changed
    }
}

// ── Tests ────────────────────────────────────────────────────────
