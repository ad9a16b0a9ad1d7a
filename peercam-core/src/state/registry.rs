//! Peer registry: the one authoritative view of known peers, the latest
//! inbound message and the selected destination.
//!
//! Every mutation runs inside `watch::Sender::send_if_modified`, so the
//! channel's lock is the single serialization point: concurrent discovery
//! and session callbacks are applied one at a time, and readers only ever
//! see whole snapshots. Subscribers are woken after each effective change.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::PeerError;
use crate::identity::{NodeId, NodeIdentity};
use crate::state::peer::{PeerRecord, PeerState};

// ── InboundMessage ───────────────────────────────────────────────

/// Most recently received payload. Overwritten on every arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub bytes: Bytes,
    pub sender: NodeIdentity,
}

// ── RegistrySnapshot ─────────────────────────────────────────────

/// Immutable view handed to readers and subscribers.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    peers: Vec<PeerRecord>,
    inbound: Option<InboundMessage>,
    selected: Option<NodeId>,
}

impl RegistrySnapshot {
    /// Peers in discovery order.
    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn peer(&self, id: &NodeId) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.id() == *id)
    }

    pub fn inbound(&self) -> Option<&InboundMessage> {
        self.inbound.as_ref()
    }

    pub fn selected(&self) -> Option<NodeId> {
        self.selected
    }

    pub fn is_connected(&self, id: &NodeId) -> bool {
        self.peer(id).is_some_and(|p| p.state().is_connected())
    }

    pub fn connected(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter().filter(|p| p.state().is_connected())
    }

    fn peer_mut(&mut self, id: &NodeId) -> Option<&mut PeerRecord> {
        self.peers.iter_mut().find(|p| p.id() == *id)
    }

    fn remove(&mut self, id: &NodeId) -> Option<PeerRecord> {
        let index = self.peers.iter().position(|p| p.id() == *id)?;
        Some(self.peers.remove(index))
    }

    /// The selected destination must always be a connected peer.
    fn enforce_selection(&mut self) {
        if let Some(id) = self.selected {
            if !self.is_connected(&id) {
                debug!(peer = %id, "selected peer no longer connected; clearing selection");
                self.selected = None;
            }
        }
    }
}

// ── PeerRegistry ─────────────────────────────────────────────────

/// Cloneable handle to the shared registry.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    tx: Arc<watch::Sender<RegistrySnapshot>>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RegistrySnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Apply `f` atomically. `f` returns its result and whether it changed
    /// anything; subscribers are only notified on change.
    fn apply<R>(&self, f: impl FnOnce(&mut RegistrySnapshot) -> (R, bool)) -> R {
        let mut result = None;
        self.tx.send_if_modified(|state| {
            let (r, changed) = f(state);
            if changed {
                state.enforce_selection();
            }
            result = Some(r);
            changed
        });
        match result {
            Some(r) => r,
            None => unreachable!("send_if_modified always runs its closure"),
        }
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Consistent copy of the whole registry.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.tx.borrow().clone()
    }

    /// Change notifications. Each `changed()` wake-up reflects one or
    /// more whole mutations.
    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.tx.subscribe()
    }

    pub fn list_peers(&self) -> Vec<PeerRecord> {
        self.tx.borrow().peers.clone()
    }

    pub fn peer(&self, id: &NodeId) -> Option<PeerRecord> {
        self.tx.borrow().peer(id).cloned()
    }

    pub fn selected(&self) -> Option<NodeId> {
        self.tx.borrow().selected
    }

    pub fn inbound(&self) -> Option<InboundMessage> {
        self.tx.borrow().inbound.clone()
    }

    pub fn is_connected(&self, id: &NodeId) -> bool {
        self.tx.borrow().is_connected(id)
    }

    pub fn connected_count(&self) -> usize {
        self.tx.borrow().connected().count()
    }

    // ── Discovery events ─────────────────────────────────────────

    /// A browser observed an announcement. Returns `true` if the peer is new.
    ///
    /// Re-observing a known peer only refreshes its endpoint.
    pub fn peer_found(&self, identity: NodeIdentity, endpoint: SocketAddr) -> bool {
        self.apply(|state| match state.peer_mut(&identity.id()) {
            Some(existing) => (false, existing.set_endpoint(Some(endpoint))),
            None => {
                info!(peer = %identity, %endpoint, "peer found");
                state.peers.push(PeerRecord::discovered(identity, endpoint));
                (true, true)
            }
        })
    }

    /// Announcements for a peer stopped. Idle records are removed; peers
    /// with an active invitation or session stay until the session says
    /// otherwise, but lose their endpoint.
    pub fn peer_lost(&self, id: &NodeId) -> bool {
        self.apply(|state| {
            let Some(record) = state.peer_mut(id) else {
                return (false, false);
            };
            if record.state().is_engaged() {
                debug!(peer = %id, "peer lost while engaged; keeping session record");
                let changed = record.set_endpoint(None);
                return (false, changed);
            }
            info!(peer = %id, "peer lost");
            state.remove(id);
            (true, true)
        })
    }

    // ── Invitation events ────────────────────────────────────────

    /// Browser side of `contact()`. Moves the peer to `Connecting` and
    /// returns its endpoint, or `None` when an invitation or session is
    /// already active (no-op).
    pub fn begin_contact(&self, id: &NodeId) -> Result<Option<SocketAddr>, PeerError> {
        self.apply(|state| {
            let Some(record) = state.peer_mut(id) else {
                return (Err(PeerError::UnknownPeer(id.to_string())), false);
            };
            if record.state().is_engaged() {
                return (Ok(None), false);
            }
            let Some(endpoint) = record.endpoint() else {
                return (Err(PeerError::NoEndpoint(id.to_string())), false);
            };
            match record.state_mut().begin_connect() {
                Ok(()) => {
                    record.mark_contacted();
                    (Ok(Some(endpoint)), true)
                }
                Err(e) => (Err(e), false),
            }
        })
    }

    /// The invitation was rejected or timed out.
    pub fn contact_failed(&self, id: &NodeId) -> bool {
        self.apply(|state| {
            let Some(record) = state.peer_mut(id) else {
                return (false, false);
            };
            if record.state() != PeerState::Connecting {
                return (false, false);
            }
            if record.endpoint().is_some() {
                let _ = record.state_mut().abandon_connect();
            } else {
                state.remove(id);
            }
            (true, true)
        })
    }

    /// Advertiser side: an invitation from `identity` is being accepted.
    /// Returns `false` if a session with that peer is already active.
    pub fn invitation_received(&self, identity: NodeIdentity) -> bool {
        self.apply(|state| match state.peer_mut(&identity.id()) {
            Some(record) => match record.state_mut().begin_connect() {
                Ok(()) => (true, true),
                Err(_) => (false, false),
            },
            None => {
                state.peers.push(PeerRecord::inviting(identity));
                (true, true)
            }
        })
    }

    // ── Session events ───────────────────────────────────────────

    /// Session link established. Duplicate events are no-ops; a peer that
    /// never went through `Connecting` is refused.
    pub fn session_connected(&self, identity: &NodeIdentity) -> bool {
        self.apply(|state| {
            let Some(record) = state.peer_mut(&identity.id()) else {
                warn!(peer = %identity, "session connected for unknown peer; ignoring");
                return (false, false);
            };
            match record.state() {
                PeerState::Connected => (false, false),
                PeerState::Connecting => {
                    let _ = record.state_mut().complete_connect();
                    info!(peer = %identity, "peer connected");
                    (true, true)
                }
                other => {
                    warn!(peer = %identity, state = %other, "session connected without invitation; ignoring");
                    (false, false)
                }
            }
        })
    }

    /// Session link ended. Peers still announced become `Disconnected`;
    /// the rest are removed.
    pub fn session_disconnected(&self, id: &NodeId) -> bool {
        self.apply(|state| {
            let Some(record) = state.peer_mut(id) else {
                return (false, false);
            };
            if !record.state().is_engaged() {
                return (false, false);
            }
            info!(peer = %id, "peer disconnected");
            if record.endpoint().is_some() {
                let _ = record.state_mut().disconnect();
            } else {
                state.remove(id);
            }
            (true, true)
        })
    }

    /// Overwrite the single inbound slot.
    pub fn record_inbound(&self, sender: NodeIdentity, bytes: Bytes) {
        self.apply(|state| {
            debug!(peer = %sender, len = bytes.len(), "inbound message");
            state.inbound = Some(InboundMessage { bytes, sender });
            ((), true)
        })
    }

    /// Clear peers, inbound message, sender and selection in one step.
    pub fn reset(&self) {
        self.apply(|state| {
            warn!(peers = state.peers.len(), "resetting registry");
            *state = RegistrySnapshot::default();
            ((), true)
        })
    }

    // ── Selection ────────────────────────────────────────────────

    /// Select the capture destination. The peer must be connected.
    pub fn select(&self, id: &NodeId) -> Result<(), PeerError> {
        self.apply(|state| {
            let check = match state.peer(id) {
                None => Err(PeerError::UnknownPeer(id.to_string())),
                Some(p) if !p.state().is_connected() => {
                    Err(PeerError::PeerNotConnected(id.to_string()))
                }
                Some(_) => Ok(()),
            };
            if let Err(e) = check {
                return (Err(e), false);
            }
            let changed = state.selected != Some(*id);
            state.selected = Some(*id);
            (Ok(()), changed)
        })
    }

    pub fn clear_selection(&self) {
        self.apply(|state| {
            let changed = state.selected.take().is_some();
            ((), changed)
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
