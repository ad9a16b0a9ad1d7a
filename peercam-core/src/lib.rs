//! # peercam-core
//!
//! Peer discovery, session transport and the periodic capture-and-send
//! loop for peercam nodes.
//!
//! This crate contains:
//! - **Identity**: `NodeIdentity`, a random id plus a label
//! - **Wire**: `FrameHeader`, `Frame` and `FrameCodec` for framed TCP I/O via `tokio_util`
//! - **Discovery**: `DiscoveryService` in the advertiser or browser role, UDP beacons and TCP invitations
//! - **Network**: `Session`, the per-node set of peer links with fan-out `send`
//! - **State**: `PeerRegistry`, the single serialized view of peers, inbound message and selection
//! - **Capture**: `CaptureService`, the timer-driven capture-send actor
//! - **Error**: `PeerError`, a typed `thiserror` hierarchy

pub mod capture;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod header;
pub mod identity;
pub mod network;
pub mod node;
pub mod request;
pub mod state;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{Capture, CaptureHandle, CaptureService, CaptureSource, LoopPhase, LoopStatus, StaticCapture};
pub use codec::FrameCodec;
pub use config::{CaptureConfig, DiscoveryConfig, NodeConfig, SessionConfig};
pub use discovery::{AcceptAll, DiscoveryService, DiscoveryStatus, InvitationPolicy, Role};
pub use error::PeerError;
pub use frame::{Frame, FrameKind, MAX_PAYLOAD_SIZE};
pub use header::{FrameHeader, HEADER_SIZE};
pub use identity::{NodeId, NodeIdentity};
pub use network::{PayloadSink, SendOutcome, Session};
pub use node::Node;
pub use request::ConnectionRequest;
pub use state::{InboundMessage, PeerRecord, PeerRegistry, PeerState, RegistrySnapshot};
