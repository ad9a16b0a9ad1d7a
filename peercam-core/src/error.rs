//! Domain-specific error types for peercam.
//!
//! All fallible operations return `Result<T, PeerError>`.
//! No panics on invalid input: every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

use crate::discovery::Role;

/// The canonical error type for peercam.
#[derive(Debug, Error)]
pub enum PeerError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// Received bytes that do not start with the frame magic.
    #[error("invalid magic bytes: expected PCM1")]
    InvalidMagic,

    /// A field in the frame header could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// The frame payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The protocol version offered by the peer is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// A frame violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/UDP layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a frame body failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The invitation context could not be decoded as a connection request.
    #[error("malformed connection request: {0}")]
    MalformedRequest(#[from] serde_json::Error),

    // ── Discovery Errors ─────────────────────────────────────────
    /// The discovery service could not start. Not retried.
    #[error("{role} discovery failed to start: {source}")]
    DiscoveryStart {
        role: Role,
        #[source]
        source: std::io::Error,
    },

    /// The operation is only meaningful in the other discovery role.
    #[error("operation requires the {expected} role")]
    WrongRole { expected: Role },

    /// Service-type tags are 1 to 15 lowercase ASCII alphanumerics.
    #[error("invalid service type {0:?}: use 1-15 lowercase letters or digits")]
    InvalidServiceType(String),

    // ── Registry Errors ──────────────────────────────────────────
    /// No peer with this identity is known.
    #[error("unknown peer {0}")]
    UnknownPeer(String),

    /// The peer is known but not connected.
    #[error("peer {0} is not connected")]
    PeerNotConnected(String),

    /// The peer was discovered without a reachable session endpoint.
    #[error("peer {0} has no session endpoint")]
    NoEndpoint(String),

    // ── Capture Loop Errors ──────────────────────────────────────
    /// `start()` was issued with no destination selected.
    #[error("no destination peer selected")]
    NoDestination,

    /// Requested capture interval is outside the configured bounds.
    #[error("interval {secs}s outside {min}..={max}s")]
    IntervalOutOfRange { secs: u64, min: u64, max: u64 },

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for PeerError {
    fn from(s: String) -> Self {
        PeerError::Other(s)
    }
}

impl From<&str> for PeerError {
    fn from(s: &str) -> Self {
        PeerError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PeerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        PeerError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for PeerError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        PeerError::Encoding(e.to_string())
    }
}
