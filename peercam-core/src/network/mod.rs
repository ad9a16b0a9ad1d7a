//! Transport session: reliable, ordered byte messages to connected peers.

mod link;
pub mod session;

use async_trait::async_trait;
use bytes::Bytes;

use crate::identity::NodeId;

pub use session::Session;

/// What became of one `send` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Empty target set or nobody connected; nothing sent.
    Skipped,
    /// Queued on every target's link.
    Delivered,
    /// A target failed; the session and registry were reset.
    Reset,
}

/// Destination for captured payloads.
#[async_trait]
pub trait PayloadSink: Send + Sync {
    async fn deliver(&self, payload: Bytes, to: &[NodeId]) -> SendOutcome;
}
