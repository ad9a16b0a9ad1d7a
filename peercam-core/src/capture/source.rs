//! Capture collaborator interface.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::PeerError;

/// Result of one capture request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub bytes: Bytes,
    /// `false` when the device had nothing to give; the tick is skipped.
    pub ready: bool,
}

impl Capture {
    pub fn ready(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            ready: true,
        }
    }

    pub fn not_ready() -> Self {
        Self {
            bytes: Bytes::new(),
            ready: false,
        }
    }

    /// Whether the loop should send this capture.
    pub fn is_sendable(&self) -> bool {
        self.ready && !self.bytes.is_empty()
    }
}

/// Produces one payload per tick.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn request_capture(&self) -> Result<Capture, PeerError>;
}

/// Returns the same bytes on every request.
#[derive(Debug, Clone)]
pub struct StaticCapture {
    bytes: Bytes,
}

impl StaticCapture {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

#[async_trait]
impl CaptureSource for StaticCapture {
    async fn request_capture(&self) -> Result<Capture, PeerError> {
        Ok(Capture::ready(self.bytes.clone()))
    }
}
