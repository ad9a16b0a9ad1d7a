//! Connection request carried in an invitation.
//!
//! Encoded as JSON so that new fields can be added later: unknown fields
//! are ignored on decode and missing fields take their defaults.

use serde::{Deserialize, Serialize};

use crate::error::PeerError;

/// Describes the browser's requirements to an advertiser at setup time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionRequest {
    /// Free-text placeholder. Intended to carry version information later.
    pub placeholder: String,
}

impl ConnectionRequest {
    pub fn new(placeholder: impl Into<String>) -> Self {
        Self {
            placeholder: placeholder.into(),
        }
    }

    /// Serialize to the invitation context bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PeerError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an invitation context. Failure is [`PeerError::MalformedRequest`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PeerError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
