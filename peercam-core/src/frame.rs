//! Session frame types.
//!
//! Uses proper enums with `TryFrom`: no panics on unknown values.
//!
//! ```text
//! Browser ──[Invite {from, context}]──► Advertiser
//! Browser ◄──[Accept {from}]─────────── Advertiser   (or Reject {reason})
//!    ◄──────────[Data]──────────►                    (either direction)
//!    ◄──────────[Heartbeat]─────►                    (keep-alive)
//!    ◄──────────[Goodbye]───────►                    (graceful close)
//! ```

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::PeerError;
use crate::identity::NodeIdentity;

/// Maximum payload carried by one frame (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

// ── FrameKind ────────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Connection offer with an encoded `ConnectionRequest`.
    Invite = 0x01,
    /// Offer accepted; the stream is now a session link.
    Accept = 0x02,
    /// Offer refused.
    Reject = 0x03,
    /// Opaque application payload.
    Data = 0x10,
    /// Keep-alive.
    Heartbeat = 0x20,
    /// Graceful close.
    Goodbye = 0x21,
}

impl TryFrom<u8> for FrameKind {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Invite),
            0x02 => Ok(FrameKind::Accept),
            0x03 => Ok(FrameKind::Reject),
            0x10 => Ok(FrameKind::Data),
            0x20 => Ok(FrameKind::Heartbeat),
            0x21 => Ok(FrameKind::Goodbye),
            _ => Err(PeerError::UnknownVariant {
                type_name: "FrameKind",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::Invite => "Invite",
            FrameKind::Accept => "Accept",
            FrameKind::Reject => "Reject",
            FrameKind::Data => "Data",
            FrameKind::Heartbeat => "Heartbeat",
            FrameKind::Goodbye => "Goodbye",
        };
        f.write_str(name)
    }
}

// ── Frame ────────────────────────────────────────────────────────

/// One decoded session frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Invite {
        from: NodeIdentity,
        /// JSON-encoded `ConnectionRequest`, decoded by the advertiser.
        context: Vec<u8>,
    },
    Accept {
        from: NodeIdentity,
    },
    Reject {
        reason: String,
    },
    Data(Bytes),
    Heartbeat,
    Goodbye,
}

#[derive(Serialize, Deserialize)]
struct InviteBody {
    from: NodeIdentity,
    context: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct AcceptBody {
    from: NodeIdentity,
}

#[derive(Serialize, Deserialize)]
struct RejectBody {
    reason: String,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Invite { .. } => FrameKind::Invite,
            Frame::Accept { .. } => FrameKind::Accept,
            Frame::Reject { .. } => FrameKind::Reject,
            Frame::Data(_) => FrameKind::Data,
            Frame::Heartbeat => FrameKind::Heartbeat,
            Frame::Goodbye => FrameKind::Goodbye,
        }
    }

    /// Encode the frame body. Data payloads are carried verbatim.
    pub fn encode_payload(&self) -> Result<Bytes, PeerError> {
        let payload = match self {
            Frame::Invite { from, context } => Bytes::from(bincode::serialize(&InviteBody {
                from: from.clone(),
                context: context.clone(),
            })?),
            Frame::Accept { from } => {
                Bytes::from(bincode::serialize(&AcceptBody { from: from.clone() })?)
            }
            Frame::Reject { reason } => Bytes::from(bincode::serialize(&RejectBody {
                reason: reason.clone(),
            })?),
            Frame::Data(bytes) => bytes.clone(),
            Frame::Heartbeat | Frame::Goodbye => Bytes::new(),
        };
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PeerError::FrameTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(payload)
    }

    /// Rebuild a frame from its kind and body.
    pub fn decode(kind: FrameKind, payload: Bytes) -> Result<Self, PeerError> {
        match kind {
            FrameKind::Invite => {
                let body: InviteBody = bincode::deserialize(&payload)?;
                Ok(Frame::Invite {
                    from: body.from,
                    context: body.context,
                })
            }
            FrameKind::Accept => {
                let body: AcceptBody = bincode::deserialize(&payload)?;
                Ok(Frame::Accept { from: body.from })
            }
            FrameKind::Reject => {
                let body: RejectBody = bincode::deserialize(&payload)?;
                Ok(Frame::Reject {
                    reason: body.reason,
                })
            }
            FrameKind::Data => Ok(Frame::Data(payload)),
            FrameKind::Heartbeat | FrameKind::Goodbye if !payload.is_empty() => Err(
                PeerError::ProtocolViolation("control frame carries a payload"),
            ),
            FrameKind::Heartbeat => Ok(Frame::Heartbeat),
            FrameKind::Goodbye => Ok(Frame::Goodbye),
        }
    }
}
