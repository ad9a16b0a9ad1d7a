//! Fixed-size frame header.
//!
//! ```text
//! magic:     [u8; 4]  "PCM1"
//! kind:      u8
//! reserved:  [u8; 3]  zero
//! checksum:  u32 LE   first 4 bytes of blake3(payload), 0 if empty
//! length:    u32 LE   payload length
//! ```

use crate::error::PeerError;
use crate::frame::FrameKind;

/// Magic prefix of every session frame.
pub const MAGIC: [u8; 4] = *b"PCM1";

/// Encoded header size on the wire.
pub const HEADER_SIZE: usize = 16;

pub type FrameHeaderBytes = [u8; HEADER_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    kind: FrameKind,
    checksum: u32,
    payload_length: u32,
}

impl FrameHeader {
    /// Build a header for `payload`, computing its checksum.
    pub fn for_payload(kind: FrameKind, payload: &[u8]) -> Self {
        Self {
            kind,
            checksum: checksum(payload),
            payload_length: payload.len() as u32,
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn payload_length(&self) -> usize {
        self.payload_length as usize
    }

    pub fn to_bytes(&self) -> FrameHeaderBytes {
        let mut buf: FrameHeaderBytes = [0; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.kind as u8;
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_length.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &FrameHeaderBytes) -> Result<Self, PeerError> {
        if bytes[0..4] != MAGIC {
            return Err(PeerError::InvalidMagic);
        }
        if bytes[5..8] != [0, 0, 0] {
            return Err(PeerError::InvalidHeader("reserved bytes must be zero"));
        }
        let kind = FrameKind::try_from(bytes[4])?;
        let checksum = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let payload_length = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        if payload_length == 0 && checksum != 0 {
            return Err(PeerError::InvalidHeader("empty payload with non-zero checksum"));
        }
        Ok(Self {
            kind,
            checksum,
            payload_length,
        })
    }

    /// Whether `payload` matches the checksum carried by this header.
    pub fn verify(&self, payload: &[u8]) -> bool {
        checksum(payload) == self.checksum
    }
}

/// Truncated blake3 of the payload. Empty payloads carry zero.
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let hash = blake3::hash(payload);
    let b = hash.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = FrameHeader::for_payload(FrameKind::Data, b"abc");
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"PCM1");
        assert_eq!(bytes[4], FrameKind::Data as u8);
        assert_eq!(&bytes[12..16], &3u32.to_le_bytes());
        assert_eq!(FrameHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = FrameHeader::for_payload(FrameKind::Heartbeat, &[]).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(PeerError::InvalidMagic)
        ));
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut bytes = FrameHeader::for_payload(FrameKind::Heartbeat, &[]).to_bytes();
        bytes[4] = 0xEE;
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(PeerError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn empty_payload_has_zero_checksum() {
        let header = FrameHeader::for_payload(FrameKind::Goodbye, &[]);
        assert_eq!(header.checksum(), 0);
        assert!(header.verify(&[]));
    }

    #[test]
    fn verify_detects_tampering() {
        let header = FrameHeader::for_payload(FrameKind::Data, b"hello");
        assert!(header.verify(b"hello"));
        assert!(!header.verify(b"hellp"));
    }
}
