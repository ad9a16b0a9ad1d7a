//! `tokio_util` codec for session frames.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::PeerError;
use crate::frame::{Frame, MAX_PAYLOAD_SIZE};
use crate::header::{FrameHeader, FrameHeaderBytes, HEADER_SIZE};

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut raw: FrameHeaderBytes = [0; HEADER_SIZE];
        raw.copy_from_slice(&src[..HEADER_SIZE]);
        let header = FrameHeader::from_bytes(&raw)?;

        let len = header.payload_length();
        if len > MAX_PAYLOAD_SIZE {
            return Err(PeerError::FrameTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).freeze();
        if !header.verify(&payload) {
            return Err(PeerError::ChecksumMismatch);
        }
        Frame::decode(header.kind(), payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PeerError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.encode_payload()?;
        let header = FrameHeader::for_payload(item.kind(), &payload);
        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&payload);
        Ok(())
    }
}
