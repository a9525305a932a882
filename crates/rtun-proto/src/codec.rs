//! Length-delimited frame codec for `tokio_util::codec`

use crate::mux::{Frame, FrameError, FrameHeader};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Decodes and encodes [`Frame`]s on a byte stream
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < FrameHeader::SIZE {
            return Ok(None);
        }

        let header = FrameHeader::parse(&src[..FrameHeader::SIZE])?;
        let total = FrameHeader::SIZE + header.length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FrameHeader::SIZE);
        let payload = src.split_to(header.length as usize).freeze();

        Ok(Some(Frame {
            stream_id: header.stream_id,
            frame_type: header.frame_type,
            flags: header.flags,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        frame.encode_into(dst)
    }
}
