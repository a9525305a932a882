//! Frame format spoken on a tunnel connection once the port line is read
//!
//! ```text
//! +-----------+------+-------+-----------+-------------+
//! | stream id | type | flags |  length   |   payload   |
//! |  u32 BE   |  u8  |  u8   |  u32 BE   | length bytes|
//! +-----------+------+-------+-----------+-------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Mutex;
use thiserror::Error;

pub type StreamId = u32;

/// Which end of the physical connection a session represents.
///
/// The broker side allocates odd stream ids and the forwarder side even ones,
/// so both ends can open streams without coordinating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn first_stream_id(self) -> StreamId {
        match self {
            Role::Server => 1,
            Role::Client => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Open a stream; with ACK or RST, the answer to one
    Open = 0,
    Data = 1,
    /// Half-close: the sender writes no more on this stream
    Close = 2,
    /// Liveness probe on the session stream; with ACK, the reply
    Ping = 3,
    /// The sender is closing the whole session
    GoAway = 4,
    /// Grants the peer more bytes of send credit on a stream
    WindowUpdate = 5,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => FrameType::Open,
            1 => FrameType::Data,
            2 => FrameType::Close,
            3 => FrameType::Ping,
            4 => FrameType::GoAway,
            5 => FrameType::WindowUpdate,
            other => return Err(FrameError::InvalidFrameType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0);
    /// Positive answer (open accepted, ping answered)
    pub const ACK: FrameFlags = FrameFlags(0b01);
    /// Refusal of an open
    pub const RST: FrameFlags = FrameFlags(0b10);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn has_ack(self) -> bool {
        self.0 & Self::ACK.0 != 0
    }

    pub fn has_rst(self) -> bool {
        self.0 & Self::RST.0 != 0
    }
}

/// Fixed-size prefix of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub length: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 10;

    /// Parse a header from the start of `raw`, which must hold at least
    /// [`FrameHeader::SIZE`] bytes.
    pub fn parse(mut raw: &[u8]) -> Result<Self, FrameError> {
        let stream_id = raw.get_u32();
        let frame_type = FrameType::try_from(raw.get_u8())?;
        let flags = FrameFlags::from_bits(raw.get_u8());
        let length = raw.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length as usize));
        }

        Ok(Self {
            stream_id,
            frame_type,
            flags,
            length,
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.length);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    fn empty(stream_id: StreamId, frame_type: FrameType, flags: FrameFlags) -> Self {
        Self {
            stream_id,
            frame_type,
            flags,
            payload: Bytes::new(),
        }
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::empty(stream_id, FrameType::Open, FrameFlags::NONE)
    }

    pub fn open_ack(stream_id: StreamId) -> Self {
        Self::empty(stream_id, FrameType::Open, FrameFlags::ACK)
    }

    /// Refuse a stream the peer tried to open
    pub fn open_rst(stream_id: StreamId) -> Self {
        Self::empty(stream_id, FrameType::Open, FrameFlags::RST)
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Data,
            flags: FrameFlags::NONE,
            payload,
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::empty(stream_id, FrameType::Close, FrameFlags::NONE)
    }

    pub fn ping(nonce: u32) -> Self {
        Self {
            stream_id: crate::SESSION_STREAM_ID,
            frame_type: FrameType::Ping,
            flags: FrameFlags::NONE,
            payload: Bytes::copy_from_slice(&nonce.to_be_bytes()),
        }
    }

    /// Reply to the ping carrying `nonce`
    pub fn pong(nonce: u32) -> Self {
        Self {
            flags: FrameFlags::ACK,
            ..Self::ping(nonce)
        }
    }

    pub fn go_away() -> Self {
        Self::empty(crate::SESSION_STREAM_ID, FrameType::GoAway, FrameFlags::NONE)
    }

    /// Let the peer send `increment` more bytes on `stream_id`
    pub fn window_update(stream_id: StreamId, increment: u32) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::WindowUpdate,
            flags: FrameFlags::NONE,
            payload: Bytes::copy_from_slice(&increment.to_be_bytes()),
        }
    }

    fn payload_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Nonce carried by a ping frame, if the payload holds one
    pub fn ping_nonce(&self) -> Option<u32> {
        self.payload_u32()
    }

    pub fn window_increment(&self) -> Option<u32> {
        self.payload_u32()
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            stream_id: self.stream_id,
            frame_type: self.frame_type,
            flags: self.flags,
            length: self.payload.len() as u32,
        }
    }

    /// Append the wire form of this frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        if self.payload.len() > crate::MAX_FRAME_SIZE as usize {
            return Err(FrameError::FrameTooLarge(self.payload.len()));
        }

        buf.reserve(FrameHeader::SIZE + self.payload.len());
        self.header().write(buf);
        buf.put_slice(&self.payload);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Unknown frame type {0}")]
    InvalidFrameType(u8),

    #[error("Frame payload of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("Stream ids exhausted")]
    NoAvailableStreamIds,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hands out stream ids of one parity for one side of a session
pub struct StreamIdAllocator {
    cursor: Mutex<StreamId>,
    first: StreamId,
}

impl StreamIdAllocator {
    pub fn new(role: Role) -> Self {
        let first = role.first_stream_id();
        Self {
            cursor: Mutex::new(first),
            first,
        }
    }

    /// Allocate the next id that `in_use` does not claim
    pub fn allocate(&self, in_use: impl Fn(StreamId) -> bool) -> Result<StreamId, FrameError> {
        let mut cursor = self
            .cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let origin = *cursor;
        loop {
            let candidate = *cursor;
            // Past u32::MAX the sum wraps below `first`; restart there
            *cursor = match candidate.checked_add(2) {
                Some(next) => next,
                None => self.first,
            };

            if !in_use(candidate) {
                return Ok(candidate);
            }
            if *cursor == origin {
                return Err(FrameError::NoAvailableStreamIds);
            }
        }
    }

    /// Whether `id` has this side's parity
    pub fn owns(&self, id: StreamId) -> bool {
        id != crate::SESSION_STREAM_ID && id % 2 == self.first % 2
    }
}
