//! Tunnel Protocol Definitions
//!
//! Wire-level pieces shared by the broker and the forwarder: the port
//! announcement line sent before multiplexing starts, and the frame format
//! the multiplexer speaks afterwards.

pub mod codec;
pub mod handshake;
pub mod mux;

pub use codec::FrameCodec;
pub use handshake::{encode_port_announcement, read_port_announcement, HandshakeError};
pub use mux::{
    Frame, FrameError, FrameFlags, FrameHeader, FrameType, Role, StreamId, StreamIdAllocator,
};

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved stream ID for session-level frames (ping, go-away)
pub const SESSION_STREAM_ID: StreamId = 0;

/// Longest port announcement line accepted, newline included
pub const MAX_ANNOUNCEMENT_LEN: usize = 32;

/// Bytes a sender may have in flight on one stream before the receiver
/// grants more with a window update
pub const STREAM_WINDOW: u32 = 256 * 1024;
