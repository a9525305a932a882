//! Stream multiplexing capability for tunnel sessions
//!
//! A tunnel session carries many logical byte streams over one physical
//! connection. This crate defines that capability as the [`MuxSession`]
//! trait and ships one implementation, [`Session`], that speaks the frame
//! format from `rtun-proto` over any `AsyncRead + AsyncWrite`.

pub mod config;
pub mod proxy;
pub mod session;
pub mod stream;


pub use config::MuxConfig;
pub use proxy::proxy;
pub use rtun_proto::Role;
pub use session::Session;
pub use stream::MuxStream;

use async_trait::async_trait;
use rtun_proto::{FrameError, StreamId};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Session closed")]
    SessionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Stream {0} refused by peer")]
    StreamRefused(StreamId),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => TransportError::IoError(e),
            other => TransportError::ProtocolError(other.to_string()),
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A multiplexed session over one physical connection
#[async_trait]
pub trait MuxSession: Send + Sync {
    /// Logical stream type carried by this session
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new logical stream towards the peer
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Wait for the peer to open a logical stream
    async fn accept_stream(&self) -> TransportResult<Self::Stream>;

    /// Round-trip a liveness probe
    async fn ping(&self) -> TransportResult<Duration>;

    /// Close the session and every stream on it
    async fn close(&self);

    /// Check if the session has been closed
    fn is_closed(&self) -> bool;
}
