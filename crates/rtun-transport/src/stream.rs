//! Logical stream handle

use rtun_proto::StreamId;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// One logical stream of a [`Session`](crate::Session).
///
/// Reads yield bytes the peer sent on this stream and EOF once the peer
/// closed its side. `shutdown()` or dropping the handle closes our side.
#[derive(Debug)]
pub struct MuxStream {
    id: StreamId,
    inner: DuplexStream,
}

impl MuxStream {
    pub(crate) fn new(id: StreamId, inner: DuplexStream) -> Self {
        Self { id, inner }
    }

    pub fn stream_id(&self) -> StreamId {
        self.id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
