//! Byte proxy between two established duplex streams

use tokio::io::{AsyncRead, AsyncWrite};

/// Copy bytes in both directions until both sides have finished.
///
/// Returns `(a_to_b, b_to_a)` byte counts.
pub async fn proxy<A, B>(mut a: A, mut b: B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::io::copy_bidirectional(&mut a, &mut b).await
}
