//! Port announcement sent by the broker before the multiplexer starts.
//!
//! The broker writes the public port it leased for the client as a single
//! ASCII decimal line (`"4321\n"`). Everything after the newline is
//! multiplexer framing.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use thiserror::Error;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Connection closed before the port announcement was complete")]
    Truncated,

    #[error("Port announcement exceeds {0} bytes")]
    TooLong(usize),

    #[error("Invalid port announcement: {0:?}")]
    InvalidPort(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Render the announcement line for `port`
pub fn encode_port_announcement(port: u16) -> String {
    format!("{}\n", port)
}

/// Read exactly one announcement line from `reader` and parse the port.
///
/// Only the line itself is consumed; anything the reader buffered past the
/// newline stays available to the caller.
pub async fn read_port_announcement<R>(reader: &mut R) -> Result<u16, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut limited = reader.take(crate::MAX_ANNOUNCEMENT_LEN as u64);
    let n = limited.read_line(&mut line).await?;

    if !line.ends_with('\n') {
        if n >= crate::MAX_ANNOUNCEMENT_LEN {
            return Err(HandshakeError::TooLong(crate::MAX_ANNOUNCEMENT_LEN));
        }
        return Err(HandshakeError::Truncated);
    }

    let digits = line.trim_end_matches('\n').trim_end_matches('\r');
    match digits.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(HandshakeError::InvalidPort(digits.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    #[tokio::test]
    async fn test_reads_port_and_leaves_rest() {
        let raw: &[u8] = b"4321\n\x00\x00\x00\x01framed";
        let mut reader = BufReader::new(raw);

        let port = read_port_announcement(&mut reader).await.unwrap();
        assert_eq!(port, 4321);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"\x00\x00\x00\x01framed");
    }

    #[tokio::test]
    async fn test_accepts_crlf() {
        let mut reader = BufReader::new(&b"8080\r\n"[..]);
        assert_eq!(read_port_announcement(&mut reader).await.unwrap(), 8080);
    }

    #[tokio::test]
    async fn test_rejects_non_numeric() {
        let mut reader = BufReader::new(&b"notaport\n"[..]);
        let err = read_port_announcement(&mut reader).await.unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidPort(ref s) if s == "notaport"));
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_and_zero() {
        let mut reader = BufReader::new(&b"70000\n"[..]);
        assert!(matches!(
            read_port_announcement(&mut reader).await,
            Err(HandshakeError::InvalidPort(_))
        ));

        let mut reader = BufReader::new(&b"0\n"[..]);
        assert!(matches!(
            read_port_announcement(&mut reader).await,
            Err(HandshakeError::InvalidPort(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_newline_is_truncated() {
        let mut reader = BufReader::new(&b"4321"[..]);
        assert!(matches!(
            read_port_announcement(&mut reader).await,
            Err(HandshakeError::Truncated)
        ));

        let mut reader = BufReader::new(&b""[..]);
        assert!(matches!(
            read_port_announcement(&mut reader).await,
            Err(HandshakeError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_unbounded_line_is_rejected() {
        let long = vec![b'1'; 100];
        let mut reader = BufReader::new(&long[..]);
        assert!(matches!(
            read_port_announcement(&mut reader).await,
            Err(HandshakeError::TooLong(_))
        ));
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode_port_announcement(4321), "4321\n");
    }
}
