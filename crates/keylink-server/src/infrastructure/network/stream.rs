//! Framed byte-stream abstraction used by handshake sessions and proxies.
//!
//! Every message travels as a 4-byte big-endian length prefix followed by
//! that many payload bytes.  The framing layer caps inbound frames at
//! [`MAX_FRAME_LENGTH`] so a hostile peer cannot make the server buffer an
//! arbitrarily large message; the handshake applies its own, tighter bound
//! on top of this one.
//!
//! [`SessionStream`] is the seam between the handshake machinery and the
//! transport: sessions and proxies hold a `Box<dyn SessionStream>` and never
//! see the concrete socket type, which keeps the state machine testable
//! against scripted streams.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Maximum size of a single inbound frame accepted by the transport.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024;

/// Size of the length prefix preceding every frame.
const FRAME_HEADER_SIZE: usize = 4;

/// One framed, addressable byte stream.
///
/// Exclusive ownership of a `Box<dyn SessionStream>` *is* ownership of the
/// underlying connection; whoever holds the box is the only party that may
/// read, write, or shut it down.
#[async_trait]
pub trait SessionStream: Send {
    /// The peer's address as a rate-limiter key, or `None` when the
    /// transport cannot report one.
    fn peer_address(&self) -> Option<String>;

    /// Reads one framed message.  `Ok(None)` means the peer shut the
    /// connection down cleanly.
    async fn read_message(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Writes one framed message.
    async fn write_message(&mut self, payload: &[u8]) -> io::Result<()>;

    /// Best-effort close of the write side.
    async fn shutdown(&mut self);
}

/// Length-prefix framing over any async byte stream.
pub struct FramedStream<T> {
    io: T,
    peer: Option<String>,
}

impl<T> FramedStream<T> {
    pub fn new(io: T, peer: Option<String>) -> Self {
        Self { io, peer }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for FramedStream<T> {
    fn peer_address(&self) -> Option<String> {
        self.peer.clone()
    }

    async fn read_message(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match self.io.read_exact(&mut header).await {
            Ok(_) => {}
            // EOF before a complete header is an orderly shutdown from the
            // reader's point of view; a peer that dies mid-frame below is a
            // real error.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the {MAX_FRAME_LENGTH}-byte cap"),
            ));
        }

        let mut payload = vec![0u8; len];
        self.io.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }

    async fn write_message(&mut self, payload: &[u8]) -> io::Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large to encode"))?;
        self.io.write_all(&len.to_be_bytes()).await?;
        self.io.write_all(payload).await?;
        self.io.flush().await
    }

    async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

/// Wraps an accepted TCP connection in the framing layer, capturing the
/// peer address while the socket can still report it.
///
/// Only the host part is kept: the address is the rate-limiter key, and a
/// reconnecting client must map to the same key even though every TCP
/// connection arrives from a fresh ephemeral port.
pub fn tcp_session_stream(stream: TcpStream) -> FramedStream<TcpStream> {
    let peer = stream.peer_addr().ok().map(|a| a.ip().to_string());
    FramedStream::new(stream, peer)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = (payload.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[tokio::test]
    async fn test_read_message_returns_one_frame_payload() {
        // Arrange – the mock stream yields a complete 3-byte frame.
        let mock = Builder::new().read(&frame(b"abc")).build();
        let mut stream = FramedStream::new(mock, None);

        // Act
        let msg = stream.read_message().await.unwrap();

        // Assert
        assert_eq!(msg, Some(b"abc".to_vec()));
    }

    #[tokio::test]
    async fn test_read_message_reassembles_split_frame() {
        // Header and payload arrive in separate reads, as TCP may deliver them.
        let bytes = frame(b"hello");
        let mock = Builder::new().read(&bytes[..2]).read(&bytes[2..]).build();
        let mut stream = FramedStream::new(mock, None);

        let msg = stream.read_message().await.unwrap();
        assert_eq!(msg, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_read_message_empty_frame_is_valid() {
        let mock = Builder::new().read(&frame(b"")).build();
        let mut stream = FramedStream::new(mock, None);

        let msg = stream.read_message().await.unwrap();
        assert_eq!(msg, Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_read_message_eof_at_frame_boundary_is_clean_shutdown() {
        let mock = Builder::new().build(); // no data at all
        let mut stream = FramedStream::new(mock, None);

        let msg = stream.read_message().await.unwrap();
        assert_eq!(msg, None);
    }

    #[tokio::test]
    async fn test_read_message_rejects_frame_above_cap() {
        // Header declares 65536 bytes – far above MAX_FRAME_LENGTH.
        let header = (65_536u32).to_be_bytes();
        let mock = Builder::new().read(&header).build();
        let mut stream = FramedStream::new(mock, None);

        let err = stream.read_message().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_write_message_emits_length_prefix_then_payload() {
        // Assert via the mock's write expectations.
        let mock = Builder::new()
            .write(&(2u32).to_be_bytes())
            .write(b"hi")
            .build();
        let mut stream = FramedStream::new(mock, None);

        stream.write_message(b"hi").await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_address_round_trips() {
        let mock = Builder::new().build();
        let stream = FramedStream::new(mock, Some("10.0.0.5:24800".to_string()));
        assert_eq!(stream.peer_address().as_deref(), Some("10.0.0.5:24800"));
    }
}
