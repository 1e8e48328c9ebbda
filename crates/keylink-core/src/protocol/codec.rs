//! Binary codec for encoding and decoding KeyLink handshake messages.
//!
//! Wire format:
//! ```text
//! [msg_type:1][payload:N]
//! ```
//! Strings are u16-length-prefixed UTF-8; all multi-byte integers are
//! big-endian.  The outer transport frames each message, so a decoder always
//! sees exactly one message per buffer and rejects trailing bytes.

use crate::protocol::messages::{
    HandshakeMessage, HandshakeMessageType, HelloMessage, HelloReplyMessage, IncompatibleMessage,
};
use thiserror::Error;

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The message type byte is not a recognized value.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The payload could not be parsed (field out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Bytes were left over after the payload was fully parsed.
    #[error("trailing bytes after {msg_type:?} payload: {count}")]
    TrailingBytes {
        msg_type: HandshakeMessageType,
        count: usize,
    },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`HandshakeMessage`] into a byte vector.
///
/// # Examples
///
/// ```rust
/// use keylink_core::protocol::{encode_message, decode_message};
/// use keylink_core::protocol::messages::{HandshakeMessage, IncompatibleMessage};
///
/// let msg = HandshakeMessage::Incompatible(IncompatibleMessage { major: 1, minor: 8 });
/// let bytes = encode_message(&msg);
/// let decoded = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// ```
pub fn encode_message(msg: &HandshakeMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.push(msg.message_type() as u8);
    match msg {
        HandshakeMessage::Hello(m) => encode_hello(&mut buf, m),
        HandshakeMessage::HelloReply(m) => encode_hello_reply(&mut buf, m),
        HandshakeMessage::Incompatible(m) => encode_incompatible(&mut buf, m),
        HandshakeMessage::BadClient => {} // empty payload
    }
    buf
}

/// Decodes one [`HandshakeMessage`] from `bytes`.
///
/// The buffer must contain exactly one message; trailing bytes are rejected
/// so a peer cannot smuggle extra data behind a valid reply.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are malformed.
pub fn decode_message(bytes: &[u8]) -> Result<HandshakeMessage, ProtocolError> {
    if bytes.is_empty() {
        return Err(ProtocolError::InsufficientData {
            needed: 1,
            available: 0,
        });
    }

    let msg_type = HandshakeMessageType::try_from(bytes[0])
        .map_err(|_| ProtocolError::UnknownMessageType(bytes[0]))?;
    let payload = &bytes[1..];

    let (msg, consumed) = match msg_type {
        HandshakeMessageType::Hello => {
            let (m, n) = decode_hello(payload)?;
            (HandshakeMessage::Hello(m), n)
        }
        HandshakeMessageType::HelloReply => {
            let (m, n) = decode_hello_reply(payload)?;
            (HandshakeMessage::HelloReply(m), n)
        }
        HandshakeMessageType::Incompatible => {
            let (m, n) = decode_incompatible(payload)?;
            (HandshakeMessage::Incompatible(m), n)
        }
        HandshakeMessageType::BadClient => (HandshakeMessage::BadClient, 0),
    };

    if consumed != payload.len() {
        return Err(ProtocolError::TrailingBytes {
            msg_type,
            count: payload.len() - consumed,
        });
    }
    Ok(msg)
}

// ── Per-message encode helpers ────────────────────────────────────────────────

fn encode_hello(buf: &mut Vec<u8>, m: &HelloMessage) {
    write_length_prefixed_string(buf, &m.protocol_id);
    buf.extend_from_slice(&m.major.to_be_bytes());
    buf.extend_from_slice(&m.minor.to_be_bytes());
}

fn encode_hello_reply(buf: &mut Vec<u8>, m: &HelloReplyMessage) {
    write_length_prefixed_string(buf, &m.protocol_id);
    buf.extend_from_slice(&m.major.to_be_bytes());
    buf.extend_from_slice(&m.minor.to_be_bytes());
    write_length_prefixed_string(buf, &m.name);
}

fn encode_incompatible(buf: &mut Vec<u8>, m: &IncompatibleMessage) {
    buf.extend_from_slice(&m.major.to_be_bytes());
    buf.extend_from_slice(&m.minor.to_be_bytes());
}

// ── Per-message decode helpers ────────────────────────────────────────────────

fn decode_hello(p: &[u8]) -> Result<(HelloMessage, usize), ProtocolError> {
    let (protocol_id, off) = read_length_prefixed_string(p, 0)?;
    let major = read_i16(p, off)?;
    let minor = read_i16(p, off + 2)?;
    Ok((
        HelloMessage {
            protocol_id,
            major,
            minor,
        },
        off + 4,
    ))
}

fn decode_hello_reply(p: &[u8]) -> Result<(HelloReplyMessage, usize), ProtocolError> {
    let (protocol_id, off) = read_length_prefixed_string(p, 0)?;
    let major = read_i16(p, off)?;
    let minor = read_i16(p, off + 2)?;
    let (name, end) = read_length_prefixed_string(p, off + 4)?;
    Ok((
        HelloReplyMessage {
            protocol_id,
            major,
            minor,
            name,
        },
        end,
    ))
}

fn decode_incompatible(p: &[u8]) -> Result<(IncompatibleMessage, usize), ProtocolError> {
    let major = read_i16(p, 0)?;
    let minor = read_i16(p, 2)?;
    Ok((IncompatibleMessage { major, minor }, 4))
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn read_i16(buf: &[u8], offset: usize) -> Result<i16, ProtocolError> {
    if buf.len() < offset + 2 {
        return Err(ProtocolError::InsufficientData {
            needed: offset + 2,
            available: buf.len(),
        });
    }
    Ok(i16::from_be_bytes([buf[offset], buf[offset + 1]]))
}

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize) as u16;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&bytes[..len as usize]);
}

/// Reads a 2-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after the string.
fn read_length_prefixed_string(buf: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    if buf.len() < offset + 2 {
        return Err(ProtocolError::MalformedPayload(format!(
            "need 2 bytes for string length at offset {offset}"
        )));
    }
    let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    let start = offset + 2;
    if buf.len() < start + len {
        return Err(ProtocolError::MalformedPayload(format!(
            "string of length {len} at offset {start} exceeds buffer"
        )));
    }
    let s = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
