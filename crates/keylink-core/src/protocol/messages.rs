//! All KeyLink handshake message types.
//!
//! Only the connection handshake is defined here: the greeting, the peer's
//! reply, and the two rejection messages.  Steady-state traffic (input
//! events, clipboard, keep-alives) is negotiated per protocol version and
//! lives with the version-specific handler implementations.

use serde::{Deserialize, Serialize};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Protocol identifier string carried in the greeting and expected back in
/// the peer's reply.
pub const PROTOCOL_ID: &str = "KeyLink";

/// Highest protocol major version this library speaks.
pub const PROTOCOL_MAJOR_VERSION: i16 = 1;

/// Highest protocol minor version this library speaks.
pub const PROTOCOL_MINOR_VERSION: i16 = 8;

/// Maximum encoded length of a [`HelloReplyMessage`] the server will accept.
///
/// A reply longer than this is a protocol error regardless of content; the
/// bound is checked before any field parsing so a hostile peer cannot make
/// the server buffer an arbitrarily long "name".
pub const MAX_HELLO_REPLY_LENGTH: usize = 1024;

// ── Message type codes ────────────────────────────────────────────────────────

/// Handshake message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HandshakeMessageType {
    Hello = 0x01,
    HelloReply = 0x02,
    Incompatible = 0x03,
    BadClient = 0x04,
}

impl TryFrom<u8> for HandshakeMessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(HandshakeMessageType::Hello),
            0x02 => Ok(HandshakeMessageType::HelloReply),
            0x03 => Ok(HandshakeMessageType::Incompatible),
            0x04 => Ok(HandshakeMessageType::BadClient),
            _ => Err(()),
        }
    }
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// HELLO (0x01): server greeting, sent immediately after the connection is
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Protocol identifier; always [`PROTOCOL_ID`] for this server.
    pub protocol_id: String,
    /// Highest major version the server supports.
    pub major: i16,
    /// Highest minor version the server supports.
    pub minor: i16,
}

/// HELLO_REPLY (0x02): the peer's answer to the greeting.
///
/// Version fields are signed on the wire so that a garbage or malicious
/// value can be carried faithfully into the error path; `major <= 0` or
/// `minor < 0` is never a valid version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReplyMessage {
    /// Protocol identifier the peer speaks; must match [`PROTOCOL_ID`].
    pub protocol_id: String,
    /// Major version the peer requests.
    pub major: i16,
    /// Minor version the peer requests.
    pub minor: i16,
    /// Peer-declared display name (typically its screen name).
    pub name: String,
}

/// INCOMPATIBLE (0x03): sent to a well-behaved peer whose requested version
/// the server does not support.  Carries the *server's* version so the peer
/// can tell its user what to upgrade or downgrade to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompatibleMessage {
    pub major: i16,
    pub minor: i16,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// All valid handshake messages, discriminated by type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    Hello(HelloMessage),
    HelloReply(HelloReplyMessage),
    Incompatible(IncompatibleMessage),
    /// Generic rejection for a peer that violated the protocol.  No payload:
    /// a misbehaving peer is told nothing about what the server expected.
    BadClient,
}

impl HandshakeMessage {
    /// Returns the [`HandshakeMessageType`] discriminant for this message.
    pub fn message_type(&self) -> HandshakeMessageType {
        match self {
            HandshakeMessage::Hello(_) => HandshakeMessageType::Hello,
            HandshakeMessage::HelloReply(_) => HandshakeMessageType::HelloReply,
            HandshakeMessage::Incompatible(_) => HandshakeMessageType::Incompatible,
            HandshakeMessage::BadClient => HandshakeMessageType::BadClient,
        }
    }
}
