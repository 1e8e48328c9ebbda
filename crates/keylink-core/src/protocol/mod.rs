//! Protocol module containing handshake message types, the binary codec,
//! and the protocol version pair.

pub mod codec;
pub mod messages;
pub mod version;

pub use codec::{decode_message, encode_message, ProtocolError};
pub use messages::*;
pub use version::ProtocolVersion;
