//! # keylink-core
//!
//! Shared library for KeyLink containing the handshake protocol messages,
//! the binary codec, and the protocol version type.
//!
//! This crate is used by the server and by client implementations.
//! It has zero dependencies on OS APIs, UI frameworks, or network sockets.
//!
//! # Architecture overview (for beginners)
//!
//! KeyLink is a software KVM switch: one computer's keyboard and mouse
//! control several machines over the network.  Before any input traffic
//! flows, a freshly accepted connection goes through a *handshake*: the
//! server greets the client with its protocol identifier and version, the
//! client replies with the version it speaks and its display name, and the
//! server either constructs a matching protocol handler or rejects the
//! client.
//!
//! This crate defines only what both sides must agree on:
//!
//! - **`protocol::messages`** – the four handshake messages and the wire
//!   constants bounding them.
//!
//! - **`protocol::codec`** – how those messages become bytes.  Messages are
//!   encoded into a compact binary format (1-byte type code + payload) and
//!   decoded back into typed Rust structs on the other end.
//!
//! - **`protocol::version`** – the `(major, minor)` protocol version pair
//!   and its validity rule.

pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `keylink_core::HandshakeMessage` instead of the full module path.
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::messages::HandshakeMessage;
pub use protocol::version::ProtocolVersion;
