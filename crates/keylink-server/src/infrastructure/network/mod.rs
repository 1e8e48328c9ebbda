//! Network infrastructure: the framed stream abstraction, per-address
//! admission control, the versioned proxy factory, the handshake state
//! machine, and the TCP accept loop.

pub mod handshake;
pub mod listener;
pub mod proxy;
pub mod rate_limit;
pub mod stream;

use keylink_core::protocol::messages::{
    PROTOCOL_ID, PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION,
};
use keylink_core::ProtocolVersion;

pub use handshake::{FinishedHandshake, HandshakeError, HandshakeSession, HandshakeState};
pub use listener::{start_listener, ListenError};
pub use proxy::{default_factory, ClientProxy, ProxyEvent, ProxyFactory};
pub use rate_limit::{Admission, RateLimiter};
pub use stream::{tcp_session_stream, FramedStream, SessionStream};

/// Immutable facts about this server that handshake sessions and proxy
/// constructors need: what protocol it speaks and what it calls itself.
///
/// One instance is built at startup and shared as an `Arc`; per-version
/// proxies receive it so later protocol minors can reach server-wide state
/// without a new constructor signature per version.
#[derive(Debug, Clone)]
pub struct ServerContext {
    /// Protocol identifier expected in every peer reply.
    pub protocol_id: String,
    /// Highest protocol version this server speaks.
    pub version: ProtocolVersion,
    /// Display name of this server, shown to connecting clients' users.
    pub name: String,
}

impl ServerContext {
    /// Creates a context for the current protocol constants.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            protocol_id: PROTOCOL_ID.to_string(),
            version: ProtocolVersion::new(
                PROTOCOL_MAJOR_VERSION as u16,
                PROTOCOL_MINOR_VERSION as u16,
            ),
            name: name.into(),
        }
    }
}
