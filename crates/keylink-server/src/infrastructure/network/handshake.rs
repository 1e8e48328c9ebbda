//! The connection handshake state machine.
//!
//! Every accepted connection is represented by one [`HandshakeSession`]
//! that walks it from raw byte stream to recognized protocol-version
//! client:
//!
//! ```text
//! Initial ──► HelloSent ──► HelloReceived ──► Completed
//!                 │               │
//!                 └───────────────┴─────────► Failed
//! ```
//!
//! States advance monotonically and the two terminal states absorb every
//! later event: a stray reply, a late disconnect, or a second timer fire
//! can never re-enter the machine.
//!
//! # Ownership (the part that bites)
//!
//! The session owns the stream exclusively while the handshake is in
//! flight.  The moment the peer's reply validates, the stream *moves* out
//! of the session into [`ProxyFactory::create`]; from then on the session
//! supervises the constructed proxy's `Ready`/`Disconnected` signals
//! instead of raw stream I/O.  The move is also the unsubscribe: once the
//! stream is gone there is no borrow left through which a stray handshake
//! read could race the proxy.  If the factory reports the version as
//! unsupported it hands the stream back, because the session still has a
//! rejection message to deliver on it.
//!
//! # Concurrency
//!
//! One session is one Tokio task.  Every wait – the peer's reply, the
//! proxy's readiness – is a `select!` suspension against the single
//! handshake timer, so a slow or malicious peer never stalls any other
//! connection.  Nothing in here is shared between sessions; the only
//! cross-session state is the [`RateLimiter`] consulted at construction.

use std::sync::Arc;
use std::time::Duration;

use keylink_core::protocol::codec::{decode_message, encode_message};
use keylink_core::protocol::messages::{
    HandshakeMessage, HelloMessage, IncompatibleMessage, MAX_HELLO_REPLY_LENGTH,
};
use keylink_core::ProtocolVersion;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::infrastructure::network::proxy::{
    ClientProxy, ProxyEvent, ProxyFactory, ProxyHandle, UnsupportedVersion,
};
use crate::infrastructure::network::rate_limit::{Admission, RateLimiter};
use crate::infrastructure::network::stream::SessionStream;
use crate::infrastructure::network::ServerContext;

/// Correlates a session across log lines and owner notifications.
pub type SessionId = Uuid;

/// Progress of one handshake.  `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Initial,
    HelloSent,
    HelloReceived,
    Completed,
    Failed,
}

/// Everything that can go wrong between accepting a stream and handing a
/// ready proxy to the server.
///
/// Every variant is contained: a session converts the error into a failure
/// outcome plus resource release, and nothing unwinds past the session
/// boundary.  The variants matter individually because three of them get
/// different on-wire treatment: `Protocol` earns a generic bad-client
/// reply, `Incompatible` earns a rejection carrying the server's own
/// version, and everything else gets no reply at all.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Admission denied before any session existed; no greeting was sent.
    #[error("connection attempt rate limited from {0}")]
    RateLimited(String),

    /// Malformed or oversized reply from the peer.  Carries the peer's
    /// display name when it was parsed before the violation.
    #[error("protocol error from client \"{0}\"")]
    Protocol(String),

    /// Well-formed reply requesting a version this server does not speak.
    #[error("incompatible client version {major}.{minor}")]
    Incompatible { major: i16, minor: i16 },

    /// The handshake timer fired before the exchange finished.
    #[error("client is unresponsive")]
    Timeout,

    /// Read or write failure on the stream; the channel itself is suspect,
    /// so no reply is attempted.
    #[error("error communicating with client: {0}")]
    Communication(String),

    /// The peer closed the connection before the handshake finished.
    #[error("client disconnected during handshake")]
    Disconnected,

    /// Anything else; logged and treated as failure, never a crash.
    #[error("unexpected handshake error: {0}")]
    Unexpected(String),
}

/// A finished session traveling back to its owner.
///
/// The notification *is* the hand-off: the owner receives the session
/// itself and, on success, claims the proxy via
/// [`HandshakeSession::orphan_client_proxy`].
pub struct FinishedHandshake {
    pub session: HandshakeSession,
    pub result: Result<(), HandshakeError>,
}

/// One pending connection, from stream acceptance to terminal state.
pub struct HandshakeSession {
    id: SessionId,
    state: HandshakeState,
    /// Owning slot for the inbound stream; empties exactly when ownership
    /// transfers to a constructed proxy, or on terminal failure.
    stream: Option<Box<dyn SessionStream>>,
    /// Owning slot for the constructed proxy until the server claims it.
    proxy: Option<Box<dyn ClientProxy>>,
    proxy_events: Option<mpsc::Receiver<ProxyEvent>>,
    ready: bool,
    peer_name: Option<String>,
    peer_address: Option<String>,
    timeout: Duration,
    factory: Arc<ProxyFactory>,
    ctx: Arc<ServerContext>,
}

impl HandshakeSession {
    /// Admits the connection through the rate limiter and constructs a
    /// session for it.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::RateLimited`] when the peer's address has
    /// made too many recent attempts.  No session exists afterwards and no
    /// greeting was sent; the caller just drops the stream.
    pub fn new(
        stream: Box<dyn SessionStream>,
        timeout: Duration,
        limiter: &RateLimiter,
        factory: Arc<ProxyFactory>,
        ctx: Arc<ServerContext>,
    ) -> Result<Self, HandshakeError> {
        let peer_address = stream.peer_address();
        if limiter.check_and_record(peer_address.as_deref()) == Admission::Rejected {
            let addr = peer_address.unwrap_or_default();
            warn!(addr = %addr, "connection attempt rate limited");
            return Err(HandshakeError::RateLimited(addr));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            state: HandshakeState::Initial,
            stream: Some(stream),
            proxy: None,
            proxy_events: None,
            ready: false,
            peer_name: None,
            peer_address,
            timeout,
            factory,
            ctx,
        })
    }

    /// Drives the handshake to a terminal state.
    ///
    /// Runs the greeting, the reply exchange, and the proxy-readiness wait
    /// under a single timer.  On failure every resource the session still
    /// owns is released and – where the taxonomy calls for one – a
    /// rejection is sent to the peer first.
    pub async fn run(&mut self) -> Result<(), HandshakeError> {
        let result = self.drive().await;
        match &result {
            Ok(()) => self.send_success(),
            Err(error) => self.send_failure(error).await,
        }
        result
    }

    async fn drive(&mut self) -> Result<(), HandshakeError> {
        // One timer covers the whole handshake: greeting write, reply wait,
        // and proxy readiness.  It is disarmed by reaching a terminal state
        // (this function returning), never re-armed.
        let timer = sleep(self.timeout);
        tokio::pin!(timer);

        // ── Initial → HelloSent: greet the peer ──────────────────────────
        let hello = HandshakeMessage::Hello(HelloMessage {
            protocol_id: self.ctx.protocol_id.clone(),
            major: self.ctx.version.major as i16,
            minor: self.ctx.version.minor as i16,
        });
        debug!(
            session = %self.id,
            protocol = %self.ctx.protocol_id,
            version = %self.ctx.version,
            "saying hello"
        );
        {
            let stream = self.stream_mut()?;
            let bytes = encode_message(&hello);
            tokio::select! {
                _ = &mut timer => return Err(HandshakeError::Timeout),
                written = stream.write_message(&bytes) => {
                    written.map_err(|e| HandshakeError::Communication(e.to_string()))?;
                }
            }
        }
        self.state = HandshakeState::HelloSent;

        // ── HelloSent: wait for the peer's reply ─────────────────────────
        let reply = {
            let stream = self.stream_mut()?;
            tokio::select! {
                _ = &mut timer => return Err(HandshakeError::Timeout),
                read = stream.read_message() => match read {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => return Err(HandshakeError::Disconnected),
                    Err(e) => return Err(HandshakeError::Communication(e.to_string())),
                },
            }
        };

        // ── HelloSent → HelloReceived: validate and dispatch ─────────────
        self.handle_reply(&reply)?;

        // ── HelloReceived: supervise the proxy until it is ready ─────────
        let events = self
            .proxy_events
            .as_mut()
            .ok_or_else(|| HandshakeError::Unexpected("proxy events missing after dispatch".into()))?;
        tokio::select! {
            _ = &mut timer => Err(HandshakeError::Timeout),
            event = events.recv() => match event {
                Some(ProxyEvent::Ready) => Ok(()),
                Some(ProxyEvent::Disconnected) | None => Err(HandshakeError::Disconnected),
            },
        }
    }

    /// Validates the peer's hello reply and dispatches to the factory.
    ///
    /// Check order is load-bearing: length bound before any parsing, parse
    /// before version validation, version sign check before the dispatch
    /// table.  A `major <= 0` or `minor < 0` is incompatible – never a
    /// protocol error – no matter what else is wrong with the reply.
    fn handle_reply(&mut self, bytes: &[u8]) -> Result<(), HandshakeError> {
        if self.state != HandshakeState::HelloSent {
            // Stray or duplicate event: a protocol violation, not a retry.
            warn!(session = %self.id, state = ?self.state, "unexpected hello reply");
            return Err(HandshakeError::Protocol(self.display_name().to_string()));
        }

        debug!(session = %self.id, "parsing hello reply");

        if bytes.len() > MAX_HELLO_REPLY_LENGTH {
            debug!(session = %self.id, len = bytes.len(), "hello reply too long");
            return Err(HandshakeError::Protocol(self.display_name().to_string()));
        }

        let reply = match decode_message(bytes) {
            Ok(HandshakeMessage::HelloReply(reply)) => reply,
            Ok(other) => {
                debug!(session = %self.id, got = ?other.message_type(), "reply is not a hello reply");
                return Err(HandshakeError::Protocol(self.display_name().to_string()));
            }
            Err(e) => {
                debug!(session = %self.id, error = %e, "malformed hello reply");
                return Err(HandshakeError::Protocol(self.display_name().to_string()));
            }
        };

        if reply.protocol_id != self.ctx.protocol_id {
            debug!(session = %self.id, got = %reply.protocol_id, "unknown protocol identifier");
            return Err(HandshakeError::Protocol(reply.name));
        }

        self.peer_name = Some(reply.name.clone());

        let Some(version) = ProtocolVersion::from_wire(reply.major, reply.minor) else {
            return Err(HandshakeError::Incompatible {
                major: reply.major,
                minor: reply.minor,
            });
        };

        // Hand the stream to the factory.  Taking it out of the slot ends
        // the handshake's read interest before the proxy can install its
        // own; a stray handshake read can never race the new owner.
        let stream = self
            .stream
            .take()
            .ok_or_else(|| HandshakeError::Unexpected("stream released before dispatch".into()))?;

        match self
            .factory
            .create(&reply.name, version, stream, Arc::clone(&self.ctx))
        {
            Ok((proxy, events)) => {
                debug!(
                    session = %self.id,
                    name = %reply.name,
                    version = %version,
                    "created proxy for client"
                );
                self.proxy = Some(proxy);
                self.proxy_events = Some(events);
                self.state = HandshakeState::HelloReceived;
                Ok(())
            }
            Err(UnsupportedVersion { version, stream }) => {
                // Construction never happened; reclaim the stream so the
                // failure path can still send the version-specific rejection.
                self.stream = Some(stream);
                Err(HandshakeError::Incompatible {
                    major: version.major as i16,
                    minor: version.minor as i16,
                })
            }
        }
    }

    /// Marks the session ready; the only path into `Completed`.
    fn send_success(&mut self) {
        self.ready = true;
        self.state = HandshakeState::Completed;
        info!(session = %self.id, name = %self.display_name(), "handshake complete");
    }

    /// Sends the reply the error calls for (if any), releases everything
    /// the session still owns, and marks the session `Failed`.
    async fn send_failure(&mut self, error: &HandshakeError) {
        match error {
            HandshakeError::Incompatible { major, minor } => {
                warn!(
                    session = %self.id,
                    name = %self.display_name(),
                    version = format_args!("{major}.{minor}"),
                    "client has incompatible version"
                );
                let rejection = HandshakeMessage::Incompatible(IncompatibleMessage {
                    major: self.ctx.version.major as i16,
                    minor: self.ctx.version.minor as i16,
                });
                self.send_rejection(&rejection).await;
            }
            HandshakeError::Protocol(name) => {
                warn!(session = %self.id, name = %name, "protocol error from client");
                self.send_rejection(&HandshakeMessage::BadClient).await;
            }
            HandshakeError::Timeout => {
                info!(session = %self.id, "new client is unresponsive");
            }
            HandshakeError::Disconnected => {
                info!(session = %self.id, "client disconnected during handshake");
            }
            HandshakeError::Communication(e) => {
                info!(session = %self.id, error = %e, "error communicating with new client");
            }
            HandshakeError::RateLimited(_) | HandshakeError::Unexpected(_) => {
                warn!(session = %self.id, error = %error, "handshake failed");
            }
        }

        // Release everything still owned: the partially built proxy, its
        // event subscription, and the stream if ownership never moved.
        self.proxy = None;
        self.proxy_events = None;
        self.ready = false;
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await;
        }
        self.state = HandshakeState::Failed;
    }

    /// Best-effort rejection write; the session is failing either way.
    async fn send_rejection(&mut self, msg: &HandshakeMessage) {
        if let Some(stream) = self.stream.as_mut() {
            let bytes = encode_message(msg);
            if let Err(e) = stream.write_message(&bytes).await {
                debug!(session = %self.id, error = %e, "failed to send rejection");
            }
        }
    }

    fn stream_mut(&mut self) -> Result<&mut Box<dyn SessionStream>, HandshakeError> {
        self.stream
            .as_mut()
            .ok_or_else(|| HandshakeError::Unexpected("stream released mid-handshake".into()))
    }

    fn display_name(&self) -> &str {
        self.peer_name.as_deref().unwrap_or("<unknown>")
    }

    // ── Owner-facing accessors ────────────────────────────────────────────

    /// Claims the constructed proxy and its event subscription.
    ///
    /// Returns `Some` exactly once per successful session; every later
    /// call – and any call on an unfinished or failed session – returns
    /// `None`.  Not an error: the owner may probe a session's result more
    /// than once but only disposes of the proxy once.
    pub fn orphan_client_proxy(&mut self) -> Option<ProxyHandle> {
        if !self.ready {
            return None;
        }
        match (self.proxy.take(), self.proxy_events.take()) {
            (Some(proxy), Some(events)) => Some((proxy, events)),
            _ => None,
        }
    }

    /// The stream, while the session still owns it (before hand-off, and
    /// before terminal failure releases it).
    pub fn stream(&self) -> Option<&dyn SessionStream> {
        self.stream.as_deref()
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The peer's display name, once its reply parsed.
    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    /// The peer's transport address, when the transport could report one.
    pub fn peer_address(&self) -> Option<&str> {
        self.peer_address.as_deref()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
