//! Client proxy trait, the version dispatch table, and the steady-state
//! stream proxy.
//!
//! A *proxy* is the server-side representative of one connected client: it
//! owns the client's stream after a successful handshake and speaks the
//! protocol variant negotiated for that client.  Versions can differ in
//! framing and message sets, so dispatch is an exact match on
//! `(major, minor)` – there is no silent downgrade to a "nearest" version.
//!
//! Adding a protocol version means registering one more entry in the
//! [`ProxyFactory`] table, not editing a branch chain.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use keylink_core::ProtocolVersion;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::infrastructure::network::stream::SessionStream;
use crate::infrastructure::network::ServerContext;

/// Lifecycle notifications a proxy emits once it owns its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyEvent {
    /// The proxy finished its own setup and is ready for normal traffic.
    Ready,
    /// The client went away.
    Disconnected,
}

/// Steady-state protocol handler for one negotiated version.
///
/// Implementations take exclusive ownership of the client's stream at
/// construction and report their lifecycle through the event receiver
/// returned alongside them.
pub trait ClientProxy: Send {
    /// The client's peer-declared display name.
    fn name(&self) -> &str;

    /// The protocol version this proxy speaks.
    fn version(&self) -> ProtocolVersion;
}

/// A constructed proxy together with the receiver for its lifecycle events.
///
/// Whoever holds the receiver is the proxy's supervisor: first the
/// handshake session (waiting for `Ready`), then, after the hand-off,
/// the server that claimed the proxy.
pub type ProxyHandle = (Box<dyn ClientProxy>, mpsc::Receiver<ProxyEvent>);

/// Construction function for one protocol version.
pub type ProxyCtor =
    Box<dyn Fn(String, Box<dyn SessionStream>, Arc<ServerContext>) -> ProxyHandle + Send + Sync>;

/// Returned by [`ProxyFactory::create`] when no table entry matches.
///
/// Carries the stream back out: construction never happened, so ownership
/// returns to the caller, which still needs the stream to send the
/// version-specific rejection.
pub struct UnsupportedVersion {
    pub version: ProtocolVersion,
    pub stream: Box<dyn SessionStream>,
}

impl fmt::Debug for UnsupportedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsupportedVersion")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Dispatch table mapping an exact protocol version to its proxy
/// constructor.
#[derive(Default)]
pub struct ProxyFactory {
    table: HashMap<ProtocolVersion, ProxyCtor>,
}

impl ProxyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the constructor for `version`.
    pub fn register(&mut self, version: ProtocolVersion, ctor: ProxyCtor) {
        self.table.insert(version, ctor);
    }

    /// Returns whether an exact table entry exists for `version`.
    pub fn supports(&self, version: ProtocolVersion) -> bool {
        self.table.contains_key(&version)
    }

    /// All registered versions in ascending order.
    pub fn supported_versions(&self) -> Vec<ProtocolVersion> {
        let mut versions: Vec<_> = self.table.keys().copied().collect();
        versions.sort();
        versions
    }

    /// Constructs the proxy for `version`, transferring stream ownership
    /// into it.
    ///
    /// # Errors
    ///
    /// Returns [`UnsupportedVersion`] – with the stream handed back – when
    /// no exact entry matches.
    pub fn create(
        &self,
        name: &str,
        version: ProtocolVersion,
        stream: Box<dyn SessionStream>,
        ctx: Arc<ServerContext>,
    ) -> Result<ProxyHandle, UnsupportedVersion> {
        match self.table.get(&version) {
            Some(ctor) => Ok(ctor(name.to_string(), stream, ctx)),
            None => Err(UnsupportedVersion { version, stream }),
        }
    }
}

/// Builds the dispatch table for every protocol version this server speaks:
/// 1.0 through the current 1.8, each served by a [`StreamProxy`].
pub fn default_factory() -> ProxyFactory {
    let mut factory = ProxyFactory::new();
    for minor in 0..=8u16 {
        let version = ProtocolVersion::new(1, minor);
        factory.register(
            version,
            Box::new(move |name, stream, _ctx| StreamProxy::spawn(name, version, stream)),
        );
    }
    factory
}

// ── Steady-state proxy ────────────────────────────────────────────────────────

/// Minimal steady-state handler: owns the stream, signals `Ready`, then
/// watches the connection and signals `Disconnected` when it closes.
///
/// Version-specific traffic handling (input events, clipboard, keep-alives)
/// plugs in behind this lifecycle; inbound frames are currently traced and
/// discarded.
pub struct StreamProxy {
    name: String,
    version: ProtocolVersion,
}

impl StreamProxy {
    /// Takes ownership of `stream` and spawns the supervision task.
    pub fn spawn(
        name: String,
        version: ProtocolVersion,
        mut stream: Box<dyn SessionStream>,
    ) -> ProxyHandle {
        let (tx, rx) = mpsc::channel(4);
        let task_name = name.clone();

        tokio::spawn(async move {
            // The stream is ours from this point; announce readiness first
            // so the handshake session supervising us can complete.
            if tx.send(ProxyEvent::Ready).await.is_err() {
                // Supervisor vanished before we even started.
                return;
            }

            loop {
                match stream.read_message().await {
                    Ok(Some(frame)) => {
                        trace!(name = %task_name, len = frame.len(), "steady-state frame");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(name = %task_name, error = %e, "proxy stream error");
                        break;
                    }
                }
            }

            stream.shutdown().await;
            let _ = tx.send(ProxyEvent::Disconnected).await;
        });

        (Box::new(StreamProxy { name, version }), rx)
    }
}

impl ClientProxy for StreamProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> ProtocolVersion {
        self.version
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
