//! Client registry: bookkeeping of every client that completed a handshake.
//!
//! The registry is the server's in-memory roster.  Each entry tracks the
//! client's peer-declared name, its negotiated protocol version, the
//! address it connected from, and whether the connection is still up.
//!
//! # Lifecycle
//!
//! ```text
//! (handshake succeeds) ──► Connected ──► Disconnected
//! ```
//!
//! Entries are keyed by client name – the name is the client's identity in
//! the screen layout, so a reconnecting client replaces its old entry.
//! Disconnected entries are kept so the UI can show recently-seen clients
//! and so a reconnect is recognizable as such.

use std::collections::HashMap;

use keylink_core::ProtocolVersion;

/// Current state of a registered client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake complete; the proxy owns a live stream.
    Connected,
    /// The proxy reported the connection closed.
    Disconnected,
}

/// Runtime state for one client tracked by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedClient {
    /// Peer-declared display name; also the registry key.
    pub name: String,
    /// Protocol version negotiated during the handshake.
    pub version: ProtocolVersion,
    /// Transport address the client connected from, when known.
    pub address: Option<String>,
    pub state: ConnectionState,
}

/// In-memory roster of all clients that ever completed a handshake.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<String, ConnectedClient>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a client entry.
    pub fn upsert(&mut self, client: ConnectedClient) {
        self.clients.insert(client.name.clone(), client);
    }

    /// Returns a snapshot of all known clients.
    pub fn all(&self) -> Vec<ConnectedClient> {
        self.clients.values().cloned().collect()
    }

    /// Returns the entry for a specific client name.
    pub fn get(&self, name: &str) -> Option<&ConnectedClient> {
        self.clients.get(name)
    }

    /// Updates the connection state for a client, if registered.
    pub fn set_state(&mut self, name: &str, state: ConnectionState) {
        if let Some(client) = self.clients.get_mut(name) {
            client.state = state;
        }
    }

    /// Removes a client from the registry.
    pub fn remove(&mut self, name: &str) {
        self.clients.remove(name);
    }

    /// Number of clients currently in `Connected` state.
    pub fn connected_count(&self) -> usize {
        self.clients
            .values()
            .filter(|c| c.state == ConnectionState::Connected)
            .count()
    }
}
