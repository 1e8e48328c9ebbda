//! TCP accept loop feeding handshake sessions.
//!
//! The listener owns nothing long-lived: it admits connections through the
//! shared [`RateLimiter`], spawns one task per handshake, and forwards each
//! [`FinishedHandshake`] to the owner over an `mpsc` channel.  A connection
//! that fails admission is dropped on the floor without a greeting – the
//! peer learns nothing about why.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::infrastructure::network::handshake::{FinishedHandshake, HandshakeSession};
use crate::infrastructure::network::proxy::ProxyFactory;
use crate::infrastructure::network::rate_limit::RateLimiter;
use crate::infrastructure::network::stream::tcp_session_stream;
use crate::infrastructure::network::ServerContext;

/// Error type for listener startup.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Binds `addr` and starts accepting connections.
///
/// Returns the bound address (useful with port 0) and the receiver that
/// delivers every finished handshake.  The loop stops when `shutdown`
/// flips to `true` or every receiver of the event channel is gone.
///
/// # Errors
///
/// Returns [`ListenError::BindFailed`] when the socket cannot be bound.
pub async fn start_listener(
    addr: SocketAddr,
    handshake_timeout: Duration,
    limiter: Arc<RateLimiter>,
    factory: Arc<ProxyFactory>,
    ctx: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(SocketAddr, mpsc::Receiver<FinishedHandshake>), ListenError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ListenError::BindFailed { addr, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ListenError::BindFailed { addr, source })?;

    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        info!(addr = %local_addr, "accepting client connections");
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    // Transient accept errors (EMFILE and friends) must not
                    // kill the loop.
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            debug!(peer = %peer, "accepted connection");

            let stream = Box::new(tcp_session_stream(socket));
            let session = match HandshakeSession::new(
                stream,
                handshake_timeout,
                &limiter,
                Arc::clone(&factory),
                Arc::clone(&ctx),
            ) {
                Ok(session) => session,
                Err(e) => {
                    // Rate limited: the connection is dropped silently,
                    // before any greeting.
                    debug!(peer = %peer, error = %e, "connection refused");
                    continue;
                }
            };

            let tx = tx.clone();
            tokio::spawn(async move {
                let mut session = session;
                let result = session.run().await;
                if tx.send(FinishedHandshake { session, result }).await.is_err() {
                    debug!("handshake owner gone; dropping finished session");
                }
            });
        }
        info!(addr = %local_addr, "listener stopped");
    });

    Ok((local_addr, rx))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
