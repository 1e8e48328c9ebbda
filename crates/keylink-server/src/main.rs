//! KeyLink server application entry point.
//!
//! Wires together the infrastructure services and starts the Tokio async
//! runtime.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()        -- TOML config with defaults
//!  └─ start_listener()     -- TCP accept loop + handshake sessions
//!  └─ event pump           -- finished handshakes → client registry
//! ```
//!
//! The pump is where ownership of a negotiated client finally lands: for
//! every successful handshake it claims the proxy via
//! `orphan_client_proxy()`, records the client in the registry, and keeps
//! watching the proxy's lifecycle events to mark disconnects.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use keylink_server::application::manage_clients::{
    ClientRegistry, ConnectedClient, ConnectionState,
};
use keylink_server::infrastructure::network::proxy::ProxyEvent;
use keylink_server::infrastructure::network::{
    default_factory, start_listener, RateLimiter, ServerContext,
};
use keylink_server::infrastructure::storage::config::load_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("KeyLink server starting");

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return Err(e.into());
        }
    };

    let bind_addr: SocketAddr =
        format!("{}:{}", config.network.bind_address, config.network.control_port).parse()?;
    let handshake_timeout = Duration::from_secs_f64(config.handshake.timeout_secs);

    let limiter = Arc::new(RateLimiter::new());
    let factory = Arc::new(default_factory());
    let ctx = Arc::new(ServerContext::new(config.server.name.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (local_addr, mut finished) = start_listener(
        bind_addr,
        handshake_timeout,
        limiter,
        factory,
        Arc::clone(&ctx),
        shutdown_rx,
    )
    .await?;
    info!(addr = %local_addr, name = %ctx.name, "listening for clients");

    let registry = Arc::new(Mutex::new(ClientRegistry::new()));

    // ── Handshake event pump ──────────────────────────────────────────────────
    let pump_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        while let Some(mut done) = finished.recv().await {
            match done.result {
                Ok(()) => {
                    let Some((proxy, mut events)) = done.session.orphan_client_proxy() else {
                        // Success without a claimable proxy would be a bug in
                        // the session; log it rather than trusting it.
                        warn!(session = %done.session.id(), "successful handshake yielded no proxy");
                        continue;
                    };

                    let name = proxy.name().to_string();
                    info!(
                        name = %name,
                        version = %proxy.version(),
                        "client connected"
                    );
                    pump_registry.lock().await.upsert(ConnectedClient {
                        name: name.clone(),
                        version: proxy.version(),
                        address: done.session.peer_address().map(str::to_string),
                        state: ConnectionState::Connected,
                    });

                    // The watcher task owns the claimed proxy for the rest of
                    // its life; it is released when the client disconnects.
                    let registry = Arc::clone(&pump_registry);
                    tokio::spawn(async move {
                        let _proxy = proxy;
                        while let Some(event) = events.recv().await {
                            if event == ProxyEvent::Disconnected {
                                info!(name = %name, "client disconnected");
                                registry
                                    .lock()
                                    .await
                                    .set_state(&name, ConnectionState::Disconnected);
                                break;
                            }
                        }
                    });
                }
                Err(e) => {
                    debug!(session = %done.session.id(), error = %e, "handshake failed");
                }
            }
        }
    });

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    info!("KeyLink server ready.  Press Ctrl-C to exit.");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    info!("KeyLink server stopped");
    Ok(())
}
