//! Integration tests for the connection handshake over real TCP.
//!
//! # Purpose
//!
//! These tests exercise the listener, the handshake session, the rate
//! limiter, and the proxy factory together, through the same surface a real
//! client sees: a TCP connection carrying length-prefixed frames.  They
//! verify:
//!
//! - The happy path: greeting received, reply accepted, proxy constructed,
//!   and the owner claiming the proxy exactly once.
//! - The rejection paths: unsupported versions earn an `Incompatible` reply
//!   carrying the *server's* version, protocol violations earn a
//!   `BadClient` reply, and both fail the session.
//! - The failure paths with no reply: timeout and early disconnect.
//! - Admission control: a saturated address is dropped before any greeting.
//!
//! # What does the wire look like?
//!
//! ```text
//! Server                                Client
//! ──────                                ──────
//! accept TCP connection
//! Hello { "KeyLink", 1, 8 }  ──────►
//!                            ◄──────   HelloReply { "KeyLink", 1, 2, name }
//! (proxy constructed, session completes)
//! ```
//!
//! Every frame is a 4-byte big-endian length prefix followed by the encoded
//! message.  The client side of that framing is hand-rolled here so the
//! tests do not depend on the server's own stream implementation.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use keylink_core::protocol::codec::{decode_message, encode_message};
use keylink_core::protocol::messages::{
    HandshakeMessage, HelloReplyMessage, IncompatibleMessage, PROTOCOL_ID,
};
use keylink_server::infrastructure::network::handshake::{FinishedHandshake, HandshakeError, HandshakeState};
use keylink_server::infrastructure::network::{
    default_factory, start_listener, RateLimiter, ServerContext,
};

// ── Test server and client helpers ────────────────────────────────────────────

struct TestServer {
    addr: SocketAddr,
    events: mpsc::Receiver<FinishedHandshake>,
    // Held so the listener keeps running for the test's lifetime.
    _shutdown: watch::Sender<bool>,
}

/// Starts a listener on an ephemeral loopback port with the default
/// version table and a fresh rate limiter.
async fn start_test_server(handshake_timeout: Duration) -> TestServer {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (addr, events) = start_listener(
        "127.0.0.1:0".parse().expect("valid loopback address"),
        handshake_timeout,
        Arc::new(RateLimiter::new()),
        Arc::new(default_factory()),
        Arc::new(ServerContext::new("integration-server")),
        shutdown_rx,
    )
    .await
    .expect("listener must bind");

    TestServer {
        addr,
        events,
        _shutdown: shutdown_tx,
    }
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .expect("write frame header");
    stream.write_all(payload).await.expect("write frame payload");
}

/// Reads one frame, or `None` when the server closed the connection.
async fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e)
            if e.kind() == io::ErrorKind::UnexpectedEof
                || e.kind() == io::ErrorKind::ConnectionReset =>
        {
            return None;
        }
        Err(e) => panic!("unexpected read error: {e}"),
    }
    let len = u32::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .expect("read frame payload");
    Some(payload)
}

async fn read_handshake_message(stream: &mut TcpStream) -> Option<HandshakeMessage> {
    let frame = read_frame(stream).await?;
    Some(decode_message(&frame).expect("server sent undecodable message"))
}

fn reply(major: i16, minor: i16, name: &str) -> Vec<u8> {
    encode_message(&HandshakeMessage::HelloReply(HelloReplyMessage {
        protocol_id: PROTOCOL_ID.to_string(),
        major,
        minor,
        name: name.to_string(),
    }))
}

/// Waits for the next finished handshake, failing the test on a hang.
async fn next_finished(server: &mut TestServer) -> FinishedHandshake {
    tokio::time::timeout(Duration::from_secs(5), server.events.recv())
        .await
        .expect("timed out waiting for a finished handshake")
        .expect("event channel closed unexpectedly")
}

// ── Happy path ────────────────────────────────────────────────────────────────

/// Tests the complete happy path: greeting, supported reply, proxy
/// construction, success notification, and the claim-once hand-off.
#[tokio::test]
async fn test_supported_client_completes_handshake_and_proxy_is_claimed_once() {
    let mut server = start_test_server(Duration::from_secs(5)).await;
    let mut client = TcpStream::connect(server.addr).await.expect("connect");

    // Step 1: the server speaks first.
    let greeting = read_handshake_message(&mut client).await.expect("greeting");
    match greeting {
        HandshakeMessage::Hello(hello) => {
            assert_eq!(hello.protocol_id, PROTOCOL_ID);
            assert_eq!(hello.major, 1);
            assert_eq!(hello.minor, 8);
        }
        other => panic!("expected Hello, got {other:?}"),
    }

    // Step 2: reply with a supported version and a display name.
    write_frame(&mut client, &reply(1, 2, "dev-laptop")).await;

    // Step 3: the owner is notified and claims the proxy.
    let mut done = next_finished(&mut server).await;
    assert_eq!(done.result, Ok(()));
    assert_eq!(done.session.state(), HandshakeState::Completed);
    assert_eq!(done.session.peer_name(), Some("dev-laptop"));

    let (proxy, _events) = done
        .session
        .orphan_client_proxy()
        .expect("first claim must yield the proxy");
    assert_eq!(proxy.name(), "dev-laptop");
    assert_eq!(proxy.version().to_string(), "1.2");

    // Claim-once: every later call is an idempotent no-op.
    assert!(done.session.orphan_client_proxy().is_none());
}

// ── Version rejection ─────────────────────────────────────────────────────────

/// A peer requesting 1.9 (one past the newest release) is refused with a
/// rejection carrying the server's own 1.8 – not the peer's version, and
/// not a generic error.
#[tokio::test]
async fn test_unsupported_minor_gets_incompatible_reply_with_server_version() {
    let mut server = start_test_server(Duration::from_secs(5)).await;
    let mut client = TcpStream::connect(server.addr).await.expect("connect");

    read_handshake_message(&mut client).await.expect("greeting");
    write_frame(&mut client, &reply(1, 9, "future-client")).await;

    let rejection = read_handshake_message(&mut client).await.expect("rejection");
    assert_eq!(
        rejection,
        HandshakeMessage::Incompatible(IncompatibleMessage { major: 1, minor: 8 })
    );

    let mut done = next_finished(&mut server).await;
    assert_eq!(
        done.result,
        Err(HandshakeError::Incompatible { major: 1, minor: 9 })
    );
    assert_eq!(done.session.state(), HandshakeState::Failed);
    assert!(done.session.orphan_client_proxy().is_none());
}

/// `major = 0` is never valid regardless of the dispatch table, and it is
/// classified as an incompatible version – not a protocol error – so the
/// peer still learns which version the server wanted.
#[tokio::test]
async fn test_major_zero_is_classified_incompatible() {
    let mut server = start_test_server(Duration::from_secs(5)).await;
    let mut client = TcpStream::connect(server.addr).await.expect("connect");

    read_handshake_message(&mut client).await.expect("greeting");
    write_frame(&mut client, &reply(0, 5, "ancient-client")).await;

    let rejection = read_handshake_message(&mut client).await.expect("rejection");
    assert!(matches!(rejection, HandshakeMessage::Incompatible(_)));

    let done = next_finished(&mut server).await;
    assert_eq!(
        done.result,
        Err(HandshakeError::Incompatible { major: 0, minor: 5 })
    );
}

// ── Protocol violations ───────────────────────────────────────────────────────

/// Undecodable bytes in place of a reply earn the generic `BadClient`
/// rejection: a misbehaving peer learns nothing about what was expected.
#[tokio::test]
async fn test_garbage_reply_gets_bad_client_reply() {
    let mut server = start_test_server(Duration::from_secs(5)).await;
    let mut client = TcpStream::connect(server.addr).await.expect("connect");

    read_handshake_message(&mut client).await.expect("greeting");
    write_frame(&mut client, &[0xDE, 0xAD, 0xBE, 0xEF]).await;

    let rejection = read_handshake_message(&mut client).await.expect("rejection");
    assert_eq!(rejection, HandshakeMessage::BadClient);

    let done = next_finished(&mut server).await;
    assert!(matches!(done.result, Err(HandshakeError::Protocol(_))));
}

/// A reply exceeding the 1024-byte handshake bound is a protocol error
/// before any field parsing: even though it contains a perfectly valid
/// message, the length check wins.
#[tokio::test]
async fn test_oversized_reply_is_rejected_by_length_before_content() {
    let mut server = start_test_server(Duration::from_secs(5)).await;
    let mut client = TcpStream::connect(server.addr).await.expect("connect");

    read_handshake_message(&mut client).await.expect("greeting");
    // A syntactically valid reply inflated past the bound by its name.
    let huge_name = "n".repeat(2000);
    write_frame(&mut client, &reply(1, 2, &huge_name)).await;

    let rejection = read_handshake_message(&mut client).await.expect("rejection");
    assert_eq!(rejection, HandshakeMessage::BadClient);

    let done = next_finished(&mut server).await;
    assert!(matches!(done.result, Err(HandshakeError::Protocol(_))));
}

// ── Timeout and disconnect ────────────────────────────────────────────────────

/// A silent peer trips the handshake timer; the session fails without
/// owing the peer any reply.
#[tokio::test]
async fn test_silent_client_times_out() {
    let mut server = start_test_server(Duration::from_millis(200)).await;
    let mut client = TcpStream::connect(server.addr).await.expect("connect");

    read_handshake_message(&mut client).await.expect("greeting");
    // Send nothing.

    let done = next_finished(&mut server).await;
    assert_eq!(done.result, Err(HandshakeError::Timeout));
    assert_eq!(done.session.state(), HandshakeState::Failed);

    // The server closed the connection; nothing further arrives.
    assert_eq!(read_frame(&mut client).await, None);
}

/// A peer that connects and immediately leaves fails the session as a
/// disconnect, not a timeout and not an I/O error.
#[tokio::test]
async fn test_client_disconnecting_after_greeting_fails_session() {
    let mut server = start_test_server(Duration::from_secs(5)).await;
    let mut client = TcpStream::connect(server.addr).await.expect("connect");

    read_handshake_message(&mut client).await.expect("greeting");
    drop(client);

    let done = next_finished(&mut server).await;
    assert_eq!(done.result, Err(HandshakeError::Disconnected));
    assert_eq!(done.session.state(), HandshakeState::Failed);
}

// ── Admission control ─────────────────────────────────────────────────────────

/// The 61st connection attempt from one address inside the window is
/// dropped before any greeting is sent; the first 60 all get greeted.
///
/// All attempts originate from 127.0.0.1, and the rate-limiter key is the
/// host without the ephemeral port, so every connection here shares one
/// key – exactly what this test needs to saturate a single address.
#[tokio::test]
async fn test_sixty_first_attempt_is_dropped_without_greeting() {
    let mut server = start_test_server(Duration::from_millis(100)).await;

    for i in 0..60 {
        let mut client = TcpStream::connect(server.addr).await.expect("connect");
        let greeting = read_handshake_message(&mut client).await;
        assert!(
            matches!(greeting, Some(HandshakeMessage::Hello(_))),
            "attempt {i} must be admitted and greeted"
        );
        drop(client);
    }

    // Attempt 61: accepted at the TCP level, then dropped by admission
    // control before a session (or greeting) ever exists.
    let mut refused = TcpStream::connect(server.addr).await.expect("connect");
    assert_eq!(
        read_frame(&mut refused).await,
        None,
        "rate-limited connection must be closed without a greeting"
    );

    // The 60 admitted sessions all fail (their clients left); drain them to
    // confirm none of them completed.
    for _ in 0..60 {
        let done = next_finished(&mut server).await;
        assert_ne!(done.result, Ok(()));
    }
}
