//! WebSocket server: accept loop and per-connection handshake.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming TCP connections from devices.
//! 3. Checking the upgrade path (`{prefix}/{client_id}`) during the HTTP
//!    handshake and answering 404 for anything else.
//! 4. Authenticating the `token` query parameter once the upgrade completed;
//!    a bad token gets close code 4001 and nothing else.
//! 5. Handing authenticated sockets to the device session loop.
//! 6. Evicting every live session with close code 1001 once the `running`
//!    flag is cleared.
//!
//! # Why upgrade before rejecting a token?
//!
//! Browsers do not expose the HTTP status of a failed upgrade to JavaScript;
//! they only see a generic error.  A completed upgrade followed by a 4001
//! close frame is the only way a web client can tell "log in again" apart
//! from "network trouble, retry".

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use synchub_core::bus::EventBus;
use synchub_core::protocol::close_code;
use synchub_core::{AuthError, Authenticator, ConnectionRegistry, JwtAuthenticator};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::application::session::{close_message, run_device_session, SessionContext, SessionEnd};
use crate::domain::config::RelayConfig;
use crate::domain::handshake::{ConnectRequest, HandshakeError};

/// Bound for writing a rejection close frame and for waiting on its
/// acknowledgement.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// How long shutdown waits for evicted sessions to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ── Shared state ──────────────────────────────────────────────────────────────

/// State shared by every connection task.
pub struct RelayState {
    pub registry: Arc<ConnectionRegistry>,
    pub bus: Arc<dyn EventBus>,
    pub authenticator: Arc<dyn Authenticator>,
    pub path_prefix: String,
    pub direct_queue: usize,
}

impl RelayState {
    /// Builds the state for `config` on top of an already connected bus.
    pub fn new(config: &RelayConfig, bus: Arc<dyn EventBus>) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            bus,
            authenticator: Arc::new(JwtAuthenticator::new(config.secret_key.as_bytes())),
            path_prefix: config.path_prefix.clone(),
            direct_queue: config.direct_queue,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Connects the event bus, binds the listener and serves until `running` is
/// set to `false`.
///
/// # Errors
///
/// Returns an error if the bus URL cannot be opened or the listener cannot be
/// bound (port in use, missing permission).
pub async fn run_server(config: RelayConfig, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let bus = synchub_core::bus::connect(&config.bus_url)
        .await
        .with_context(|| format!("failed to open event bus {}", config.bus_url))?;

    let listener = TcpListener::bind(config.ws_bind_addr)
        .await
        .with_context(|| {
            format!(
                "failed to bind WebSocket listener on {}",
                config.ws_bind_addr
            )
        })?;

    info!(
        "SyncHub relay listening on ws://{}{}/{{client_id}}",
        config.ws_bind_addr, config.path_prefix
    );

    let state = Arc::new(RelayState::new(&config, bus));
    serve(listener, state, running).await
}

/// Runs the accept loop on an already bound listener.
///
/// Separate from [`run_server`] so tests can bind port 0 and inject their own
/// bus and authenticator.
pub async fn serve(
    listener: TcpListener,
    state: Arc<RelayState>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let connections = TaskTracker::new();

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // Short timeout so the loop notices the shutdown flag promptly.
        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                debug!("new connection from {peer_addr}");
                let state = Arc::clone(&state);
                connections.spawn(async move {
                    handle_device_connection(stream, peer_addr, state).await;
                });
            }
            Ok(Err(e)) => {
                // Transient (e.g. too many open files); keep serving.
                error!("accept error: {e}");
            }
            Err(_) => {}
        }
    }

    let evicted = state
        .registry
        .close_all(close_code::GOING_AWAY, "server shutting down");
    info!("evicted {evicted} live session(s)");

    connections.close();
    if timeout(SHUTDOWN_GRACE, connections.wait()).await.is_err() {
        warn!(
            "{} connection(s) still open after {SHUTDOWN_GRACE:?}; abandoning them",
            connections.len()
        );
    }
    Ok(())
}

// ── Per-connection handler ────────────────────────────────────────────────────

/// How one accepted TCP connection ended.
#[derive(Debug)]
enum ConnectionOutcome {
    Rejected(AuthError),
    Session(SessionEnd),
}

/// Wraps [`run_connection`] and logs the outcome.
async fn handle_device_connection(stream: TcpStream, peer_addr: SocketAddr, state: Arc<RelayState>) {
    match run_connection(stream, peer_addr, state).await {
        Ok(ConnectionOutcome::Session(end)) => debug!("connection {peer_addr} finished: {end:?}"),
        Ok(ConnectionOutcome::Rejected(e)) => info!("connection {peer_addr} rejected: {e}"),
        Err(e) => warn!("connection {peer_addr} closed with error: {e:#}"),
    }
}

/// Runs the complete lifecycle of one device connection.
///
/// # Errors
///
/// Returns an error if the WebSocket handshake fails, including the 404
/// answered for unknown paths.
async fn run_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<RelayState>,
) -> anyhow::Result<ConnectionOutcome> {
    // ── Step 1: upgrade, routing on the request path ──────────────────────────
    let mut parsed: Option<ConnectRequest> = None;
    let prefix = state.path_prefix.as_str();
    let route = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let uri = request.uri();
        match ConnectRequest::parse(uri.path(), uri.query(), prefix) {
            Ok(connect) => {
                parsed = Some(connect);
                Ok(response)
            }
            Err(e) => Err(not_found(&e)),
        }
    };

    let mut ws = accept_hdr_async(stream, route)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;
    let request = parsed.context("handshake accepted without a parsed request")?;

    // ── Step 2: authenticate ──────────────────────────────────────────────────
    let user = match state.authenticator.authenticate(request.token.as_deref()) {
        Ok(user) => user,
        Err(e) => {
            let _ = timeout(
                CLOSE_LINGER,
                ws.send(close_message(close_code::UNAUTHORIZED, "Unauthorized")),
            )
            .await;
            // Let the device read the close frame before the socket drops.
            let _ = timeout(CLOSE_LINGER, async {
                while let Some(Ok(_)) = ws.next().await {}
            })
            .await;
            return Ok(ConnectionOutcome::Rejected(e));
        }
    };

    info!(
        "device {} of user {user} connected from {peer_addr}",
        request.device
    );

    // ── Step 3: run the session ───────────────────────────────────────────────
    let (sink, stream) = ws.split();
    let ctx = SessionContext {
        user,
        device: request.device,
        registry: Arc::clone(&state.registry),
        bus: Arc::clone(&state.bus),
        direct_queue: state.direct_queue,
    };
    Ok(ConnectionOutcome::Session(
        run_device_session(sink, stream, ctx).await,
    ))
}

fn not_found(error: &HandshakeError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use synchub_core::MemoryBus;

    #[test]
    fn test_not_found_response_carries_reason() {
        let response = not_found(&HandshakeError::EmptyClientId);

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.body().as_deref(), Some("client id is empty"));
    }

    #[test]
    fn test_state_uses_configured_prefix_and_queue() {
        let config = RelayConfig {
            path_prefix: "/live".to_string(),
            direct_queue: 16,
            ..RelayConfig::default()
        };

        let state = RelayState::new(&config, Arc::new(MemoryBus::new()));

        assert_eq!(state.path_prefix, "/live");
        assert_eq!(state.direct_queue, 16);
        assert_eq!(state.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_serve_returns_once_running_is_cleared() {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let state = Arc::new(RelayState::new(
            &RelayConfig::default(),
            Arc::new(MemoryBus::new()),
        ));
        let running = Arc::new(AtomicBool::new(false));

        // Act
        let result = timeout(Duration::from_secs(2), serve(listener, state, running)).await;

        // Assert
        assert!(matches!(result, Ok(Ok(()))));
    }
}
