//! SyncHub relay entry point.
//!
//! This binary accepts one WebSocket per device and fans every event
//! published for a user out to all of that user's live devices, except the
//! device that caused it.
//!
//! # Usage
//!
//! ```text
//! synchub-relay --secret-key <KEY> [OPTIONS]
//!
//! Options:
//!   --ws-bind      <ADDR>  Listener IP address [default: 0.0.0.0]
//!   --ws-port      <PORT>  Listener port [default: 8765]
//!   --path-prefix  <PATH>  URL prefix before the client id [default: /ws]
//!   --bus-url      <URL>   Event bus: memory:// or redis://... [default: memory://]
//!   --secret-key   <KEY>   HS256 secret shared with the login endpoint
//!   --direct-queue <N>     Per-session direct-frame queue [default: 64]
//!   --mint-token   <USER>  Print a token for USER and exit
//! ```
//!
//! # Environment variable overrides
//!
//! CLI args take precedence when both are present.
//!
//! | Variable               | Default      |
//! |------------------------|--------------|
//! | `SYNCHUB_WS_BIND`      | `0.0.0.0`    |
//! | `SYNCHUB_WS_PORT`      | `8765`       |
//! | `SYNCHUB_PATH_PREFIX`  | `/ws`        |
//! | `SYNCHUB_BUS_URL`      | `memory://`  |
//! | `SYNCHUB_SECRET_KEY`   | (required)   |
//! | `SYNCHUB_DIRECT_QUEUE` | `64`         |

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use synchub_core::{TokenIssuer, UserId};
use tracing::info;
use tracing_subscriber::EnvFilter;

use synchub_relay::domain::config::{
    DEFAULT_BUS_URL, DEFAULT_DIRECT_QUEUE, DEFAULT_PATH_PREFIX, DEFAULT_WS_PORT,
};
use synchub_relay::domain::RelayConfig;
use synchub_relay::infrastructure::run_server;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// SyncHub multi-device WebSocket relay.
#[derive(Debug, Parser)]
#[command(
    name = "synchub-relay",
    about = "Fans per-user events out to every live device session",
    version
)]
struct Cli {
    /// IP address to bind the WebSocket listener to.
    #[arg(long, default_value = "0.0.0.0", env = "SYNCHUB_WS_BIND")]
    ws_bind: String,

    /// TCP port for the WebSocket listener.
    #[arg(long, default_value_t = DEFAULT_WS_PORT, env = "SYNCHUB_WS_PORT")]
    ws_port: u16,

    /// URL path prefix; devices connect to `{prefix}/{client_id}`.
    #[arg(long, default_value = DEFAULT_PATH_PREFIX, env = "SYNCHUB_PATH_PREFIX")]
    path_prefix: String,

    /// Event bus URL.
    ///
    /// `memory://` works for a single relay process.  Several relays behind a
    /// load balancer must share `redis://host:port/db` (build with the
    /// `redis` feature).
    #[arg(long, default_value = DEFAULT_BUS_URL, env = "SYNCHUB_BUS_URL")]
    bus_url: String,

    /// Shared HS256 secret used to validate device tokens.
    #[arg(long, env = "SYNCHUB_SECRET_KEY", hide_env_values = true)]
    secret_key: String,

    /// Capacity of each session's queue for pongs and direct messages.
    #[arg(long, default_value_t = DEFAULT_DIRECT_QUEUE, env = "SYNCHUB_DIRECT_QUEUE")]
    direct_queue: usize,

    /// Print a token for this user id, signed with `--secret-key`, and exit.
    #[arg(long, value_name = "USER")]
    mint_token: Option<String>,
}

impl Cli {
    /// Converts the parsed CLI arguments into a [`RelayConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if `--ws-bind` is not an IP address, the secret is
    /// empty, or the direct queue has zero capacity.
    fn into_relay_config(self) -> anyhow::Result<RelayConfig> {
        let ws_bind_addr: SocketAddr = format!("{}:{}", self.ws_bind, self.ws_port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid WebSocket bind address: '{}:{}'",
                    self.ws_bind, self.ws_port
                )
            })?;

        anyhow::ensure!(!self.secret_key.is_empty(), "--secret-key must not be empty");
        anyhow::ensure!(self.direct_queue > 0, "--direct-queue must be at least 1");

        Ok(RelayConfig {
            ws_bind_addr,
            path_prefix: self.path_prefix,
            bus_url: self.bus_url,
            secret_key: self.secret_key,
            direct_queue: self.direct_queue,
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// 1. `tracing_subscriber` is initialised; `RUST_LOG` controls the level.
/// 2. CLI arguments are parsed into a [`Cli`] and then a [`RelayConfig`].
/// 3. With `--mint-token`, a token is printed and the process exits.
/// 4. A Ctrl+C handler clears the shared `running` flag.
/// 5. [`run_server`] serves until the flag is cleared, then evicts every
///    session with close code 1001.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut cli = Cli::parse();
    let mint_for = cli.mint_token.take();
    let config = cli.into_relay_config()?;

    if let Some(user) = mint_for {
        let token = TokenIssuer::new(config.secret_key.as_bytes())
            .issue(&UserId::new(user))
            .context("failed to sign token")?;
        println!("{token}");
        return Ok(());
    }

    info!(
        "SyncHub relay starting: ws={}, bus={}",
        config.ws_bind_addr, config.bus_url
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    run_server(config, running).await?;

    info!("SyncHub relay stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
