//! Relay configuration types.
//!
//! [`RelayConfig`] is the single source of truth for all runtime settings.
//! `main.rs` builds it from CLI arguments and environment variables; tests
//! build it directly.  Nothing below this struct reads the environment.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

/// Default WebSocket listener port.
pub const DEFAULT_WS_PORT: u16 = 8765;

/// Default URL path prefix; devices connect to `{prefix}/{client_id}`.
pub const DEFAULT_PATH_PREFIX: &str = "/ws";

/// Default event bus: in-process, single relay instance.
pub const DEFAULT_BUS_URL: &str = "memory://";

/// Default capacity of each session's direct-frame queue.
pub const DEFAULT_DIRECT_QUEUE: usize = 64;

/// All runtime configuration for the relay.
#[derive(Clone)]
pub struct RelayConfig {
    /// Address the WebSocket listener binds to.
    pub ws_bind_addr: SocketAddr,

    /// URL path prefix in front of the client id, without a trailing slash.
    pub path_prefix: String,

    /// Event bus URL (`memory://` or `redis://host:port/db`).
    pub bus_url: String,

    /// Shared HS256 secret used to validate device tokens.
    pub secret_key: String,

    /// Per-session queue for pongs, personal messages and close requests.
    pub direct_queue: usize,
}

impl Default for RelayConfig {
    /// Local-development defaults.  `secret_key` is empty, which makes every
    /// token invalid until one is configured.
    fn default() -> Self {
        Self {
            ws_bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_WS_PORT)),
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            bus_url: DEFAULT_BUS_URL.to_string(),
            secret_key: String::new(),
            direct_queue: DEFAULT_DIRECT_QUEUE,
        }
    }
}

// Hand-written so the secret never ends up in a log line.
impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("ws_bind_addr", &self.ws_bind_addr)
            .field("path_prefix", &self.path_prefix)
            .field("bus_url", &self.bus_url)
            .field("secret_key", &"<redacted>")
            .field("direct_queue", &self.direct_queue)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
