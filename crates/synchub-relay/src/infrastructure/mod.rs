//! Infrastructure layer for synchub-relay.
//!
//! Everything that touches the network: the TCP listener, the WebSocket
//! upgrade with its path routing, connection-time authentication, and the
//! shutdown sequence.

pub mod ws_server;

pub use ws_server::{run_server, serve, RelayState};
