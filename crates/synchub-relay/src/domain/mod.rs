//! Domain layer for synchub-relay.
//!
//! Plain types with no I/O: the relay configuration and the parsed form of a
//! device's upgrade request.  Shared vocabulary (ids, events, the registry)
//! lives in `synchub-core`.

pub mod config;
pub mod handshake;

pub use config::RelayConfig;
pub use handshake::{ConnectRequest, HandshakeError};
