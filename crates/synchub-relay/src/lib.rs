//! synchub-relay library crate.
//!
//! The WebSocket side of SyncHub: every device of a user keeps one socket
//! open here, and every event published for that user reaches all of them
//! except the device that caused it.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Devices (JSON over WebSocket)
//!         ↕
//! [synchub-relay]
//!   ├── domain/           RelayConfig, upgrade-path parsing
//!   ├── application/      Device session loop (two relays per socket)
//!   └── infrastructure/
//!         └── ws_server/  Accept loop, handshake, authentication
//!         ↕
//! [synchub-core]  registry, event bus, protocol, auth
//!         ↕
//! Event bus (in-process or Redis)  ←  HTTP producers
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `synchub-core`; it never binds
//!   sockets.
//! - `infrastructure` depends on all other layers plus `tokio` and
//!   `tokio-tungstenite`.

/// Domain layer: configuration and handshake parsing (no I/O).
pub mod domain;

/// Application layer: the device session loop.
pub mod application;

/// Infrastructure layer: WebSocket server.
pub mod infrastructure;
