//! Application layer for synchub-relay.
//!
//! The application layer knows *what* a device session does (relay bus
//! events to the device, publish the device's frames, keep exactly one entry
//! in the registry) but not *where* the socket comes from.  The session loop
//! is generic over any sink/stream pair of WebSocket messages, so it runs the
//! same over a real tokio-tungstenite socket and over in-memory channels in
//! tests.
//!
//! # What does NOT belong here?
//!
//! - Binding listeners or performing the HTTP upgrade (infrastructure)
//! - Token validation (done before a session exists)

pub mod session;

pub use session::{run_device_session, SessionContext, SessionEnd};
