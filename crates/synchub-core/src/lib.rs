//! # synchub-core
//!
//! Shared library for SyncHub's multi-device fan-out layer: the per-user
//! connection registry, the per-user event bus, the event protocol with its
//! echo-suppression rule, and the bearer-token authentication gate.
//!
//! This crate is used by the WebSocket relay (`synchub-relay`) and by any HTTP
//! handler that wants live devices notified.  It has no dependency on
//! WebSocket libraries or listening sockets.
//!
//! # Architecture overview
//!
//! A single user owns several devices (a browser tab, a phone app, a desktop
//! client).  Each device holds one WebSocket session.  When something happens
//! for that user (a device sends a chat line, an HTTP upload finishes) an
//! event is published on the user's channel and every live session of that
//! user receives it, except the session that caused it.
//!
//! - **`domain`** – Identifiers and the in-memory [`ConnectionRegistry`] of
//!   live device sessions.
//!
//! - **`protocol`** – The JSON event vocabulary ([`Event`], [`Envelope`]),
//!   device frame parsing, and the echo-suppression rule built on the
//!   `from_client` field.
//!
//! - **`bus`** – The [`EventBus`] abstraction over a publish/subscribe medium,
//!   with an in-process backend and an optional Redis backend.
//!
//! - **`auth`** – Stateless validation of the bearer credential presented at
//!   connection time.
//!
//! - **`notify`** – The producer-side API used by HTTP handlers.

pub mod auth;
pub mod bus;
pub mod domain;
pub mod notify;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `synchub_core::ConnectionRegistry` instead of the full module path.
pub use auth::{AuthError, Authenticator, JwtAuthenticator, TokenIssuer};
pub use bus::{BusError, EventBus, MemoryBus, Subscription};
pub use domain::ids::{DeviceId, UserId};
pub use domain::registry::{ConnectionHandle, ConnectionRegistry, OutboundFrame, RegistryError};
pub use notify::{NotifyError, Notifier};
pub use protocol::echo::{delivery_for, Delivery};
pub use protocol::messages::{
    ConversationAction, DeviceFrame, Envelope, Event, FileAction, FrameError, ServerFrame,
};
