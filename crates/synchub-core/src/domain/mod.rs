//! Domain types: identifiers and the live connection registry.

pub mod ids;
pub mod registry;

pub use ids::{DeviceId, UserId};
pub use registry::{ConnectionHandle, ConnectionRegistry, OutboundFrame, RegistryError};
