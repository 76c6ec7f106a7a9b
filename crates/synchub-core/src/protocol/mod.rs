//! Protocol module: the JSON event vocabulary and the echo-suppression rule.

pub mod echo;
pub mod messages;

pub use echo::{delivery_for, stamp_origin, Delivery};
pub use messages::*;

/// Name of the field carrying the originating device id.
pub const ORIGIN_FIELD: &str = "from_client";

/// Name of the discriminator field present in every event.
pub const TYPE_FIELD: &str = "type";

/// WebSocket close codes sent by the relay.
///
/// Codes in the 4000–4999 range are application-defined (RFC 6455 §7.4.2);
/// clients use them to tell "log in again" apart from "just reconnect".
pub mod close_code {
    /// Server is shutting down; reconnect later.
    pub const GOING_AWAY: u16 = 1001;
    /// The device sent a frame that is not a JSON object with a `type`.
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// The event bus failed underneath the session.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Missing, expired, malformed or forged bearer token.
    pub const UNAUTHORIZED: u16 = 4001;
    /// Another connection registered the same device id for this user.
    pub const REPLACED: u16 = 4002;
}
