//! Echo suppression: a device never hears about its own action.
//!
//! Every producer follows one rule:
//!
//! - An event caused by a specific device is stamped with that device's id in
//!   `from_client`.
//! - An event with no single originating device (an HTTP side effect not
//!   attributed to a device, a system notice) carries no `from_client`.
//!
//! Every consumer follows the mirror rule: a session drops an event whose
//! `from_client` equals its own device id and forwards everything else.
//!
//! Comparison is exact string equality.  A `from_client` that is missing,
//! `null`, not a string, or different from the session's id means "deliver".
//! HTTP callers that want their own socket spared must pass their device id
//! explicitly (see [`crate::notify::Notifier::notify_from`]).

use serde_json::{Map, Value};

use crate::domain::ids::DeviceId;
use crate::protocol::ORIGIN_FIELD;

/// What a session should do with one bus payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Write the payload to the device unmodified.
    Forward,
    /// The payload is this device's own echo; drop it.
    SuppressEcho,
}

/// Decides whether the session for `device` should receive `payload`.
///
/// Payloads that are not JSON objects are forwarded verbatim: interpreting
/// them is the device's job, and a producer emitting malformed JSON is a bug
/// to fix at the producer, not a reason to lose the data here.
pub fn delivery_for(payload: &str, device: &DeviceId) -> Delivery {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return Delivery::Forward;
    };

    match value.get(ORIGIN_FIELD).and_then(Value::as_str) {
        Some(origin) if origin == device.as_str() => Delivery::SuppressEcho,
        _ => Delivery::Forward,
    }
}

/// Sets `from_client` on a JSON object to `device`, overwriting any value
/// already present.
pub fn stamp_origin(object: &mut Map<String, Value>, device: &DeviceId) {
    object.insert(
        ORIGIN_FIELD.to_string(),
        Value::String(device.as_str().to_string()),
    );
}

// ── Tests ─────────────────────────────────────────────────────────────────────
