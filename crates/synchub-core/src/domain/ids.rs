//! Identifier newtypes.
//!
//! Users and devices are both named by plain strings on the wire.  Wrapping
//! them in distinct types makes it a compile-time error to pass a device id
//! where a user id is expected (the registry takes both, side by side).

use std::fmt;

use serde::{Deserialize, Serialize};

/// The authenticated subject of a bearer token.
///
/// Serialized transparently as a JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A caller-supplied name for one logical device session, such as
/// `web_3f2a` or `android_pixel7`.
///
/// Unique per user, not globally, and never a security credential.  Two
/// device ids are the same device only if their strings are byte-for-byte
/// equal: no case folding, no trimming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
