//! JSON message types exchanged between producers, the bus, and devices.
//!
//! # Message flow
//!
//! ```text
//! Device  → Relay:  JSON text frame  →  DeviceFrame (Ping | Relay)
//! Relay   → Bus:    RelayFrame stamped with from_client
//! HTTP    → Bus:    Envelope { Event, from_client? }
//! Bus     → Device: raw JSON text, forwarded unmodified
//! Relay   → Device: ServerFrame (connected, pong)
//! ```
//!
//! # JSON discriminant
//!
//! Every message is a JSON object with a `"type"` field that identifies the
//! variant.  All other fields are flattened into the same object:
//!
//! ```json
//! {"type":"files_event","action":"uploaded","source":"drive","file_id":"f1"}
//! ```
//!
//! # Why is a relayed device frame not an `Event`?
//!
//! Front-ends invent new discriminators faster than the relay is redeployed.
//! A device frame is therefore decoded only as far as the relay needs it (is it
//! an object, what is its `type`), and everything else is passed through
//! untouched.  [`Event`] is the typed vocabulary for producers that build
//! events themselves, such as HTTP handlers via [`crate::notify::Notifier`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::domain::ids::DeviceId;
use crate::protocol::TYPE_FIELD;

/// Errors produced when a device frame cannot be decoded.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    /// The text is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The JSON value is not an object (e.g. an array or a bare string).
    #[error("frame must be a JSON object")]
    NotAnObject,

    /// The object has no string `type` field.
    #[error("frame has no string \"type\" field")]
    MissingType,

    /// The device sent a binary WebSocket frame; the protocol is text-only.
    #[error("binary frames are not supported")]
    Binary,
}

// ── Device → relay frames ─────────────────────────────────────────────────────

/// A decoded frame received from a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceFrame {
    /// Application-level keepalive: `{"type":"ping"}`.
    ///
    /// Answered directly with `{"type":"pong"}` and never published.
    Ping,

    /// Anything else: published to the user's channel.
    Relay(RelayFrame),
}

impl DeviceFrame {
    /// Decodes one text frame received from a device.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if the text is not a JSON object with a string
    /// `type` field.  Device input is untrusted; the caller treats any error
    /// as fatal for the session.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        let Value::Object(body) = value else {
            return Err(FrameError::NotAnObject);
        };

        let kind = match body.get(TYPE_FIELD) {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(FrameError::MissingType),
        };

        if kind == "ping" {
            return Ok(Self::Ping);
        }
        Ok(Self::Relay(RelayFrame { kind, body }))
    }
}

/// A device frame on its way to the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayFrame {
    kind: String,
    body: Map<String, Value>,
}

impl RelayFrame {
    /// The frame's `type` discriminator.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Serializes the frame with `from_client` set to `origin`, replacing any
    /// value the device supplied itself.
    pub fn stamped(mut self, origin: &DeviceId) -> String {
        crate::protocol::echo::stamp_origin(&mut self.body, origin);
        Value::Object(self.body).to_string()
    }
}

// ── Relay → device frames ─────────────────────────────────────────────────────

/// Frames the relay itself sends to a device.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// First frame of every accepted session.
    Connected { client_id: DeviceId },
    /// Reply to a device `ping`.
    Pong,
    /// A human-readable error notice.
    Error { message: String },
}

impl ServerFrame {
    pub fn connected(client_id: &DeviceId) -> Self {
        Self::Connected {
            client_id: client_id.clone(),
        }
    }

    /// Renders the frame as JSON text.
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Connected { client_id } => json!({
                "type": "connected",
                "client_id": client_id,
                "message": "Connected to SyncHub",
            }),
            Self::Pong => json!({ "type": "pong" }),
            Self::Error { message } => json!({ "type": "error", "message": message }),
        };
        value.to_string()
    }
}

// ── Typed events for producers ────────────────────────────────────────────────

/// What happened to a file, for `files_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Uploaded,
    Updated,
    Deleted,
}

/// What happened to a conversation, for `conversations_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationAction {
    Created,
    Deleted,
    Cleared,
    MessageAdded,
}

/// Typed events published by producers other than a device's own socket.
///
/// Serialized with `"type"` as the discriminator, e.g.
/// `{"type":"files_event","action":"deleted","source":"drive","file_id":"f1"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A chat line.
    Text {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },

    /// Shared clipboard text.
    Clipboard {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },

    /// A file shared into the chat stream.
    File {
        file_id: String,
        filename: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },

    /// Refresh signal for drive/gallery panels.  Never enters the chat UI.
    FilesEvent {
        action: FileAction,
        source: String,
        file_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_public: Option<bool>,
    },

    /// Refresh signal for the conversation sidebar.
    ConversationsEvent {
        action: ConversationAction,
        conversation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// The stored message, for `message_added`.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<Value>,
    },

    /// An error notice addressed to the user's devices.
    Error { message: String },
}

impl Event {
    /// The wire discriminator of this event, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Clipboard { .. } => "clipboard",
            Self::File { .. } => "file",
            Self::FilesEvent { .. } => "files_event",
            Self::ConversationsEvent { .. } => "conversations_event",
            Self::Error { .. } => "error",
        }
    }
}

/// An [`Event`] plus the optional id of the device that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: Event,

    /// Device whose own session must not receive this event.
    ///
    /// `None` for system- or HTTP-originated events, which reach every live
    /// session of the user.  Serialized under [`crate::protocol::ORIGIN_FIELD`].
    #[serde(rename = "from_client", default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<DeviceId>,
}

impl Envelope {
    /// An event with no originating device: delivered to every session.
    pub fn system(event: Event) -> Self {
        Self {
            event,
            origin: None,
        }
    }

    /// An event caused by `origin`: delivered to every session except it.
    pub fn from_device(event: Event, origin: DeviceId) -> Self {
        Self {
            event,
            origin: Some(origin),
        }
    }

    /// Serializes the envelope to JSON text.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error; not expected for well-formed
    /// events, but conversation messages carry arbitrary JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
