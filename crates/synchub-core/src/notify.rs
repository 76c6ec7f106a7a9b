//! Producer-side API for the HTTP action layer.
//!
//! HTTP handlers (uploads, conversation edits, chat sends) never talk to
//! sockets.  They build an [`Event`] and hand it to a [`Notifier`], which
//! serializes it and publishes it on the user's topic.  Every live session of
//! that user then forwards it, subject to echo suppression.
//!
//! # Choosing `notify` or `notify_from`
//!
//! | Situation                                    | Call |
//! |----------------------------------------------|------|
//! | Panel refresh after an upload or edit        | [`Notifier::notify`] |
//! | Chat message sent by a known device over HTTP | [`Notifier::notify_from`] |
//!
//! Refresh signals go to every device, including the one that uploaded, so
//! its own file list updates too.  Chat messages are already rendered locally
//! by the sender, so its session is spared.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::bus::{BusError, EventBus};
use crate::domain::ids::{DeviceId, UserId};
use crate::protocol::messages::{ConversationAction, Envelope, Event, FileAction};

/// Errors from [`Notifier`].
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to publish event: {0}")]
    Bus(#[from] BusError),
}

/// Publishes typed events on users' topics.  Cheap to clone.
#[derive(Clone)]
pub struct Notifier {
    bus: Arc<dyn EventBus>,
}

impl Notifier {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    /// Publishes an event with no originating device.  Every live session of
    /// `user` receives it.
    pub async fn notify(&self, user: &UserId, event: Event) -> Result<(), NotifyError> {
        self.publish(user, Envelope::system(event)).await
    }

    /// Publishes an event caused by `origin`.  Every live session of `user`
    /// except `origin`'s receives it.
    pub async fn notify_from(
        &self,
        user: &UserId,
        event: Event,
        origin: &DeviceId,
    ) -> Result<(), NotifyError> {
        self.publish(user, Envelope::from_device(event, origin.clone()))
            .await
    }

    async fn publish(&self, user: &UserId, envelope: Envelope) -> Result<(), NotifyError> {
        let payload = envelope.to_json()?;
        debug!(
            "notify user {user}: {} (origin {:?})",
            envelope.event.kind(),
            envelope.origin.as_ref().map(DeviceId::as_str)
        );
        self.bus.publish(user, payload).await?;
        Ok(())
    }
}

// ── Event constructors ────────────────────────────────────────────────────────

impl Event {
    pub fn text(content: impl Into<String>, device_name: Option<String>) -> Self {
        Self::Text {
            content: content.into(),
            device_name,
        }
    }

    pub fn clipboard(content: impl Into<String>, device_name: Option<String>) -> Self {
        Self::Clipboard {
            content: content.into(),
            device_name,
        }
    }

    /// A file shared into the chat stream.
    pub fn file_shared(
        file_id: impl Into<String>,
        filename: impl Into<String>,
        mime_type: Option<String>,
        device_name: Option<String>,
    ) -> Self {
        Self::File {
            file_id: file_id.into(),
            filename: filename.into(),
            mime_type,
            device_name,
        }
    }

    /// `files_event` for an upload or an edit, carrying the file's metadata.
    pub fn file_changed(
        action: FileAction,
        source: impl Into<String>,
        file_id: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        is_public: bool,
    ) -> Self {
        Self::FilesEvent {
            action,
            source: source.into(),
            file_id: file_id.into(),
            filename: Some(filename.into()),
            mime_type: Some(mime_type.into()),
            is_public: Some(is_public),
        }
    }

    /// `files_event` for a deletion: only the id and source are left.
    pub fn file_deleted(source: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self::FilesEvent {
            action: FileAction::Deleted,
            source: source.into(),
            file_id: file_id.into(),
            filename: None,
            mime_type: None,
            is_public: None,
        }
    }

    pub fn conversation_created(conversation_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self::conversation(ConversationAction::Created, conversation_id, Some(title.into()), None)
    }

    pub fn conversation_deleted(conversation_id: impl Into<String>) -> Self {
        Self::conversation(ConversationAction::Deleted, conversation_id, None, None)
    }

    pub fn conversation_cleared(conversation_id: impl Into<String>) -> Self {
        Self::conversation(ConversationAction::Cleared, conversation_id, None, None)
    }

    /// `message` is the stored message object as the HTTP layer returns it.
    pub fn message_added(conversation_id: impl Into<String>, message: Value) -> Self {
        Self::conversation(ConversationAction::MessageAdded, conversation_id, None, Some(message))
    }

    fn conversation(
        action: ConversationAction,
        conversation_id: impl Into<String>,
        title: Option<String>,
        message: Option<Value>,
    ) -> Self {
        Self::ConversationsEvent {
            action,
            conversation_id: conversation_id.into(),
            title,
            message,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
