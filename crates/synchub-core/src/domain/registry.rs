//! ConnectionRegistry: which devices of which users currently hold a live session.
//!
//! The registry maps `user → device → ConnectionHandle`.  It is the only state
//! shared between connections inside one relay process; everything else flows
//! through the event bus.
//!
//! # Replacement, not duplication
//!
//! A device that reconnects (page reload, flaky mobile network) usually shows
//! up with the same device id while its old socket is still half-open.  The
//! registry keeps at most one handle per `(user, device)`: a new registration
//! replaces the old one and hands the old handle back to the caller, which is
//! responsible for evicting it.
//!
//! Unregistration is conditional on handle identity, so when the old session
//! finally tears down it cannot remove the entry that now belongs to its
//! replacement.
//!
//! # Locking
//!
//! A single coarse `std::sync::Mutex` guards the whole map.  The number of
//! entries per user is a handful of devices and no lock is ever held across an
//! `.await`, so contention stays negligible even with many users.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::domain::ids::{DeviceId, UserId};

/// Errors returned when pushing a frame directly to one device.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    /// The device has no registered session.
    #[error("device {device} of user {user} is not connected")]
    DeviceOffline { user: UserId, device: DeviceId },

    /// The session's direct-frame queue is full.
    #[error("direct frame queue is full")]
    DeviceBusy,

    /// The session is shutting down and no longer accepts frames.
    #[error("session is closed")]
    DeviceGone,
}

/// A frame the server pushes to a device outside of the bus: keepalive
/// replies, one-off personal messages, and close requests.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// A JSON text frame, sent as-is.
    Text(String),
    /// Ask the session to send a close frame and stop.
    Close { code: u16, reason: String },
}

impl OutboundFrame {
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }
}

/// A writable handle to one live device session.
///
/// Cloning is cheap: all clones refer to the same session.  Equality of
/// sessions is decided by [`ConnectionHandle::id`], never by device id.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    frames: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle and the receiving end of its direct-frame queue.
    ///
    /// The session loop that owns the device socket keeps the receiver and
    /// writes everything it yields to the device.
    pub fn new(queue_capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (frames, rx) = mpsc::channel(queue_capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            frames,
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }

    /// Unique id of the underlying session.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// `true` if both handles refer to the same session.
    pub fn same_session(&self, other: &ConnectionHandle) -> bool {
        self.id == other.id
    }

    /// The session-wide cancellation token.  Cancelling it ends both halves
    /// of the session.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queues a frame, waiting for room if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DeviceGone`] once the session has stopped
    /// reading its queue.
    pub async fn send(&self, frame: OutboundFrame) -> Result<(), RegistryError> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| RegistryError::DeviceGone)
    }

    /// Queues a frame without waiting.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DeviceBusy`] when the queue is full,
    /// [`RegistryError::DeviceGone`] when the session has stopped.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<(), RegistryError> {
        self.frames.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RegistryError::DeviceBusy,
            mpsc::error::TrySendError::Closed(_) => RegistryError::DeviceGone,
        })
    }

    /// Asks the session to close with `code` and cancels it.
    ///
    /// The close request is best-effort: if the queue is full or the session
    /// is already gone, cancellation alone still stops it.
    pub fn evict(&self, code: u16, reason: &str) {
        let _ = self.try_send(OutboundFrame::close(code, reason));
        self.cancel.cancel();
    }

    /// `true` once the session has been cancelled or its queue dropped.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.frames.is_closed()
    }
}

/// In-memory registry of live device sessions, keyed by user then device.
///
/// Share it between connection handlers with an `Arc`; every method takes
/// `&self`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    users: Mutex<HashMap<UserId, HashMap<DeviceId, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, HashMap<DeviceId, ConnectionHandle>>> {
        // Every mutation is a single insert or remove, so a poisoned map is
        // still consistent.
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces the entry for `(user, device)`.
    ///
    /// Returns the previously registered handle, if any.  The caller must
    /// evict it; the registry no longer tracks it.
    pub fn register(
        &self,
        user: &UserId,
        device: &DeviceId,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let mut users = self.lock();
        let devices = users.entry(user.clone()).or_default();
        let previous = devices.insert(device.clone(), handle);
        debug!(
            "registry: user {user} device {device} registered ({} device(s) online)",
            devices.len()
        );
        previous
    }

    /// Removes `(user, device)` if it is still bound to `handle`.
    ///
    /// Returns `true` if an entry was removed.  Calling it again, or calling
    /// it with a handle that has since been replaced, is a no-op.  When the
    /// user's last device goes away the user's bucket is dropped as well.
    pub fn unregister(&self, user: &UserId, device: &DeviceId, handle: &ConnectionHandle) -> bool {
        let mut users = self.lock();
        let Some(devices) = users.get_mut(user) else {
            return false;
        };

        let matches = devices
            .get(device)
            .is_some_and(|current| current.same_session(handle));
        if matches {
            devices.remove(device);
            debug!("registry: user {user} device {device} unregistered");
        }

        if devices.is_empty() {
            users.remove(user);
        }
        matches
    }

    /// Removes `(user, device)` regardless of which session holds it and
    /// evicts that session with `code`.
    ///
    /// Returns `true` if a session was evicted.
    pub fn evict(&self, user: &UserId, device: &DeviceId, code: u16, reason: &str) -> bool {
        let removed = {
            let mut users = self.lock();
            let removed = users.get_mut(user).and_then(|d| d.remove(device));
            if users.get(user).is_some_and(HashMap::is_empty) {
                users.remove(user);
            }
            removed
        };

        match removed {
            Some(handle) => {
                handle.evict(code, reason);
                true
            }
            None => false,
        }
    }

    /// Evicts every live session and empties the registry.
    ///
    /// Used on process shutdown.  Returns the number of sessions evicted.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let drained: Vec<ConnectionHandle> = {
            let mut users = self.lock();
            users
                .drain()
                .flat_map(|(_, devices)| devices.into_values())
                .collect()
        };
        for handle in &drained {
            handle.evict(code, reason);
        }
        drained.len()
    }

    /// Snapshot of the device ids currently registered for `user`.
    pub fn list_devices(&self, user: &UserId) -> BTreeSet<DeviceId> {
        self.lock()
            .get(user)
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// `true` iff `user` has at least one registered device.
    pub fn is_online(&self, user: &UserId) -> bool {
        self.lock().get(user).is_some_and(|devices| !devices.is_empty())
    }

    /// Pushes a text frame straight to one device, bypassing the bus.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DeviceOffline`] if the device has no session, or the
    /// errors of [`ConnectionHandle::try_send`].
    pub fn send_to_device(
        &self,
        user: &UserId,
        device: &DeviceId,
        text: impl Into<String>,
    ) -> Result<(), RegistryError> {
        // Clone the handle out so the lock is released before sending.
        let handle = self
            .lock()
            .get(user)
            .and_then(|devices| devices.get(device))
            .cloned()
            .ok_or_else(|| RegistryError::DeviceOffline {
                user: user.clone(),
                device: device.clone(),
            })?;
        handle.try_send(OutboundFrame::Text(text.into()))
    }

    /// Total number of registered sessions across all users.
    pub fn connection_count(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    /// Number of users with at least one registered session.
    pub fn online_user_count(&self) -> usize {
        self.lock().len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    fn device(id: &str) -> DeviceId {
        DeviceId::new(id)
    }

    #[test]
    fn test_register_makes_user_online_and_lists_device() {
        // Arrange
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(4);

        // Act
        let previous = registry.register(&user("u1"), &device("web_A"), handle);

        // Assert
        assert!(previous.is_none());
        assert!(registry.is_online(&user("u1")));
        assert!(registry.list_devices(&user("u1")).contains(&device("web_A")));
    }

    #[test]
    fn test_unregister_last_device_takes_user_offline() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(4);
        registry.register(&user("u1"), &device("web_A"), handle.clone());

        assert!(registry.unregister(&user("u1"), &device("web_A"), &handle));

        assert!(!registry.is_online(&user("u1")));
        assert!(registry.list_devices(&user("u1")).is_empty());
        assert_eq!(registry.online_user_count(), 0, "empty bucket must be dropped");
    }

    #[test]
    fn test_unregister_keeps_user_online_while_other_devices_remain() {
        let registry = ConnectionRegistry::new();
        let (web, _rx1) = ConnectionHandle::new(4);
        let (android, _rx2) = ConnectionHandle::new(4);
        registry.register(&user("u1"), &device("web_A"), web.clone());
        registry.register(&user("u1"), &device("android_B"), android);

        registry.unregister(&user("u1"), &device("web_A"), &web);

        assert!(registry.is_online(&user("u1")));
        let devices = registry.list_devices(&user("u1"));
        assert_eq!(devices.len(), 1);
        assert!(devices.contains(&device("android_B")));
    }

    #[test]
    fn test_register_same_device_replaces_and_returns_previous_handle() {
        // Arrange
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = ConnectionHandle::new(4);
        let (second, _rx2) = ConnectionHandle::new(4);
        registry.register(&user("u1"), &device("web_A"), first.clone());

        // Act
        let previous = registry.register(&user("u1"), &device("web_A"), second);

        // Assert: exactly one entry, and the old handle was handed back
        let previous = previous.expect("previous handle must be returned");
        assert!(previous.same_session(&first));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_unregister_with_replaced_handle_does_not_remove_newer_entry() {
        let registry = ConnectionRegistry::new();
        let (old, _rx1) = ConnectionHandle::new(4);
        let (new, _rx2) = ConnectionHandle::new(4);
        registry.register(&user("u1"), &device("web_A"), old.clone());
        registry.register(&user("u1"), &device("web_A"), new);

        // The old session tears down late; it must not kick out its replacement.
        let removed = registry.unregister(&user("u1"), &device("web_A"), &old);

        assert!(!removed);
        assert!(registry.is_online(&user("u1")));
    }

    #[test]
    fn test_unregister_twice_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(4);
        registry.register(&user("u1"), &device("web_A"), handle.clone());

        assert!(registry.unregister(&user("u1"), &device("web_A"), &handle));
        assert!(!registry.unregister(&user("u1"), &device("web_A"), &handle));

        assert!(!registry.is_online(&user("u1")));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_unregister_unknown_user_returns_false() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(4);
        assert!(!registry.unregister(&user("ghost"), &device("x"), &handle));
    }

    #[test]
    fn test_same_device_id_under_different_users_is_independent() {
        let registry = ConnectionRegistry::new();
        let (a, _rx1) = ConnectionHandle::new(4);
        let (b, _rx2) = ConnectionHandle::new(4);

        assert!(registry.register(&user("u1"), &device("web"), a).is_none());
        assert!(registry.register(&user("u2"), &device("web"), b).is_none());

        assert_eq!(registry.connection_count(), 2);
        assert_eq!(registry.online_user_count(), 2);
    }

    #[test]
    fn test_evict_queues_close_frame_and_cancels_session() {
        // Arrange
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = ConnectionHandle::new(4);
        registry.register(&user("u1"), &device("web_A"), handle.clone());

        // Act
        let evicted = registry.evict(&user("u1"), &device("web_A"), 4002, "replaced");

        // Assert
        assert!(evicted);
        assert!(handle.is_closed());
        assert!(!registry.is_online(&user("u1")));
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::close(4002, "replaced"));
    }

    #[test]
    fn test_close_all_evicts_every_session() {
        let registry = ConnectionRegistry::new();
        let (a, _rx1) = ConnectionHandle::new(4);
        let (b, _rx2) = ConnectionHandle::new(4);
        registry.register(&user("u1"), &device("web_A"), a.clone());
        registry.register(&user("u2"), &device("pc_C"), b.clone());

        let count = registry.close_all(1001, "server shutting down");

        assert_eq!(count, 2);
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_send_to_device_delivers_text_frame() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = ConnectionHandle::new(4);
        registry.register(&user("u1"), &device("web_A"), handle);

        registry
            .send_to_device(&user("u1"), &device("web_A"), r#"{"type":"text"}"#)
            .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundFrame::Text(r#"{"type":"text"}"#.to_string())
        );
    }

    #[test]
    fn test_send_to_offline_device_returns_error() {
        let registry = ConnectionRegistry::new();
        let result = registry.send_to_device(&user("u1"), &device("web_A"), "{}");
        assert!(matches!(result, Err(RegistryError::DeviceOffline { .. })));
    }

    #[test]
    fn test_try_send_on_full_queue_reports_busy() {
        let (handle, _rx) = ConnectionHandle::new(1);
        handle.try_send(OutboundFrame::Text("1".into())).unwrap();
        assert_eq!(
            handle.try_send(OutboundFrame::Text("2".into())),
            Err(RegistryError::DeviceBusy)
        );
    }

    #[test]
    fn test_try_send_after_receiver_dropped_reports_gone() {
        let (handle, rx) = ConnectionHandle::new(1);
        drop(rx);
        assert_eq!(
            handle.try_send(OutboundFrame::Text("x".into())),
            Err(RegistryError::DeviceGone)
        );
        assert!(handle.is_closed());
    }

    #[test]
    fn test_registry_is_safe_under_concurrent_register_unregister() {
        use std::sync::Arc;

        let registry = Arc::new(ConnectionRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let u = user(&format!("u{}", i % 4));
                        let d = device(&format!("dev_{t}_{i}"));
                        let (h, _rx) = ConnectionHandle::new(1);
                        registry.register(&u, &d, h.clone());
                        registry.unregister(&u, &d, &h);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.online_user_count(), 0);
    }
}
