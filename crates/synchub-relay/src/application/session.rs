//! Device session loop: one per live WebSocket connection.
//!
//! # Lifecycle
//!
//! ```text
//! subscribe(user) ─► new handle ─► register (evict previous) ─► "connected"
//!                                                                   │
//!            ┌──────────────────────────────────────────────────────┤
//!            ▼                                                      ▼
//!   inbound relay (owns sink)                          outbound relay (owns stream)
//!   direct queue │ cancel │ bus ──► device             device ──► ping → pong
//!                                                                  else → stamp → bus
//!            └──────────── either ends → cancel token ─────────────┘
//! ```
//!
//! The inbound relay is the only writer to the device.  Everything else that
//! wants to reach the device (pongs, personal messages, eviction) goes through
//! the handle's direct queue, which the inbound relay drains before looking at
//! the bus.
//!
//! # Cleanup
//!
//! Cleanup runs exactly once, through ownership rather than flags:
//!
//! - the registry entry is removed when [`Registration`] drops, and only if
//!   it still belongs to this session (a newer session may have replaced it);
//! - the bus subscription is released when the inbound relay returns;
//! - each relay holds a drop guard on the shared cancellation token, so the
//!   first one to finish, return or panic stops the other.
//!
//! A device that stops reading must not pin its session: every write races
//! the cancellation token, and close frames get [`CLOSE_WRITE_TIMEOUT`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use synchub_core::bus::{EventBus, Subscription};
use synchub_core::protocol::close_code;
use synchub_core::{
    delivery_for, ConnectionHandle, ConnectionRegistry, Delivery, DeviceFrame, DeviceId,
    FrameError, OutboundFrame, ServerFrame, UserId,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound for writing a close frame and closing the sink.
pub const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a session needs besides its socket.
#[derive(Clone)]
pub struct SessionContext {
    pub user: UserId,
    pub device: DeviceId,
    pub registry: Arc<ConnectionRegistry>,
    pub bus: Arc<dyn EventBus>,
    pub direct_queue: usize,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The device closed the connection or its stream ended.
    DeviceClosed,
    /// The server asked the session to close (replacement, shutdown).
    ClosedByServer { code: u16 },
    /// The session was cancelled without a close request.
    Cancelled,
    /// The user's subscription ended.
    BusClosed,
    /// The event bus reported an error for this session.
    BusFailed(String),
    /// Writing to the device failed.
    ForwardFailed,
    /// The device sent something that is not a JSON object with a `type`.
    MalformedFrame(String),
    /// The WebSocket transport failed.
    Transport(String),
    /// One of the relay tasks panicked.
    TaskFailed(String),
}

impl SessionEnd {
    /// Picks the reason worth reporting from the two relays' results.
    ///
    /// A relay that stopped because its sibling cancelled it, or that only
    /// delivered a close request queued by its sibling, is reacting; the
    /// sibling's result is the cause.
    pub fn cause(inbound: SessionEnd, outbound: SessionEnd) -> SessionEnd {
        if outbound.rank() > inbound.rank() {
            outbound
        } else {
            inbound
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Cancelled => 0,
            Self::ClosedByServer { .. } => 1,
            _ => 2,
        }
    }
}

/// Runs one device session to completion.
///
/// `sink` and `stream` are the two halves of the device socket.  Returns once
/// both relays have stopped and the session's registry entry and bus
/// subscription have been released.
pub async fn run_device_session<Si, St>(mut sink: Si, stream: St, ctx: SessionContext) -> SessionEnd
where
    Si: Sink<WsMessage> + Unpin + Send + 'static,
    St: Stream<Item = Result<WsMessage, WsError>> + Unpin + Send + 'static,
{
    let SessionContext {
        user,
        device,
        registry,
        bus,
        direct_queue,
    } = ctx;

    // Subscribe before registering so that nothing published after the
    // "connected" frame can be missed.
    let subscription = match bus.subscribe(&user).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("user {user} device {device}: subscribe failed: {e}");
            close_sink(&mut sink, close_code::INTERNAL_ERROR, "event bus unavailable").await;
            return SessionEnd::BusFailed(e.to_string());
        }
    };

    let (handle, direct_rx) = ConnectionHandle::new(direct_queue);
    let cancel = handle.cancellation();
    // Dropping this future (e.g. on runtime shutdown) stops both relays.
    let _cancel_on_exit = cancel.clone().drop_guard();

    if let Some(previous) = registry.register(&user, &device, handle.clone()) {
        info!("user {user} device {device}: replacing previous session");
        previous.evict(close_code::REPLACED, "replaced by a newer connection");
    }
    let _registration = Registration {
        registry: Arc::clone(&registry),
        user: user.clone(),
        device: device.clone(),
        handle: handle.clone(),
    };

    let connected = WsMessage::Text(ServerFrame::connected(&device).to_json());
    match send_or_cancel(&mut sink, connected, &cancel).await {
        Ok(()) => {}
        Err(Interrupted::Failed) => return SessionEnd::ForwardFailed,
        Err(Interrupted::Cancelled) => return SessionEnd::Cancelled,
    }
    info!(
        "user {user} device {device}: session started ({} device(s) online)",
        registry.list_devices(&user).len()
    );

    let inbound = tokio::spawn(inbound_relay(
        sink,
        direct_rx,
        subscription,
        device.clone(),
        cancel.clone(),
    ));
    let outbound = tokio::spawn(outbound_relay(
        stream,
        OutboundRelay {
            user: user.clone(),
            device: device.clone(),
            bus,
            handle,
        },
        cancel,
    ));

    let (inbound_end, outbound_end) = tokio::join!(inbound, outbound);
    let end = SessionEnd::cause(joined(inbound_end), joined(outbound_end));

    info!("user {user} device {device}: session ended: {end:?}");
    end
}

// ── Inbound relay: bus and direct queue → device ──────────────────────────────

async fn inbound_relay<Si>(
    mut sink: Si,
    mut direct_rx: mpsc::Receiver<OutboundFrame>,
    mut subscription: Subscription,
    device: DeviceId,
    cancel: CancellationToken,
) -> SessionEnd
where
    Si: Sink<WsMessage> + Unpin + Send,
{
    let _guard = cancel.clone().drop_guard();

    loop {
        tokio::select! {
            biased;

            frame = direct_rx.recv() => match frame {
                Some(OutboundFrame::Text(text)) => {
                    match send_or_cancel(&mut sink, WsMessage::Text(text), &cancel).await {
                        Ok(()) | Err(Interrupted::Cancelled) => {}
                        Err(Interrupted::Failed) => return SessionEnd::ForwardFailed,
                    }
                }
                Some(OutboundFrame::Close { code, reason }) => {
                    close_sink(&mut sink, code, &reason).await;
                    return SessionEnd::ClosedByServer { code };
                }
                None => return SessionEnd::Cancelled,
            },

            () = cancel.cancelled() => {
                let _ = timeout(CLOSE_WRITE_TIMEOUT, sink.close()).await;
                return SessionEnd::Cancelled;
            }

            next = subscription.next() => match next {
                Some(Ok(payload)) => match delivery_for(&payload, &device) {
                    Delivery::Forward => {
                        match send_or_cancel(&mut sink, WsMessage::Text(payload), &cancel).await {
                            Ok(()) => {}
                            Err(Interrupted::Cancelled) => {
                                debug!("device {device}: write interrupted by cancellation");
                            }
                            Err(Interrupted::Failed) => {
                                debug!("device {device}: send failed (device disconnected)");
                                return SessionEnd::ForwardFailed;
                            }
                        }
                    }
                    Delivery::SuppressEcho => {
                        debug!("device {device}: suppressed own echo");
                    }
                },
                Some(Err(e)) => {
                    warn!("device {device}: event bus error: {e}");
                    close_sink(&mut sink, close_code::INTERNAL_ERROR, "event bus failure").await;
                    return SessionEnd::BusFailed(e.to_string());
                }
                None => {
                    warn!("device {device}: event bus subscription ended");
                    close_sink(&mut sink, close_code::INTERNAL_ERROR, "event bus closed").await;
                    return SessionEnd::BusClosed;
                }
            },
        }
    }
}

// ── Outbound relay: device → bus ──────────────────────────────────────────────

struct OutboundRelay {
    user: UserId,
    device: DeviceId,
    bus: Arc<dyn EventBus>,
    handle: ConnectionHandle,
}

async fn outbound_relay<St>(
    mut stream: St,
    relay: OutboundRelay,
    cancel: CancellationToken,
) -> SessionEnd
where
    St: Stream<Item = Result<WsMessage, WsError>> + Unpin + Send,
{
    let _guard = cancel.clone().drop_guard();
    let OutboundRelay {
        user,
        device,
        bus,
        handle,
    } = relay;

    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => return SessionEnd::Cancelled,
            next = stream.next() => next,
        };

        let text = match message {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Binary(_))) => {
                return reject_malformed(&handle, &device, &FrameError::Binary);
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                debug!("device {device}: closed by device");
                return SessionEnd::DeviceClosed;
            }
            // Protocol-level ping/pong is answered by tungstenite itself.
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
            Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) => {
                debug!("device {device}: connection dropped");
                return SessionEnd::DeviceClosed;
            }
            Some(Err(e)) => {
                warn!("device {device}: WebSocket error: {e}");
                return SessionEnd::Transport(e.to_string());
            }
        };

        match DeviceFrame::parse(&text) {
            Ok(DeviceFrame::Ping) => {
                let pong = OutboundFrame::Text(ServerFrame::Pong.to_json());
                // The queue fills up when the device stops reading.
                let queued = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return SessionEnd::Cancelled,
                    queued = handle.send(pong) => queued,
                };
                if queued.is_err() {
                    return SessionEnd::Cancelled;
                }
            }
            Ok(DeviceFrame::Relay(frame)) => {
                debug!("user {user} device {device}: relaying {}", frame.kind());
                let published = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return SessionEnd::Cancelled,
                    published = bus.publish(&user, frame.stamped(&device)) => published,
                };
                if let Err(e) = published {
                    warn!("user {user} device {device}: publish failed: {e}");
                    let _ = handle.try_send(OutboundFrame::close(
                        close_code::INTERNAL_ERROR,
                        "event bus failure",
                    ));
                    return SessionEnd::BusFailed(e.to_string());
                }
            }
            Err(e) => return reject_malformed(&handle, &device, &e),
        }
    }
}

fn reject_malformed(handle: &ConnectionHandle, device: &DeviceId, reason: &FrameError) -> SessionEnd {
    warn!("device {device}: malformed frame: {reason}");
    let _ = handle.try_send(OutboundFrame::close(
        close_code::INVALID_PAYLOAD,
        "malformed frame",
    ));
    SessionEnd::MalformedFrame(reason.to_string())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Why a write to the device did not complete.
enum Interrupted {
    /// The sink reported an error.
    Failed,
    /// The session was cancelled while the write was pending.
    Cancelled,
}

/// Writes one frame unless the session is cancelled first.
///
/// The inbound relay treats [`Interrupted::Cancelled`] as "go round the loop
/// again": a queued close request is then written under
/// [`CLOSE_WRITE_TIMEOUT`], otherwise the cancellation arm ends the relay.
async fn send_or_cancel<Si>(
    sink: &mut Si,
    message: WsMessage,
    cancel: &CancellationToken,
) -> Result<(), Interrupted>
where
    Si: Sink<WsMessage> + Unpin,
{
    tokio::select! {
        biased;
        result = sink.send(message) => result.map_err(|_| Interrupted::Failed),
        () = cancel.cancelled() => Err(Interrupted::Cancelled),
    }
}

/// Best-effort close frame followed by closing the sink, bounded in time.
async fn close_sink<Si>(sink: &mut Si, code: u16, reason: &str)
where
    Si: Sink<WsMessage> + Unpin,
{
    let close = async {
        let _ = sink.send(close_message(code, reason)).await;
        let _ = sink.close().await;
    };
    if timeout(CLOSE_WRITE_TIMEOUT, close).await.is_err() {
        debug!("close frame {code} not written within {CLOSE_WRITE_TIMEOUT:?}");
    }
}

/// Removes the session's registry entry when dropped.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    user: UserId,
    device: DeviceId,
    handle: ConnectionHandle,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry
            .unregister(&self.user, &self.device, &self.handle);
    }
}

/// A close frame with an application close code.
pub fn close_message(code: u16, reason: &str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

fn joined(result: Result<SessionEnd, tokio::task::JoinError>) -> SessionEnd {
    result.unwrap_or_else(|e| SessionEnd::TaskFailed(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
