//! Event bus bridge: one broadcast topic per user on a publish/subscribe medium.
//!
//! Producers (HTTP handlers, device sessions) call [`EventBus::publish`];
//! consumers (device sessions) hold a [`Subscription`].  Neither side knows
//! about the other, and the topics belong to the medium, not to this process,
//! so publishing and subscribing need no in-process locking.
//!
//! # Delivery contract
//!
//! - Fire-and-forget: a publish with no live subscriber is not an error and
//!   the event is simply gone.
//! - No backlog: a subscription sees only events published after it was
//!   created.  Re-subscribing loses whatever was published in the gap.
//! - FIFO per publisher: successive publishes from one producer reach each
//!   subscriber in order; there is no global order across producers.
//! - A subscription that ends or yields an error means the medium is gone for
//!   that session; the session tears down rather than degrading to one-way.

mod memory;
#[cfg(feature = "redis")]
mod redis_bus;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::stream::{BoxStream, Stream};
use thiserror::Error;

use crate::domain::ids::UserId;

pub use memory::{MemoryBus, DEFAULT_TOPIC_CAPACITY};
#[cfg(feature = "redis")]
pub use redis_bus::RedisBus;

/// Errors reported by an event bus backend.
#[derive(Debug, Error)]
pub enum BusError {
    /// The subscriber could not keep up and the medium dropped events for it.
    #[error("subscriber fell behind and missed {0} event(s)")]
    Lagged(u64),

    /// The medium is no longer reachable.
    #[error("event bus closed")]
    Closed,

    /// `connect` was given a URL whose scheme no backend handles.
    #[error("unsupported event bus URL: {0}")]
    UnsupportedUrl(String),

    /// An error from the Redis client.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Topic name for a user's channel on the medium.
///
/// Shared with other producers of the same deployment (for example HTTP
/// workers in another language publishing straight to Redis), so the format is
/// part of the wire contract.
pub fn topic_for(user: &UserId) -> String {
    format!("user:{user}")
}

/// A per-user broadcast medium.
///
/// Implementations must be cheap to share behind an `Arc<dyn EventBus>`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Hands a serialized event to the user's topic.
    ///
    /// Returns once the medium has accepted the event; says nothing about
    /// whether any subscriber received it.
    async fn publish(&self, user: &UserId, payload: String) -> Result<(), BusError>;

    /// Starts receiving events published to the user's topic from now on.
    async fn subscribe(&self, user: &UserId) -> Result<Subscription, BusError>;
}

/// A live subscription to one user's topic.
///
/// Yields payloads in publish order.  The stream ends when the medium goes
/// away.  Dropping the subscription, or calling [`Subscription::unsubscribe`],
/// releases it.
pub struct Subscription {
    stream: Option<BoxStream<'static, Result<String, BusError>>>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps a backend's payload stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<String, BusError>> + Send + 'static,
    {
        Self {
            stream: Some(Box::pin(stream)),
            on_release: None,
        }
    }

    /// Registers a hook that runs once, after the stream has been dropped.
    pub fn with_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    /// Releases the subscription.
    ///
    /// Consumes the handle, so it cannot be released twice.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        // Drop the backend stream first so the release hook sees the medium
        // without this subscriber.
        self.stream = None;
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl Stream for Subscription {
    type Item = Result<String, BusError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.stream.as_mut() {
            Some(stream) => stream.as_mut().poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.stream.is_some())
            .finish()
    }
}

/// Opens the bus named by `url`.
///
/// | URL            | Backend |
/// |----------------|---------|
/// | `memory://`    | [`MemoryBus`], single process only |
/// | `redis://...`  | [`RedisBus`] (cargo feature `redis`) |
///
/// # Errors
///
/// [`BusError::UnsupportedUrl`] for any other scheme, or the backend's
/// connection error.
pub async fn connect(url: &str) -> Result<Arc<dyn EventBus>, BusError> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryBus::new()));
    }

    #[cfg(feature = "redis")]
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        return Ok(Arc::new(RedisBus::connect(url).await?));
    }

    Err(BusError::UnsupportedUrl(url.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
