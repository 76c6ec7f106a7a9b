//! In-process event bus built on `tokio::sync::broadcast`.
//!
//! One broadcast channel per topic, created on first subscription and removed
//! when its last subscription is released, so idle users cost nothing.  A
//! publish to a topic nobody is subscribed to is dropped on the floor, exactly
//! like a Redis `PUBLISH` with zero receivers.
//!
//! This backend is only shared between sessions of the same process.  Run
//! several relay processes behind a load balancer and you need the Redis
//! backend instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use super::{topic_for, BusError, EventBus, Subscription};
use crate::domain::ids::UserId;

/// Per-topic buffer.  A subscriber more than this many events behind the
/// newest one gets [`BusError::Lagged`] and its session is torn down.
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// In-process [`EventBus`].  Clones share the same topics.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl Inner {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<String>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops the topic once no receiver is left on it.
    fn release(&self, topic: &str) {
        let mut topics = self.topics();
        if topics.get(topic).is_some_and(|tx| tx.receiver_count() == 0) {
            topics.remove(topic);
            debug!("memory bus: topic {topic} removed (no subscribers)");
        }
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                // broadcast::channel panics on zero capacity.
                capacity: capacity.max(1),
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.inner.topics().len()
    }

    /// Number of live subscriptions on `user`'s topic.
    pub fn subscriber_count(&self, user: &UserId) -> usize {
        self.inner
            .topics()
            .get(&topic_for(user))
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Closes every topic, ending all live subscriptions.
    ///
    /// This is what a lost connection to an external medium looks like to a
    /// session; the relay uses it on shutdown and tests use it to exercise the
    /// teardown path.
    pub fn close_all(&self) {
        self.inner.topics().clear();
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, user: &UserId, payload: String) -> Result<(), BusError> {
        let topics = self.inner.topics();
        if let Some(tx) = topics.get(&topic_for(user)) {
            // Err only means "no receivers right now", which is not a failure.
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, user: &UserId) -> Result<Subscription, BusError> {
        let topic = topic_for(user);
        let rx = {
            let mut topics = self.inner.topics();
            topics
                .entry(topic.clone())
                .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
                .subscribe()
        };

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(payload) => Some((Ok(payload), rx)),
                Err(RecvError::Lagged(missed)) => Some((Err(BusError::Lagged(missed)), rx)),
                Err(RecvError::Closed) => None,
            }
        });

        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(stream).with_release(move || inner.release(&topic)))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn alice() -> UserId {
        UserId::new("alice")
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_payload() {
        // Arrange
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe(&alice()).await.unwrap();

        // Act
        bus.publish(&alice(), r#"{"type":"text"}"#.to_string())
            .await
            .unwrap();

        // Assert
        assert_eq!(sub.next().await.unwrap().unwrap(), r#"{"type":"text"}"#);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_not_an_error() {
        let bus = MemoryBus::new();
        assert!(bus.publish(&alice(), "{}".to_string()).await.is_ok());
        assert_eq!(bus.topic_count(), 0, "publishing must not create topics");
    }

    #[tokio::test]
    async fn test_subscription_sees_no_backlog() {
        let bus = MemoryBus::new();
        // A first subscriber keeps the topic alive.
        let _keepalive = bus.subscribe(&alice()).await.unwrap();
        bus.publish(&alice(), "before".to_string()).await.unwrap();

        let mut late = bus.subscribe(&alice()).await.unwrap();
        bus.publish(&alice(), "after".to_string()).await.unwrap();

        assert_eq!(late.next().await.unwrap().unwrap(), "after");
    }

    #[tokio::test]
    async fn test_single_publisher_order_is_preserved() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe(&alice()).await.unwrap();

        for i in 0..50 {
            bus.publish(&alice(), i.to_string()).await.unwrap();
        }

        for i in 0..50 {
            assert_eq!(sub.next().await.unwrap().unwrap(), i.to_string());
        }
    }

    #[tokio::test]
    async fn test_topics_are_isolated_per_user() {
        let bus = MemoryBus::new();
        let mut bob_sub = bus.subscribe(&UserId::new("bob")).await.unwrap();
        let _alice_sub = bus.subscribe(&alice()).await.unwrap();

        bus.publish(&alice(), "for alice".to_string()).await.unwrap();
        bus.publish(&UserId::new("bob"), "for bob".to_string())
            .await
            .unwrap();

        assert_eq!(bob_sub.next().await.unwrap().unwrap(), "for bob");
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_each_payload() {
        let bus = MemoryBus::new();
        let mut subs = Vec::new();
        for _ in 0..3 {
            subs.push(bus.subscribe(&alice()).await.unwrap());
        }

        bus.publish(&alice(), "fan-out".to_string()).await.unwrap();

        for sub in &mut subs {
            assert_eq!(sub.next().await.unwrap().unwrap(), "fan-out");
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_idle_topic() {
        let bus = MemoryBus::new();
        let first = bus.subscribe(&alice()).await.unwrap();
        let second = bus.subscribe(&alice()).await.unwrap();
        assert_eq!(bus.subscriber_count(&alice()), 2);

        first.unsubscribe();
        assert_eq!(bus.topic_count(), 1, "topic stays while a subscriber remains");

        drop(second);
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_lagged_error() {
        // Arrange: a tiny buffer and a subscriber that never reads
        let bus = MemoryBus::with_capacity(2);
        let mut sub = bus.subscribe(&alice()).await.unwrap();

        // Act
        for i in 0..5 {
            bus.publish(&alice(), i.to_string()).await.unwrap();
        }

        // Assert
        assert!(matches!(sub.next().await, Some(Err(BusError::Lagged(_)))));
    }

    #[tokio::test]
    async fn test_close_all_ends_live_subscriptions() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe(&alice()).await.unwrap();

        bus.close_all();

        assert!(sub.next().await.is_none());
    }
}
