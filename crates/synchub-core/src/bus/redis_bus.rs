//! Redis PUB/SUB backend.
//!
//! Publishing goes through one shared multiplexed connection.  Each
//! subscription opens its own PUB/SUB connection, subscribed to exactly one
//! channel; dropping the subscription drops that connection, which is how
//! Redis learns the subscriber is gone.  When the server closes the
//! connection the message stream ends and the owning session tears down.
//!
//! Payloads that are not valid UTF-8 are still forwarded, with invalid
//! sequences replaced, since devices only accept text frames.

use std::borrow::Cow;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{topic_for, BusError, EventBus, Subscription};
use crate::domain::ids::UserId;

/// [`EventBus`] backed by a Redis server.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisBus {
    /// Connects to `url` (`redis://host:port/db` or `rediss://...`).
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        debug!("redis bus connected to {url}");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, user: &UserId, payload: String) -> Result<(), BusError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(topic_for(user), payload).await?;
        debug!("redis publish to user {user} reached {receivers} subscriber(s)");
        Ok(())
    }

    async fn subscribe(&self, user: &UserId) -> Result<Subscription, BusError> {
        let topic = topic_for(user);
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&topic).await?;

        let stream = pubsub
            .into_on_message()
            .map(|msg| Ok(payload_text(msg.get_payload_bytes(), msg.get_channel_name())));

        Ok(Subscription::new(stream))
    }
}

fn payload_text(bytes: &[u8], channel: &str) -> String {
    let text = String::from_utf8_lossy(bytes);
    if let Cow::Owned(_) = text {
        warn!("payload on {channel} is not valid UTF-8; forwarding with replacements");
    }
    text.into_owned()
}
