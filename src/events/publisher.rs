//! Broker collaborators used by the outbox relay.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tracing::debug;

use super::OutboxMessage;
use crate::config::PublisherConfig;
use crate::errors::ServiceError;

/// Publishes a relayed event. Implementations must return an error rather
/// than drop a message they could not hand to the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns the broker's identifier for the published message.
    async fn publish(&self, topic: &str, message: &OutboxMessage) -> Result<String, ServiceError>;
}

/// A message delivered through [`InMemoryPublisher`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub broker_message_id: String,
    pub topic: String,
    pub message: OutboxMessage,
}

/// Process-local broadcast bus. Publishing with no subscribers succeeds, as
/// with a broker topic nobody listens to.
#[derive(Debug)]
pub struct InMemoryPublisher {
    sender: broadcast::Sender<Delivery>,
    sequence: AtomicU64,
}

impl InMemoryPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.sender.subscribe()
    }
}

impl Default for InMemoryPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(&self, topic: &str, message: &OutboxMessage) -> Result<String, ServiceError> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let broker_message_id = format!("mem-{seq}");
        let receivers = self
            .sender
            .send(Delivery {
                broker_message_id: broker_message_id.clone(),
                topic: topic.to_string(),
                message: message.clone(),
            })
            .unwrap_or(0);
        debug!(topic, outbox_id = message.outbox_id, receivers, "published in-memory");
        Ok(broker_message_id)
    }
}

/// Redis `PUBLISH` on channel `{prefix}{topic}`.
#[derive(Clone)]
pub struct RedisPublisher {
    connection: ConnectionManager,
    channel_prefix: String,
}

impl RedisPublisher {
    pub async fn connect(config: &PublisherConfig) -> Result<Self, ServiceError> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| ServiceError::QueueError(format!("invalid redis url: {e}")))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| ServiceError::QueueError(format!("redis connection failed: {e}")))?;
        Ok(Self {
            connection,
            channel_prefix: config.channel_prefix.clone(),
        })
    }

    fn channel(&self, topic: &str) -> String {
        format!("{}{}", self.channel_prefix, topic)
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn publish(&self, topic: &str, message: &OutboxMessage) -> Result<String, ServiceError> {
        let body = serde_json::to_string(message)?;
        let channel = self.channel(topic);
        let mut conn = self.connection.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(|e| ServiceError::QueueError(format!("redis publish failed: {e}")))?;
        debug!(%channel, outbox_id = message.outbox_id, receivers, "published to redis");
        Ok(format!("redis:{channel}:{}", message.outbox_id))
    }
}
