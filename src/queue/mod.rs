//! Message queue abstraction.
//!
//! Delivery is at-least-once: a received message stays in flight until it is
//! acked; a nack or an expired visibility timeout makes it visible again.
//! Message bodies are JSON; each is wrapped in a [`QueueEnvelope`] carrying
//! the publisher's priority hint.
//!
//! - [`MemoryQueue`]: in-process, priority ordered (tests, single node)
//! - [`PgmqQueue`]: Postgres `pgmq` extension (production)

pub mod memory;
pub mod pgmq;

pub use memory::MemoryQueue;
pub use pgmq::PgmqQueue;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::model::QueueEnvelope;

/// Priority for externally submitted roots.
pub const ROOT_PRIORITY: u8 = 1;
/// Priority for child items; children drain ahead of new roots.
pub const CHILD_PRIORITY: u8 = 2;

/// A message handed to one consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue-assigned id used to ack or nack.
    pub msg_id: i64,
    /// How many times this message has been handed out, including this one.
    pub read_count: i32,
    pub priority: u8,
    /// The message body (envelope already removed).
    pub body: serde_json::Value,
}

impl Delivery {
    /// Deserialize the body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// More than one delivery of the same message.
    pub fn is_redelivery(&self) -> bool {
        self.read_count > 1
    }
}

/// Queue depth information for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Messages available for delivery.
    pub visible: u64,
    /// Messages delivered but not yet acked.
    pub in_flight: u64,
}

impl QueueDepth {
    pub fn is_empty(&self) -> bool {
        self.visible == 0 && self.in_flight == 0
    }
}

/// Trait for queue backends.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Create the named queue if it does not exist.
    async fn ensure_queue(&self, queue: &str) -> Result<()>;

    /// Publish a body with a priority hint. Returns the message id.
    async fn publish(&self, queue: &str, body: serde_json::Value, priority: u8) -> Result<i64>;

    /// Take the next visible message, if any, and hide it until acked.
    async fn receive(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Acknowledge a message: it will not be delivered again.
    async fn ack(&self, queue: &str, msg_id: i64) -> Result<()>;

    /// Return a message for redelivery.
    async fn nack(&self, queue: &str, msg_id: i64) -> Result<()>;

    async fn depth(&self, queue: &str) -> Result<QueueDepth>;
}

/// Serialize `message` and publish it.
pub async fn publish_message<T: Serialize + Sync>(
    queue: &dyn WorkQueue,
    name: &str,
    message: &T,
    priority: u8,
) -> Result<i64> {
    let body = serde_json::to_value(message)?;
    queue.publish(name, body, priority).await
}

pub(crate) fn wrap(body: serde_json::Value, priority: u8) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(QueueEnvelope {
        priority,
        message: body,
    })?)
}

pub(crate) fn unwrap(raw: serde_json::Value) -> Result<(u8, serde_json::Value)> {
    let envelope: QueueEnvelope<serde_json::Value> = serde_json::from_value(raw)?;
    Ok((envelope.priority, envelope.message))
}
