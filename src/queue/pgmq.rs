//! Queue backed by the Postgres `pgmq` extension.
//!
//! pgmq has no native priorities; the hint travels in the envelope only.
//! Acked messages are archived, not deleted, so they remain auditable.

use async_trait::async_trait;
use std::sync::Arc;

use super::{Delivery, QueueDepth, WorkQueue, unwrap, wrap};
use crate::db::Db;
use crate::error::Result;

pub struct PgmqQueue {
    db: Arc<Db>,
    /// Seconds a read message stays hidden before redelivery.
    visibility_timeout: i32,
}

impl PgmqQueue {
    pub fn new(db: Arc<Db>, visibility_timeout: i32) -> Self {
        Self {
            db,
            visibility_timeout,
        }
    }
}

#[async_trait]
impl WorkQueue for PgmqQueue {
    fn backend(&self) -> &'static str {
        "pgmq"
    }

    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.db.create_queue(queue).await
    }

    async fn publish(&self, queue: &str, body: serde_json::Value, priority: u8) -> Result<i64> {
        self.db.send_to_queue(queue, &wrap(body, priority)?).await
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>> {
        let Some(msg) = self
            .db
            .read_from_queue(queue, self.visibility_timeout)
            .await?
        else {
            return Ok(None);
        };

        // Bodies published without an envelope are passed through as-is and
        // left for the consumer to accept or reject.
        let (priority, body) = match unwrap(msg.message.clone()) {
            Ok(unwrapped) => unwrapped,
            Err(_) => (0, msg.message),
        };
        Ok(Some(Delivery {
            msg_id: msg.msg_id,
            read_count: msg.read_ct,
            priority,
            body,
        }))
    }

    async fn ack(&self, queue: &str, msg_id: i64) -> Result<()> {
        self.db.archive_message(queue, msg_id).await
    }

    async fn nack(&self, queue: &str, msg_id: i64) -> Result<()> {
        self.db.set_visibility(queue, msg_id, 0).await
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let (visible, total) = self.db.queue_metrics(queue).await?;
        let visible = visible.max(0) as u64;
        Ok(QueueDepth {
            visible,
            in_flight: (total.max(0) as u64).saturating_sub(visible),
        })
    }
}
