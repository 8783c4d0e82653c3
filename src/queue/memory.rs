//! In-process queue with priorities, in-flight tracking and redelivery.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{Delivery, QueueDepth, WorkQueue};
use crate::error::{Error, Result};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
struct Message {
    msg_id: i64,
    /// Publish order, for FIFO within a priority.
    seq: u64,
    priority: u8,
    read_count: i32,
    body: serde_json::Value,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Message {}

impl Ord for Message {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<Message>,
    in_flight: HashMap<i64, (Message, Instant)>,
}

impl QueueState {
    /// Move expired in-flight messages back to ready.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<i64> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((msg, _)) = self.in_flight.remove(&id) {
                self.ready.push(msg);
            }
        }
    }
}

#[derive(Default)]
struct Queues {
    next_id: i64,
    next_seq: u64,
    queues: HashMap<String, QueueState>,
}

/// Queue held in process memory.
pub struct MemoryQueue {
    visibility_timeout: Duration,
    inner: Mutex<Queues>,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            inner: Mutex::new(Queues::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.lock().queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, body: serde_json::Value, priority: u8) -> Result<i64> {
        let mut inner = self.lock();
        inner.next_id += 1;
        inner.next_seq += 1;
        let msg = Message {
            msg_id: inner.next_id,
            seq: inner.next_seq,
            priority,
            read_count: 0,
            body,
        };
        let msg_id = msg.msg_id;
        inner
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push(msg);
        drop(inner);

        metrics::record_queue_op(queue, "send");
        Ok(msg_id)
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>> {
        let now = Instant::now();
        let deadline = now + self.visibility_timeout;
        let delivery = {
            let mut inner = self.lock();
            let Some(state) = inner.queues.get_mut(queue) else {
                return Ok(None);
            };
            state.reclaim_expired(now);
            state.ready.pop().map(|mut msg| {
                msg.read_count += 1;
                let delivery = Delivery {
                    msg_id: msg.msg_id,
                    read_count: msg.read_count,
                    priority: msg.priority,
                    body: msg.body.clone(),
                };
                state.in_flight.insert(msg.msg_id, (msg, deadline));
                delivery
            })
        };

        metrics::record_queue_op(queue, if delivery.is_some() { "read" } else { "read_empty" });
        Ok(delivery)
    }

    async fn ack(&self, queue: &str, msg_id: i64) -> Result<()> {
        let removed = self
            .lock()
            .queues
            .get_mut(queue)
            .and_then(|state| state.in_flight.remove(&msg_id));
        if removed.is_none() {
            return Err(Error::Other(format!(
                "ack for unknown message {msg_id} on queue {queue}"
            )));
        }
        metrics::record_queue_op(queue, "ack");
        Ok(())
    }

    async fn nack(&self, queue: &str, msg_id: i64) -> Result<()> {
        {
            let mut inner = self.lock();
            let Some(state) = inner.queues.get_mut(queue) else {
                return Err(Error::Other(format!("nack on unknown queue {queue}")));
            };
            let Some((msg, _)) = state.in_flight.remove(&msg_id) else {
                return Err(Error::Other(format!(
                    "nack for unknown message {msg_id} on queue {queue}"
                )));
            };
            state.ready.push(msg);
        }
        metrics::record_queue_op(queue, "nack");
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let mut inner = self.lock();
        Ok(inner
            .queues
            .get_mut(queue)
            .map(|state| {
                state.reclaim_expired(Instant::now());
                QueueDepth {
                    visible: state.ready.len() as u64,
                    in_flight: state.in_flight.len() as u64,
                }
            })
            .unwrap_or_default())
    }
}
