//! Work items and the envelopes they travel in.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::null_as_default;

/// Bounds a payload or metadata type needs to travel through the queue and
/// be shared between dispatcher tasks.
pub trait WorkData: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static {}

impl<T> WorkData for T where T: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static {}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// One unit of a job's tree, dispatched through the queue.
///
/// Field names are part of the wire format. Missing or `null` fields
/// deserialize to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "P: Deserialize<'de> + Default, M: Deserialize<'de> + Default"))]
pub struct WorkItem<P, M> {
    /// Shared by every descendant of the same root submission.
    #[serde(default, deserialize_with = "null_as_default")]
    pub job_id: String,

    /// Unit-specific data (e.g. one tree node).
    #[serde(default, deserialize_with = "null_as_default")]
    pub payload: P,

    /// Context copied unchanged to every descendant.
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: M,

    /// Already counted against the job. False only for externally
    /// submitted roots, which the dispatcher registers itself.
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_registered: bool,
}

impl<P, M> WorkItem<P, M> {
    /// A root item as a producer submits it: not yet registered.
    pub fn root(job_id: impl Into<String>, payload: P, metadata: M) -> Self {
        Self {
            job_id: job_id.into(),
            payload,
            metadata,
            is_registered: false,
        }
    }

    /// A child of `self` carrying `payload`, with the same job id and metadata.
    ///
    /// Children come back from worker units unregistered; the dispatcher
    /// flips the flag once the counter increment has landed.
    pub fn child(&self, payload: P) -> Self
    where
        M: Clone,
    {
        Self {
            job_id: self.job_id.clone(),
            payload,
            metadata: self.metadata.clone(),
            is_registered: false,
        }
    }

    /// Mark this item as counted.
    pub fn registered(mut self) -> Self {
        self.is_registered = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Body of every queue message: a priority hint plus the serialized item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEnvelope<T> {
    #[serde(default)]
    pub priority: u8,
    pub message: T,
}

/// Published to the fault queue when an item could not be processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "P: Deserialize<'de> + Default, M: Deserialize<'de> + Default"))]
pub struct FaultMessage<P, M> {
    /// The original item, already registered.
    pub message: WorkItem<P, M>,
    /// Rendered error that caused the fault.
    #[serde(default)]
    pub error: String,
    pub faulted_at: DateTime<Utc>,
}

impl<P, M> FaultMessage<P, M> {
    pub fn new(message: WorkItem<P, M>, error: impl Into<String>) -> Self {
        Self {
            message,
            error: error.into(),
            faulted_at: Utc::now(),
        }
    }
}
