//! Core data model.
//!
//! A work item is one node of a job's tree travelling through the queue. It
//! carries the job it belongs to, an opaque payload, cross-cutting metadata
//! copied to every descendant, and whether it has already been counted.

pub mod document;
pub mod job;
pub mod tree;
pub mod work;

pub use document::{Document, FileStoreInfo};
pub use job::JobRecord;
pub use tree::{Metadata, NodePayload, TreeNode, TreeWorkItem};
pub use work::{FaultMessage, QueueEnvelope, WorkData, WorkItem};

use serde::{Deserialize, Deserializer};

/// Deserialize `null` the same as an absent field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
