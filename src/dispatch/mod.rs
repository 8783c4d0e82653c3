//! Queue consumers: the work dispatcher and the fault handler.
//!
//! Per delivered item the dispatcher moves through
//! `received → registered → dispatched → children_published → finalized`,
//! or `faulted` once anything fails after the item has been counted. A
//! faulted item goes to the fault queue, where the [`FaultHandler`]
//! completes it so the job can still drain.

pub mod dispatcher;
pub mod fault;

pub use dispatcher::{DispatchOutcome, WorkDispatcher};
pub use fault::FaultHandler;

use opentelemetry::KeyValue;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::job::JobCounter;
use crate::telemetry::metrics;

pub const DEFAULT_IN_QUEUE: &str = "work_item";
pub const DEFAULT_FAULT_QUEUE: &str = "work_item_fault";

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Queue work items are consumed from and children are published to.
    pub in_queue: String,
    /// Queue faulted items are routed to.
    pub fault_queue: String,
    /// Blob area child payloads are written to.
    pub blob_area: String,
    /// Deliveries processed at once by [`WorkDispatcher::run`].
    pub max_concurrent: usize,
    /// Wait between polls when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            in_queue: DEFAULT_IN_QUEUE.to_string(),
            fault_queue: DEFAULT_FAULT_QUEUE.to_string(),
            blob_area: crate::store::blob::DEFAULT_AREA.to_string(),
            max_concurrent: 8,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Finalize `job_id` if it has drained. Returns whether this caller removed
/// the record. Failures are logged, never propagated: the item itself has
/// already been completed at this point.
pub(crate) async fn finalize_if_finished(
    counter: &dyn JobCounter,
    job_id: &str,
    path: &'static str,
) -> bool {
    match counter.is_finished(job_id).await {
        Ok(true) => {}
        Ok(false) => return false,
        Err(e) => {
            warn!(job_id, error = %e, "could not read job state");
            return false;
        }
    }

    match counter.finalize(job_id).await {
        Ok(true) => {
            info!(job_id, path, "job finished");
            metrics::jobs_finalized().add(1, &[KeyValue::new("path", path)]);
            true
        }
        Ok(false) => {
            debug!(job_id, "job already finalized");
            false
        }
        Err(e) => {
            warn!(job_id, error = %e, "finalize failed");
            false
        }
    }
}
