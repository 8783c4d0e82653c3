//! Per-job fan-out/fan-in completion counters.
//!
//! A job is finished when every registered work item has completed. The
//! counter is the only shared state between dispatchers: items never
//! reference each other, so the tree itself is never held in memory.
//!
//! Both backends expose the same contract:
//!
//! - [`JobCounter::register`] creates the record if absent and adds one.
//! - [`JobCounter::complete`] subtracts one; `JobNotFound` when the record
//!   is absent or already drained.
//! - [`JobCounter::is_finished`] is true when the record is absent or at zero.
//! - [`JobCounter::finalize`] removes a drained record, reporting whether
//!   this caller was the one that removed it.

pub mod local;
pub mod postgres;

pub use local::LocalJobCounter;
pub use postgres::PgJobCounter;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

/// Atomic outstanding-work counter keyed by job id.
#[async_trait]
pub trait JobCounter: Send + Sync {
    /// Short backend name for logs and metric labels.
    fn backend(&self) -> &'static str;

    /// Add one outstanding item, creating the record at zero first if needed.
    /// Returns the new pending count.
    async fn register(&self, job_id: &str) -> Result<i64>;

    /// Remove one outstanding item. Returns the new pending count.
    async fn complete(&self, job_id: &str) -> Result<i64>;

    /// True when no record exists or its pending count is zero.
    async fn is_finished(&self, job_id: &str) -> Result<bool>;

    /// Delete a drained record. Returns whether a record was removed.
    async fn finalize(&self, job_id: &str) -> Result<bool>;

    /// Current pending count, `None` when no record exists.
    async fn pending(&self, job_id: &str) -> Result<Option<i64>>;
}

/// Task-level facade over a [`JobCounter`] for external callers.
///
/// `task_id` is accepted for future per-task bookkeeping; state is keyed by
/// `job_id` only.
#[derive(Clone)]
pub struct JobManager {
    counter: Arc<dyn JobCounter>,
}

impl JobManager {
    pub fn new(counter: Arc<dyn JobCounter>) -> Self {
        Self { counter }
    }

    pub async fn add_task(&self, job_id: &str, _task_id: Option<&str>) -> Result<i64> {
        self.counter.register(job_id).await
    }

    pub async fn remove_task(&self, job_id: &str, _task_id: Option<&str>) -> Result<i64> {
        self.counter.complete(job_id).await
    }

    pub async fn is_job_finished(&self, job_id: &str) -> Result<bool> {
        self.counter.is_finished(job_id).await
    }

    pub async fn finish_job(&self, job_id: &str) -> Result<bool> {
        self.counter.finalize(job_id).await
    }

    pub fn counter(&self) -> &Arc<dyn JobCounter> {
        &self.counter
    }
}
