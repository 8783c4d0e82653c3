//! In-process job counter for single-node deployments.
//!
//! Counts live in atomics behind a read/write lock on the job map.
//! Increments and decrements run under the shared read lock, so they never
//! block each other; only record creation and removal take the write lock.
//! That also means a removal can never race with an increment onto a slot
//! that is about to disappear.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use super::JobCounter;
use crate::error::{Error, Result};
use crate::telemetry::metrics;

struct JobSlot {
    pending: AtomicI64,
    created_at: DateTime<Utc>,
}

impl JobSlot {
    fn new() -> Self {
        Self {
            pending: AtomicI64::new(0),
            created_at: Utc::now(),
        }
    }

    fn increment(&self) -> i64 {
        self.pending.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement unless already drained. `None` when at zero.
    fn decrement(&self) -> Option<i64> {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return None;
            }
            match self.pending.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current - 1),
                Err(actual) => current = actual,
            }
        }
    }

    fn load(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }
}

/// Job counter held in process memory. Lost on restart.
#[derive(Default)]
pub struct LocalJobCounter {
    jobs: RwLock<HashMap<String, JobSlot>>,
}

impl LocalJobCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of job records currently held.
    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// When the job's record was created, if it exists.
    pub fn created_at(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .map(|slot| slot.created_at)
    }
}

#[async_trait]
impl JobCounter for LocalJobCounter {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn register(&self, job_id: &str) -> Result<i64> {
        let existing = {
            let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
            jobs.get(job_id).map(JobSlot::increment)
        };

        let pending = match existing {
            Some(pending) => pending,
            None => {
                let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
                jobs.entry(job_id.to_string())
                    .or_insert_with(JobSlot::new)
                    .increment()
            }
        };

        metrics::jobs_registered().add(1, &[KeyValue::new("backend", "local")]);
        debug!(job_id, pending, "registered task");
        Ok(pending)
    }

    async fn complete(&self, job_id: &str) -> Result<i64> {
        let pending = {
            let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
            jobs.get(job_id).and_then(JobSlot::decrement)
        }
        .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        metrics::jobs_completed().add(1, &[KeyValue::new("backend", "local")]);
        debug!(job_id, pending, "completed task");
        Ok(pending)
    }

    async fn is_finished(&self, job_id: &str) -> Result<bool> {
        Ok(self.pending(job_id).await?.is_none_or(|pending| pending == 0))
    }

    async fn finalize(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let drained = jobs.get(job_id).is_some_and(|slot| slot.load() == 0);
        if drained {
            jobs.remove(job_id);
        }
        Ok(drained)
    }

    async fn pending(&self, job_id: &str) -> Result<Option<i64>> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get(job_id).map(JobSlot::load))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn register_creates_record_and_counts_up() {
        let counter = LocalJobCounter::new();
        assert_eq!(counter.pending("job").await.unwrap(), None);

        assert_eq!(counter.register("job").await.unwrap(), 1);
        assert_eq!(counter.register("job").await.unwrap(), 2);
        assert_eq!(counter.pending("job").await.unwrap(), Some(2));
        assert!(counter.created_at("job").is_some());
    }

    #[tokio::test]
    async fn complete_without_record_is_job_not_found() {
        let counter = LocalJobCounter::new();
        let err = counter.complete("missing").await.unwrap_err();
        assert!(err.is_job_not_found(), "got {err:?}");
    }

    #[tokio::test]
    async fn complete_on_drained_record_is_job_not_found() {
        let counter = LocalJobCounter::new();
        counter.register("job").await.unwrap();
        assert_eq!(counter.complete("job").await.unwrap(), 0);

        let err = counter.complete("job").await.unwrap_err();
        assert!(err.is_job_not_found());
        assert_eq!(counter.pending("job").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn missing_record_counts_as_finished() {
        let counter = LocalJobCounter::new();
        assert!(counter.is_finished("never-seen").await.unwrap());
    }

    #[tokio::test]
    async fn finalize_removes_only_drained_records_once() {
        let counter = LocalJobCounter::new();
        counter.register("job").await.unwrap();

        assert!(!counter.finalize("job").await.unwrap());
        assert_eq!(counter.len(), 1);

        counter.complete("job").await.unwrap();
        assert!(counter.finalize("job").await.unwrap());
        assert!(!counter.finalize("job").await.unwrap());
        assert!(counter.is_empty());
        assert!(counter.is_finished("job").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registers_and_completes_balance_out() {
        let counter = Arc::new(LocalJobCounter::new());
        let n = 500;

        let mut handles = Vec::new();
        for _ in 0..n {
            let c = Arc::clone(&counter);
            handles.push(tokio::spawn(async move { c.register("job").await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(counter.pending("job").await.unwrap(), Some(n));

        let mut handles = Vec::new();
        for _ in 0..n {
            let c = Arc::clone(&counter);
            handles.push(tokio::spawn(async move { c.complete("job").await }));
        }
        let mut zeros = 0;
        for h in handles {
            if h.await.unwrap().unwrap() == 0 {
                zeros += 1;
            }
        }

        assert_eq!(zeros, 1, "exactly one completion observes zero");
        assert!(counter.is_finished("job").await.unwrap());
    }
}
