//! Postgres-backed job counter for multi-node deployments.
//!
//! Survives process restarts and is shared by every dispatcher in the fleet.
//! Each operation is a single atomic statement (see `db::jobs`).

use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{debug, info};

use super::JobCounter;
use crate::db::Db;
use crate::error::Result;
use crate::telemetry::metrics;

pub struct PgJobCounter {
    db: Arc<Db>,
}

impl PgJobCounter {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobCounter for PgJobCounter {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn register(&self, job_id: &str) -> Result<i64> {
        let pending = self.db.increment_job(job_id).await?;
        metrics::jobs_registered().add(1, &[KeyValue::new("backend", "postgres")]);
        debug!(job_id, pending, "registered task");
        Ok(pending)
    }

    async fn complete(&self, job_id: &str) -> Result<i64> {
        let pending = self.db.decrement_job(job_id).await?;
        metrics::jobs_completed().add(1, &[KeyValue::new("backend", "postgres")]);
        debug!(job_id, pending, "completed task");
        Ok(pending)
    }

    async fn is_finished(&self, job_id: &str) -> Result<bool> {
        Ok(self
            .db
            .get_job(job_id)
            .await?
            .is_none_or(|record| record.is_drained()))
    }

    async fn finalize(&self, job_id: &str) -> Result<bool> {
        let removed = self.db.delete_drained_job(job_id).await?;
        if removed {
            info!(job_id, "removed job record");
        }
        Ok(removed)
    }

    async fn pending(&self, job_id: &str) -> Result<Option<i64>> {
        Ok(self.db.get_job(job_id).await?.map(|record| record.pending_count))
    }
}
