//! Job counter rows: single-statement atomic increment, decrement, delete.
//!
//! Every mutation is one round trip. Never read-modify-write from here;
//! concurrent dispatchers across the fleet hit the same rows.

use crate::error::{Error, Result};
use crate::model::JobRecord;

impl super::Db {
    /// Create the job row if absent, then add one. Returns the new count.
    pub async fn increment_job(&self, job_id: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO jobs (job_id, pending_count, created_at, updated_at)
             VALUES ($1, 1, now(), now())
             ON CONFLICT (job_id)
             DO UPDATE SET pending_count = jobs.pending_count + 1, updated_at = now()
             RETURNING pending_count",
        )
        .bind(job_id)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0)
    }

    /// Subtract one from an existing, non-drained job row.
    ///
    /// No row matched means the job was never registered, was already
    /// finalized, or is already at zero: all reported as `JobNotFound`.
    pub async fn decrement_job(&self, job_id: &str) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE jobs SET pending_count = pending_count - 1, updated_at = now()
             WHERE job_id = $1 AND pending_count > 0
             RETURNING pending_count",
        )
        .bind(job_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|r| r.0)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    /// Fetch a job row, if any.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let record: Option<JobRecord> = sqlx::query_as(
            "SELECT job_id, pending_count, created_at, updated_at FROM jobs WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(record)
    }

    /// Delete a drained job row. Returns whether a row was removed.
    pub async fn delete_drained_job(&self, job_id: &str) -> Result<bool> {
        let rows_affected = sqlx::query("DELETE FROM jobs WHERE job_id = $1 AND pending_count = 0")
            .bind(job_id)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(rows_affected == 1)
    }
}
