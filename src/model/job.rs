//! Job counter records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outstanding-work counter for one job.
///
/// `pending_count` is the number of registered items that have not yet
/// finished processing. The record is deleted once the job is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub job_id: String,
    pub pending_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn is_drained(&self) -> bool {
        self.pending_count == 0
    }
}
