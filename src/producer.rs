//! Job submission.

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Metadata, NodePayload, TreeNode, TreeWorkItem, WorkData, WorkItem};
use crate::queue::{ROOT_PRIORITY, WorkQueue, publish_message};

/// Publishes root items for new jobs.
#[derive(Clone)]
pub struct Producer {
    queue: Arc<dyn WorkQueue>,
    in_queue: String,
}

impl Producer {
    pub fn new(queue: Arc<dyn WorkQueue>, in_queue: impl Into<String>) -> Self {
        Self {
            queue,
            in_queue: in_queue.into(),
        }
    }

    /// Publish an unregistered root item. The dispatcher that receives it
    /// registers it against its job.
    pub async fn submit<P: WorkData, M: WorkData>(&self, item: &WorkItem<P, M>) -> Result<i64> {
        publish_message(self.queue.as_ref(), &self.in_queue, item, ROOT_PRIORITY).await
    }

    /// Submit `root` as a new job, generating a job id when none is given.
    /// Returns the job id.
    pub async fn submit_tree(
        &self,
        job_id: Option<String>,
        root: TreeNode,
        metadata: Metadata,
    ) -> Result<String> {
        let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let nodes = root.node_count();
        let item = TreeWorkItem::root(job_id.clone(), NodePayload::new(root), metadata);
        let msg_id = self.submit(&item).await?;
        info!(job_id = %job_id, msg_id, nodes, queue = %self.in_queue, "submitted job");
        Ok(job_id)
    }
}
