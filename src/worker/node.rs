//! Splits a tree node into one item per direct child.

use async_trait::async_trait;

use super::WorkerUnit;
use crate::error::Result;
use crate::model::{Metadata, NodePayload, TreeWorkItem};

/// Accepts every tree item. Leaves, and items without a node, yield nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeWorker;

impl NodeWorker {
    pub const NAME: &'static str = "NodeWorker";
}

#[async_trait]
impl WorkerUnit<NodePayload, Metadata> for NodeWorker {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn accepts(&self, _item: &TreeWorkItem) -> bool {
        true
    }

    async fn process(&self, item: &TreeWorkItem) -> Result<Vec<TreeWorkItem>> {
        let Some(node) = item.payload.root.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(node
            .children()
            .iter()
            .map(|child| item.child(NodePayload::new(child.clone())))
            .collect())
    }
}
