//! Tree payloads: the shape the node worker splits.

use serde::{Deserialize, Serialize};

use super::{WorkItem, null_as_default};

/// One node of a string-valued tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    #[serde(default, deserialize_with = "null_as_default")]
    pub value: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

impl TreeNode {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            children: None,
        }
    }

    pub fn add_child(&mut self, child: TreeNode) {
        self.children.get_or_insert_with(Vec::new).push(child);
    }

    pub fn with_child(mut self, child: TreeNode) -> Self {
        self.add_child(child);
        self
    }

    /// Direct children; empty for a leaf.
    pub fn children(&self) -> &[TreeNode] {
        self.children.as_deref().unwrap_or_default()
    }

    pub fn is_leaf(&self) -> bool {
        self.children().is_empty()
    }

    /// Number of nodes in the subtree rooted here, including this one.
    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(TreeNode::node_count).sum::<usize>()
    }

    /// Number of leaves in the subtree rooted here.
    pub fn leaf_count(&self) -> usize {
        if self.is_leaf() {
            1
        } else {
            self.children().iter().map(TreeNode::leaf_count).sum()
        }
    }

    /// A complete tree with `depth` levels where every inner node has
    /// `fanout` children. Values are dotted paths from the root ("0.1.0").
    pub fn balanced(depth: u32, fanout: usize) -> Self {
        fn build(value: String, remaining: u32, fanout: usize) -> TreeNode {
            let mut node = TreeNode::new(value.clone());
            if remaining > 1 {
                for i in 0..fanout {
                    node.add_child(build(format!("{value}.{i}"), remaining - 1, fanout));
                }
            }
            node
        }
        build("0".to_string(), depth.max(1), fanout)
    }
}

/// Payload of a tree work item: the subtree still to be split.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePayload {
    #[serde(default)]
    pub root: Option<TreeNode>,
}

impl NodePayload {
    pub fn new(root: TreeNode) -> Self {
        Self { root: Some(root) }
    }
}

/// Where a job's source lives and where results should go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub result_bucket: Option<String>,
    #[serde(default)]
    pub result_prefix: Option<String>,
}

pub type TreeWorkItem = WorkItem<NodePayload, Metadata>;
