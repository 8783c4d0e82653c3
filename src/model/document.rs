//! Documents and stored-file records produced alongside child items.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A derived record persisted for each produced child item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub job_id: String,
    pub document_id: String,
    /// The data being stored, e.g. the child's subtree.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Source/destination context for the data.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Document {
    /// New document with a freshly generated id.
    pub fn new(
        job_id: impl Into<String>,
        data: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            document_id: Uuid::new_v4().to_string(),
            data,
            metadata,
        }
    }
}

/// Where and how a blob was stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStoreInfo {
    /// Total bytes stored.
    pub size: u64,
    /// Offset within the storage area. Zero unless the blob was appended
    /// to something else.
    pub offset: u64,
    /// Where the blob lives (`area:/path` or a filesystem path).
    pub path: String,
    /// Uppercase hex MD5 of the stored bytes.
    pub md5: String,
}
