//! Document persistence for derived records.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::db::Db;
use crate::error::Result;
use crate::model::Document;

pub const DEFAULT_COLLECTION: &str = "documents";

/// Collection-scoped document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Collection used by [`add_document`](Self::add_document) and
    /// [`retrieve_document`](Self::retrieve_document).
    fn default_collection(&self) -> &str;

    /// Insert or overwrite a document in `collection`.
    async fn add_document_to(&self, collection: &str, document: &Document) -> Result<()>;

    async fn retrieve_document_from(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<Document>>;

    async fn add_document(&self, document: &Document) -> Result<()> {
        self.add_document_to(self.default_collection(), document)
            .await
    }

    async fn retrieve_document(&self, document_id: &str) -> Result<Option<Document>> {
        self.retrieve_document_from(self.default_collection(), document_id)
            .await
    }
}

/// Documents held in process memory, grouped by collection.
pub struct MemoryDocumentStore {
    collection: String,
    collections: Mutex<HashMap<String, HashMap<String, Document>>>,
}

impl MemoryDocumentStore {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// Number of documents in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .map_or(0, HashMap::len)
    }

    /// All documents in `collection` belonging to `job_id`.
    pub fn documents_for_job(&self, collection: &str, job_id: &str) -> Vec<Document> {
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| doc.job_id == job_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new(DEFAULT_COLLECTION)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn default_collection(&self) -> &str {
        &self.collection
    }

    async fn add_document_to(&self, collection: &str, document: &Document) -> Result<()> {
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(collection.to_string())
            .or_default()
            .insert(document.document_id.clone(), document.clone());
        Ok(())
    }

    async fn retrieve_document_from(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<Document>> {
        Ok(self
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .and_then(|docs| docs.get(document_id))
            .cloned())
    }
}

/// Documents in the Postgres `documents` table.
pub struct PgDocumentStore {
    db: Arc<Db>,
    collection: String,
}

impl PgDocumentStore {
    pub fn new(db: Arc<Db>, collection: impl Into<String>) -> Self {
        Self {
            db,
            collection: collection.into(),
        }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    fn default_collection(&self) -> &str {
        &self.collection
    }

    async fn add_document_to(&self, collection: &str, document: &Document) -> Result<()> {
        self.db.insert_document(collection, document).await
    }

    async fn retrieve_document_from(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<Document>> {
        self.db.fetch_document(collection, document_id).await
    }
}
