//! Document rows, keyed by (collection, document_id).

use crate::error::Result;
use crate::model::Document;

impl super::Db {
    /// Insert a document into a collection. Re-inserting an id overwrites it.
    pub async fn insert_document(&self, collection: &str, document: &Document) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (collection, document_id, job_id, data, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, now())
             ON CONFLICT (collection, document_id)
             DO UPDATE SET job_id = EXCLUDED.job_id, data = EXCLUDED.data, metadata = EXCLUDED.metadata",
        )
        .bind(collection)
        .bind(&document.document_id)
        .bind(&document.job_id)
        .bind(&document.data)
        .bind(&document.metadata)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fetch a document by id.
    pub async fn fetch_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<Document>> {
        let row: Option<DocumentRow> = sqlx::query_as(
            "SELECT job_id, document_id, data, metadata FROM documents
             WHERE collection = $1 AND document_id = $2",
        )
        .bind(collection)
        .bind(document_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(Document::from))
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct DocumentRow {
    job_id: String,
    document_id: String,
    data: serde_json::Value,
    metadata: serde_json::Value,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Self {
            job_id: row.job_id,
            document_id: row.document_id,
            data: row.data,
            metadata: row.metadata,
        }
    }
}
