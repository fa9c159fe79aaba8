use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};

use orbital_core::models::MetadataDocument;

/// Metadata documents stored as JSONB bodies, looked up by the `record_id`
/// value they carry.
#[derive(Clone)]
pub struct DocumentRepository {
    pool: PgPool,
}

fn decode_body(body: serde_json::Value) -> Result<MetadataDocument> {
    serde_json::from_value(body).context("Failed to decode metadata document")
}

impl DocumentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete-then-insert in one transaction. The advisory lock serialises
    /// concurrent writers for the same record id so neither can leave two
    /// documents behind.
    #[tracing::instrument(skip(self, document), fields(record_id = %document.record_id))]
    pub async fn replace(&self, document: &MetadataDocument) -> Result<u64> {
        let body = serde_json::to_value(document).context("Failed to encode metadata document")?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for document replace")?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&document.record_id)
            .execute(&mut *tx)
            .await
            .context("Failed to lock record id")?;

        let deleted = sqlx::query("DELETE FROM metadata_documents WHERE record_id = $1")
            .bind(&document.record_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete prior metadata documents")?
            .rows_affected();

        sqlx::query("INSERT INTO metadata_documents (record_id, body) VALUES ($1, $2)")
            .bind(&document.record_id)
            .bind(body)
            .execute(&mut *tx)
            .await
            .context("Failed to insert metadata document")?;

        tx.commit()
            .await
            .context("Failed to commit document replace")?;

        tracing::debug!(
            record_id = %document.record_id,
            replaced = deleted,
            "Metadata document stored"
        );

        Ok(deleted)
    }

    #[tracing::instrument(skip(self))]
    pub async fn find_by_record_id(&self, record_id: &str) -> Result<Option<MetadataDocument>> {
        let row = sqlx::query(
            r#"
            SELECT body
            FROM metadata_documents
            WHERE record_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch metadata document")?;

        row.map(|r| decode_body(r.try_get("body")?)).transpose()
    }

    #[tracing::instrument(skip(self, record_ids), fields(count = record_ids.len()))]
    pub async fn find_by_record_ids(
        &self,
        record_ids: &[String],
    ) -> Result<HashMap<String, MetadataDocument>> {
        if record_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT record_id, body
            FROM metadata_documents
            WHERE record_id = ANY($1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(record_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch metadata documents")?;

        let mut documents = HashMap::with_capacity(rows.len());
        for row in rows {
            let record_id: String = row.try_get("record_id")?;
            documents.insert(record_id, decode_body(row.try_get("body")?)?);
        }
        Ok(documents)
    }

    pub async fn count_by_record_id(&self, record_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM metadata_documents WHERE record_id = $1")
                .bind(record_id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to count metadata documents")?;
        Ok(count)
    }
}
