use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use orbital_core::models::{ImageRecord, ImageStatus};

#[derive(Clone)]
pub struct ImageRecordRepository {
    pool: PgPool,
}

impl ImageRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        let record: Option<ImageRecord> = sqlx::query_as::<Postgres, ImageRecord>(
            r#"
            SELECT id, title, owner_id, status, created_at, updated_at
            FROM image_records
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch image record")?;

        Ok(record)
    }

    #[tracing::instrument(skip(self, record), fields(record_id = %record.id))]
    pub async fn create(&self, record: &ImageRecord) -> Result<ImageRecord> {
        let created: ImageRecord = sqlx::query_as::<Postgres, ImageRecord>(
            r#"
            INSERT INTO image_records (id, title, owner_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, title, owner_id, status, created_at, updated_at
            "#,
        )
        .bind(record.id)
        .bind(&record.title)
        .bind(record.owner_id)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert image record")?;

        tracing::info!(record_id = %created.id, "Image record created");
        Ok(created)
    }

    /// Conditional status write. The row lock taken by the CTE makes the
    /// precondition and the update one step under concurrent writers.
    #[tracing::instrument(skip(self))]
    pub async fn update_status_from(
        &self,
        id: Uuid,
        from: &[ImageStatus],
        status: ImageStatus,
    ) -> Result<Option<ImageStatus>> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        let row = sqlx::query(
            r#"
            WITH prev AS (
                SELECT id, status FROM image_records WHERE id = $1 FOR UPDATE
            )
            UPDATE image_records r
            SET status = $2,
                updated_at = NOW()
            FROM prev
            WHERE r.id = prev.id
                AND prev.status = ANY($3)
            RETURNING prev.status AS previous_status
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(&from)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update image record status")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let previous: String = row.try_get("previous_status")?;
        let previous: ImageStatus = previous.parse()?;

        tracing::debug!(
            record_id = %id,
            from = %previous,
            to = %status,
            "Image record status updated"
        );

        Ok(Some(previous))
    }
}
