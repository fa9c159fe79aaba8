use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use sqlx::{PgConnection, PgPool, Postgres};
use uuid::Uuid;

use orbital_core::models::{NewTask, Task, TaskStats, TaskStatus};

/// Channel name for PostgreSQL LISTEN/NOTIFY when a new task is created.
pub const TASK_NOTIFY_CHANNEL: &str = "orbital_new_task";

const TASK_COLUMNS: &str = r#"
    id,
    pipeline_id,
    task_type,
    status,
    priority,
    input,
    payload,
    chain,
    on_failure,
    result,
    scheduled_at,
    started_at,
    completed_at,
    retry_count,
    max_retries,
    timeout_seconds,
    created_at,
    updated_at
"#;

#[derive(Clone)]
pub struct TaskRepository {
    pool: PgPool,
}

/// Insert a task on an open connection and wake listening workers.
///
/// The notification is sent on the same connection, so when called inside a
/// transaction it is only delivered once that transaction commits.
async fn insert_task(conn: &mut PgConnection, task: &NewTask) -> Result<Task> {
    let scheduled_at = task.scheduled_at.unwrap_or_else(Utc::now);
    let status = if scheduled_at > Utc::now() {
        TaskStatus::Scheduled
    } else {
        TaskStatus::Pending
    };
    let chain = serde_json::to_value(&task.chain).context("Failed to encode task chain")?;
    let on_failure =
        serde_json::to_value(&task.on_failure).context("Failed to encode compensation chain")?;

    let sql = format!(
        r#"
        INSERT INTO tasks (
            pipeline_id, task_type, status, priority, input, payload, chain, on_failure,
            scheduled_at, max_retries, timeout_seconds
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING {TASK_COLUMNS}
        "#
    );

    let created: Task = sqlx::query_as::<Postgres, Task>(&sql)
        .bind(task.pipeline_id)
        .bind(task.task_type.to_string())
        .bind(status.to_string())
        .bind(task.priority.as_i32())
        .bind(&task.input)
        .bind(&task.payload)
        .bind(chain)
        .bind(on_failure)
        .bind(scheduled_at)
        .bind(task.max_retries)
        .bind(task.timeout_seconds)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(
                error = %e,
                pipeline_id = %task.pipeline_id,
                task_type = %task.task_type,
                "Failed to insert task into database"
            );
            anyhow::anyhow!("Failed to insert task into database: {}", e)
        })?;

    // A failed statement aborts the surrounding transaction, so this error must
    // propagate rather than be logged and ignored.
    sqlx::query("SELECT pg_notify($1, '')")
        .bind(TASK_NOTIFY_CHANNEL)
        .execute(&mut *conn)
        .await
        .context("Failed to notify workers of new task")?;

    Ok(created)
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new task
    #[tracing::instrument(skip(self, task), fields(pipeline_id = %task.pipeline_id, task_type = %task.task_type))]
    pub async fn create_task(&self, task: NewTask) -> Result<Task> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for task creation")?;

        let created = insert_task(&mut *tx, &task).await?;

        tx.commit().await.map_err(|e| {
            tracing::error!(
                error = %e,
                task_id = %created.id,
                "Failed to commit transaction for task creation"
            );
            anyhow::anyhow!("Failed to commit transaction: {}", e)
        })?;

        tracing::info!(
            task_id = %created.id,
            pipeline_id = %created.pipeline_id,
            task_type = %created.task_type,
            priority = created.priority,
            "Task created"
        );

        Ok(created)
    }

    /// Move image record `record_id` from PENDING to PROCESSING and insert
    /// `task`, committing both or neither.
    ///
    /// Returns `None` without inserting when the record is missing or not
    /// PENDING.
    #[tracing::instrument(skip(self, task), fields(pipeline_id = %task.pipeline_id, task_type = %task.task_type))]
    pub async fn create_task_for_record(
        &self,
        record_id: Uuid,
        task: NewTask,
    ) -> Result<Option<Task>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for record claim")?;

        let claimed = sqlx::query(
            r#"
            UPDATE image_records
            SET status = 'PROCESSING',
                updated_at = NOW()
            WHERE id = $1
                AND status = 'PENDING'
            "#,
        )
        .bind(record_id)
        .execute(&mut *tx)
        .await
        .context("Failed to claim image record")?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await.ok();
            tracing::debug!(record_id = %record_id, "Image record not pending, nothing enqueued");
            return Ok(None);
        }

        let created = insert_task(&mut *tx, &task).await?;

        tx.commit()
            .await
            .context("Failed to commit record claim and task")?;

        tracing::info!(
            task_id = %created.id,
            record_id = %record_id,
            task_type = %created.task_type,
            priority = created.priority,
            "Image record claimed and task created"
        );

        Ok(Some(created))
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let task = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch task")?;

        Ok(task)
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_by_pipeline(&self, pipeline_id: Uuid) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE pipeline_id = $1 ORDER BY created_at ASC, id ASC"
        );
        let tasks = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(pipeline_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list pipeline tasks")?;

        Ok(tasks)
    }

    /// Atomically claim the next available task.
    ///
    /// Uses FOR UPDATE SKIP LOCKED so concurrent workers never claim the same row.
    #[tracing::instrument(skip(self))]
    pub async fn claim_next_task(&self) -> Result<Option<Task>> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'running',
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM tasks
                WHERE status IN ('pending', 'scheduled')
                    AND scheduled_at <= NOW()
                ORDER BY priority DESC, scheduled_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        );

        let task = sqlx::query_as::<Postgres, Task>(&sql)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to claim next task")?;

        if let Some(ref task) = task {
            tracing::debug!(
                task_id = %task.id,
                pipeline_id = %task.pipeline_id,
                task_type = %task.task_type,
                "Task claimed"
            );
        }

        Ok(task)
    }

    /// Finish the running attempt `claimed` with `status` and `result`,
    /// inserting `follow_up` in the same transaction.
    async fn finish_and_enqueue(
        &self,
        claimed: &Task,
        status: TaskStatus,
        result: serde_json::Value,
        follow_up: Option<NewTask>,
    ) -> Result<Option<Task>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let finished = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2,
                result = $3,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
                AND status = 'running'
                AND retry_count = $4
            "#,
        )
        .bind(claimed.id)
        .bind(status.to_string())
        .bind(result)
        .bind(claimed.retry_count)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to mark task as {}", status))?
        .rows_affected();

        if finished == 0 {
            tx.rollback().await.ok();
            tracing::warn!(
                task_id = %claimed.id,
                retry_count = claimed.retry_count,
                status = %status,
                "Task attempt is no longer running, dropping stale outcome"
            );
            return Ok(None);
        }

        let next = match follow_up {
            Some(ref next) => Some(insert_task(&mut *tx, next).await?),
            None => None,
        };

        tx.commit().await.context("Failed to commit transaction")?;

        Ok(next)
    }

    /// Mark task as completed and enqueue the next chain link
    #[tracing::instrument(skip_all, fields(task_id = %task.id))]
    pub async fn complete_and_advance(
        &self,
        task: &Task,
        result: serde_json::Value,
        next: Option<NewTask>,
    ) -> Result<Option<Task>> {
        let next = self
            .finish_and_enqueue(task, TaskStatus::Completed, result, next)
            .await?;

        tracing::info!(
            task_id = %task.id,
            next_task_id = ?next.as_ref().map(|t| t.id),
            "Task completed"
        );

        Ok(next)
    }

    /// Mark task as failed and enqueue its compensation chain
    #[tracing::instrument(skip_all, fields(task_id = %task.id))]
    pub async fn fail_and_compensate(
        &self,
        task: &Task,
        error: serde_json::Value,
        compensation: Option<NewTask>,
    ) -> Result<Option<Task>> {
        let compensation = self
            .finish_and_enqueue(task, TaskStatus::Failed, error, compensation)
            .await?;

        tracing::error!(
            task_id = %task.id,
            compensation_task_id = ?compensation.as_ref().map(|t| t.id),
            "Task failed"
        );

        Ok(compensation)
    }

    /// Increment retry count and schedule the task after `delay`.
    ///
    /// Only the attempt that is still running may reschedule itself. Returns
    /// `None` when the task was reaped or handed to another worker meanwhile.
    #[tracing::instrument(skip_all, fields(task_id = %task.id))]
    pub async fn schedule_retry(
        &self,
        task: &Task,
        delay: Duration,
        error: serde_json::Value,
    ) -> Result<Option<Task>> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'scheduled',
                retry_count = retry_count + 1,
                scheduled_at = NOW() + ($2 * interval '1 millisecond'),
                started_at = NULL,
                result = $3,
                updated_at = NOW()
            WHERE id = $1
                AND status = 'running'
                AND retry_count = $4
            RETURNING {TASK_COLUMNS}
            "#
        );

        let retried = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task.id)
            .bind(delay.as_millis() as i64)
            .bind(error)
            .bind(task.retry_count)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to schedule task retry")?;

        match retried {
            Some(ref retried) => tracing::info!(
                task_id = %task.id,
                retry_count = retried.retry_count,
                max_retries = retried.max_retries,
                scheduled_at = %retried.scheduled_at,
                "Task retry scheduled"
            ),
            None => tracing::warn!(
                task_id = %task.id,
                retry_count = task.retry_count,
                "Task attempt is no longer running, retry not scheduled"
            ),
        }

        Ok(retried)
    }

    #[tracing::instrument(skip(self))]
    pub async fn reap_stale_running_tasks(&self, grace_period_secs: i64) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for reaper")?;

        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE status = 'running'
                AND started_at IS NOT NULL
                AND started_at + ((COALESCE(timeout_seconds, 3600) + $1) * interval '1 second') < NOW()
            FOR UPDATE SKIP LOCKED
            "#
        );

        let stale: Vec<Task> = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(grace_period_secs)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to find stale tasks")?;

        for task in &stale {
            if task.can_retry() {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'pending',
                        retry_count = retry_count + 1,
                        started_at = NULL,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(task.id)
                .execute(&mut *tx)
                .await
                .context("Failed to requeue stale task")?;

                tracing::warn!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    retry_count = task.retry_count + 1,
                    "Stale running task returned to queue"
                );
            } else {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'failed',
                        result = $2,
                        completed_at = NOW(),
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(task.id)
                .bind(json!({
                    "error": "Task exceeded its timeout and was reaped",
                    "retry_count": task.retry_count,
                }))
                .execute(&mut *tx)
                .await
                .context("Failed to fail stale task")?;

                if let Some(compensation) = NewTask::compensation_for(task) {
                    insert_task(&mut *tx, &compensation).await?;
                }

                tracing::error!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    "Stale running task failed after max retries"
                );
            }
        }

        tx.commit().await.context("Failed to commit reaper")?;

        Ok(stale.len() as u64)
    }

    /// Get aggregated task statistics
    #[tracing::instrument(skip(self))]
    pub async fn get_stats(&self) -> Result<TaskStats> {
        use sqlx::Row;
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total,
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'running') as running,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed,
                COUNT(*) FILTER (WHERE status = 'scheduled') as scheduled
            FROM tasks
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch task stats")?;

        Ok(TaskStats {
            total: row.try_get::<Option<i64>, _>("total")?.unwrap_or(0),
            pending: row.try_get::<Option<i64>, _>("pending")?.unwrap_or(0),
            running: row.try_get::<Option<i64>, _>("running")?.unwrap_or(0),
            completed: row.try_get::<Option<i64>, _>("completed")?.unwrap_or(0),
            failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
            scheduled: row.try_get::<Option<i64>, _>("scheduled")?.unwrap_or(0),
        })
    }
}
