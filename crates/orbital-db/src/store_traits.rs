//! Store trait abstractions
//!
//! Stages, the orchestrator and the worker depend on these traits rather than
//! on concrete repositories, so the same pipeline runs against PostgreSQL or the
//! in-process stores in [`crate::memory`].

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use orbital_core::models::{ImageRecord, ImageStatus, MetadataDocument, NewTask, Task, TaskStats};
use uuid::Uuid;

use crate::db::{DocumentRepository, ImageRecordRepository, TaskRepository};

/// Relational store holding image records and their status field.
#[async_trait]
pub trait ImageRecordStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>>;

    async fn create(&self, record: &ImageRecord) -> Result<ImageRecord>;

    /// Set `status` only if the current status is one of `from`.
    ///
    /// Returns the previous status when the update was applied, `None` when the
    /// record is missing or its current status is not in `from`. The check and
    /// the write are a single atomic step.
    async fn update_status_from(
        &self,
        id: Uuid,
        from: &[ImageStatus],
        status: ImageStatus,
    ) -> Result<Option<ImageStatus>>;
}

/// Document store holding metadata documents keyed by record id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Delete every document for the document's record id, then insert it.
    /// Returns how many prior documents were removed.
    async fn replace(&self, document: &MetadataDocument) -> Result<u64>;

    async fn find_by_record_id(&self, record_id: &str) -> Result<Option<MetadataDocument>>;

    /// Batch lookup for a page of records.
    async fn find_by_record_ids(
        &self,
        record_ids: &[String],
    ) -> Result<HashMap<String, MetadataDocument>>;

    async fn count_by_record_id(&self, record_id: &str) -> Result<i64>;
}

/// Durable task storage backing the worker queue.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: NewTask) -> Result<Task>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>>;

    /// Every task of one pipeline run, oldest first.
    async fn list_by_pipeline(&self, pipeline_id: Uuid) -> Result<Vec<Task>>;

    /// Atomically claim the next ready task and mark it running.
    async fn claim_next_task(&self) -> Result<Option<Task>>;

    /// Move image record `record_id` from PENDING to PROCESSING and create
    /// `task` in one step. Returns `None`, creating nothing, when the record is
    /// missing or not PENDING.
    async fn create_task_for_record(
        &self,
        record_id: Uuid,
        task: NewTask,
    ) -> Result<Option<Task>>;

    /// Mark the claimed attempt `task` completed and enqueue `next` in the same
    /// step.
    ///
    /// Returns the enqueued task. An attempt that is no longer running (reaped,
    /// possibly handed to another worker) is left untouched and nothing is
    /// enqueued.
    async fn complete_and_advance(
        &self,
        task: &Task,
        result: serde_json::Value,
        next: Option<NewTask>,
    ) -> Result<Option<Task>>;

    /// Mark the claimed attempt `task` failed and enqueue `compensation` in the
    /// same step.
    async fn fail_and_compensate(
        &self,
        task: &Task,
        error: serde_json::Value,
        compensation: Option<NewTask>,
    ) -> Result<Option<Task>>;

    /// Put the claimed attempt `task` back in the queue after `delay`, bumping
    /// its retry count. Returns `None` when the attempt is no longer running.
    async fn schedule_retry(
        &self,
        task: &Task,
        delay: Duration,
        error: serde_json::Value,
    ) -> Result<Option<Task>>;

    /// Return running tasks past their timeout plus `grace_period_secs` to the
    /// queue, or fail them (with compensation) once retries are exhausted.
    /// Returns the number of tasks reaped.
    async fn reap_stale_running_tasks(&self, grace_period_secs: i64) -> Result<u64>;

    async fn get_stats(&self) -> Result<TaskStats>;
}

// Implementations for concrete repository types

#[async_trait]
impl ImageRecordStore for ImageRecordRepository {
    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        self.get(id).await
    }

    async fn create(&self, record: &ImageRecord) -> Result<ImageRecord> {
        self.create(record).await
    }

    async fn update_status_from(
        &self,
        id: Uuid,
        from: &[ImageStatus],
        status: ImageStatus,
    ) -> Result<Option<ImageStatus>> {
        self.update_status_from(id, from, status).await
    }
}

#[async_trait]
impl DocumentStore for DocumentRepository {
    async fn replace(&self, document: &MetadataDocument) -> Result<u64> {
        self.replace(document).await
    }

    async fn find_by_record_id(&self, record_id: &str) -> Result<Option<MetadataDocument>> {
        self.find_by_record_id(record_id).await
    }

    async fn find_by_record_ids(
        &self,
        record_ids: &[String],
    ) -> Result<HashMap<String, MetadataDocument>> {
        self.find_by_record_ids(record_ids).await
    }

    async fn count_by_record_id(&self, record_id: &str) -> Result<i64> {
        self.count_by_record_id(record_id).await
    }
}

#[async_trait]
impl TaskStore for TaskRepository {
    async fn create_task(&self, task: NewTask) -> Result<Task> {
        self.create_task(task).await
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.get_task(task_id).await
    }

    async fn list_by_pipeline(&self, pipeline_id: Uuid) -> Result<Vec<Task>> {
        self.list_by_pipeline(pipeline_id).await
    }

    async fn claim_next_task(&self) -> Result<Option<Task>> {
        self.claim_next_task().await
    }

    async fn create_task_for_record(
        &self,
        record_id: Uuid,
        task: NewTask,
    ) -> Result<Option<Task>> {
        self.create_task_for_record(record_id, task).await
    }

    async fn complete_and_advance(
        &self,
        task: &Task,
        result: serde_json::Value,
        next: Option<NewTask>,
    ) -> Result<Option<Task>> {
        self.complete_and_advance(task, result, next).await
    }

    async fn fail_and_compensate(
        &self,
        task: &Task,
        error: serde_json::Value,
        compensation: Option<NewTask>,
    ) -> Result<Option<Task>> {
        self.fail_and_compensate(task, error, compensation).await
    }

    async fn schedule_retry(
        &self,
        task: &Task,
        delay: Duration,
        error: serde_json::Value,
    ) -> Result<Option<Task>> {
        self.schedule_retry(task, delay, error).await
    }

    async fn reap_stale_running_tasks(&self, grace_period_secs: i64) -> Result<u64> {
        self.reap_stale_running_tasks(grace_period_secs).await
    }

    async fn get_stats(&self) -> Result<TaskStats> {
        self.get_stats().await
    }
}
