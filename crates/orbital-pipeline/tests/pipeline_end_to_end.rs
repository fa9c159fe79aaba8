//! Full pipeline runs against the in-process stores and the outbox mailer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use orbital_core::models::{
    ImageRecord, ImageStatus, NewTask, PipelineInput, Priority, Task, TaskStats, TaskStatus,
    TaskType,
};
use orbital_core::PipelineError;
use orbital_db::{
    DocumentStore, MemoryDocumentStore, MemoryImageRecordStore, MemoryTaskStore, TaskStore,
};
use orbital_infra::RateLimiter;
use orbital_pipeline::{Orchestrator, PipelineState, RunOutcome};
use orbital_services::OutboxMailer;
use orbital_worker::{TaskQueue, TaskQueueConfig};
use tempfile::TempDir;
use uuid::Uuid;

const RECIPIENT: &str = "owner@example.com";

/// Task store that refuses the first `failures` task insertions.
struct RefusingTaskStore {
    inner: MemoryTaskStore,
    failures: AtomicUsize,
}

impl RefusingTaskStore {
    fn new(inner: MemoryTaskStore, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }

    fn refuse(&self) -> Result<()> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            anyhow::bail!("queue unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for RefusingTaskStore {
    async fn create_task(&self, task: NewTask) -> Result<Task> {
        self.refuse()?;
        self.inner.create_task(task).await
    }

    async fn create_task_for_record(
        &self,
        record_id: Uuid,
        task: NewTask,
    ) -> Result<Option<Task>> {
        self.refuse()?;
        self.inner.create_task_for_record(record_id, task).await
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.inner.get_task(task_id).await
    }

    async fn list_by_pipeline(&self, pipeline_id: Uuid) -> Result<Vec<Task>> {
        self.inner.list_by_pipeline(pipeline_id).await
    }

    async fn claim_next_task(&self) -> Result<Option<Task>> {
        self.inner.claim_next_task().await
    }

    async fn complete_and_advance(
        &self,
        task: &Task,
        result: serde_json::Value,
        next: Option<NewTask>,
    ) -> Result<Option<Task>> {
        self.inner.complete_and_advance(task, result, next).await
    }

    async fn fail_and_compensate(
        &self,
        task: &Task,
        error: serde_json::Value,
        compensation: Option<NewTask>,
    ) -> Result<Option<Task>> {
        self.inner.fail_and_compensate(task, error, compensation).await
    }

    async fn schedule_retry(
        &self,
        task: &Task,
        delay: Duration,
        error: serde_json::Value,
    ) -> Result<Option<Task>> {
        self.inner.schedule_retry(task, delay, error).await
    }

    async fn reap_stale_running_tasks(&self, grace_period_secs: i64) -> Result<u64> {
        self.inner.reap_stale_running_tasks(grace_period_secs).await
    }

    async fn get_stats(&self) -> Result<TaskStats> {
        self.inner.get_stats().await
    }
}

struct Harness {
    dir: TempDir,
    records: Arc<MemoryImageRecordStore>,
    documents: Arc<MemoryDocumentStore>,
    mailer: Arc<OutboxMailer>,
    tasks: Arc<dyn TaskStore>,
    state: Arc<PipelineState>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        Self::with_task_store(|records| {
            Arc::new(MemoryTaskStore::with_records(records)) as Arc<dyn TaskStore>
        })
    }

    /// Harness whose task store refuses the first `failures` insertions.
    fn refusing(failures: usize) -> Self {
        Self::with_task_store(move |records| {
            Arc::new(RefusingTaskStore::new(
                MemoryTaskStore::with_records(records),
                failures,
            )) as Arc<dyn TaskStore>
        })
    }

    fn with_task_store(
        build: impl FnOnce(MemoryImageRecordStore) -> Arc<dyn TaskStore>,
    ) -> Self {
        let records = Arc::new(MemoryImageRecordStore::new());
        let tasks = build(records.as_ref().clone());
        let documents = Arc::new(MemoryDocumentStore::new());
        let mailer = Arc::new(OutboxMailer::new());
        let state = Arc::new(PipelineState::new(
            records.clone(),
            documents.clone(),
            mailer.clone(),
            "noreply@example.com",
            true,
        ));
        // No retries, so recoverable failures collapse into compensation within one drain.
        let config = TaskQueueConfig {
            max_retries: 0,
            ..TaskQueueConfig::default()
        };
        let queue = TaskQueue::new_no_worker(tasks.clone(), RateLimiter::new(100.0), config);
        Self {
            dir: tempfile::tempdir().unwrap(),
            records: records.clone(),
            documents,
            mailer,
            tasks,
            state,
            orchestrator: Orchestrator::new(records, queue),
        }
    }

    async fn pending_record(&self) -> Uuid {
        let record = ImageRecord::new("holiday.jpg", Uuid::new_v4());
        let id = record.id;
        self.records.insert(record).await;
        id
    }

    fn jpeg(&self, name: &str, width: u32, height: u32) -> PathBuf {
        let path = self.dir.path().join(name);
        image::RgbImage::from_pixel(width, height, image::Rgb([120, 80, 40]))
            .save(&path)
            .unwrap();
        path
    }

    fn png(&self, name: &str, width: u32, height: u32) -> PathBuf {
        let path = self.dir.path().join(name);
        image::RgbaImage::from_pixel(width, height, image::Rgba([0, 90, 200, 255]))
            .save(&path)
            .unwrap();
        path
    }

    fn garbage(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"this is not an image").unwrap();
        path
    }

    fn input(&self, record_id: Uuid, path: &Path) -> PipelineInput {
        PipelineInput::new(record_id, path, "holiday.jpg", RECIPIENT)
    }

    async fn drain(&self) -> usize {
        self.orchestrator
            .queue()
            .drain(self.state.clone())
            .await
            .unwrap()
    }

    async fn task_types(&self, pipeline_id: Uuid) -> Vec<(TaskType, TaskStatus)> {
        self.tasks
            .list_by_pipeline(pipeline_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| (t.task_type, t.status))
            .collect()
    }
}

#[tokio::test]
async fn valid_jpeg_completes_with_one_document_and_one_success_email() {
    let h = Harness::new();
    let id = h.pending_record().await;
    let path = h.jpeg("holiday.jpg", 584, 560);

    let outcome = h.orchestrator.run(h.input(id, &path)).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Submitted { .. }));
    assert_eq!(h.drain().await, 4);

    assert_eq!(h.records.status_of(id).await, Some(ImageStatus::Completed));

    let key = id.to_string();
    assert_eq!(h.documents.count_by_record_id(&key).await.unwrap(), 1);
    let document = h.documents.find_by_record_id(&key).await.unwrap().unwrap();
    assert_eq!(document.metadata.width, 584);
    assert_eq!(document.metadata.height, 560);
    assert_eq!(document.metadata.format, "JPEG");

    let emails = h.mailer.sent_to(RECIPIENT).await;
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].subject, "Task Completed");
    assert!(emails[0].body.contains("successfully"));
    assert!(!emails[0].body.contains("unsuccessfully"));

    assert!(!path.exists(), "resource is removed after extraction");

    let pipeline_id = outcome.pipeline_id().unwrap();
    assert_eq!(
        h.task_types(pipeline_id).await,
        vec![
            (TaskType::ExtractMetadata, TaskStatus::Completed),
            (TaskType::WriteDocument, TaskStatus::Completed),
            (TaskType::SendNotification, TaskStatus::Completed),
            (TaskType::SetStatus, TaskStatus::Completed),
        ]
    );
}

#[tokio::test]
async fn png_document_has_no_tag_fields() {
    let h = Harness::new();
    let id = h.pending_record().await;
    let path = h.png("scan.png", 720, 636);

    h.orchestrator.run(h.input(id, &path)).await.unwrap();
    h.drain().await;

    let document = h
        .documents
        .find_by_record_id(&id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(document.metadata.width, 720);
    assert_eq!(document.metadata.height, 636);
    assert_eq!(document.metadata.format, "PNG");
    assert!(document.metadata.tags.is_empty());
}

#[tokio::test]
async fn unreadable_resource_runs_compensation_once() {
    let h = Harness::new();
    let id = h.pending_record().await;
    let path = h.garbage("broken.jpg");

    let outcome = h.orchestrator.run(h.input(id, &path)).await.unwrap();
    h.drain().await;

    assert_eq!(h.records.status_of(id).await, Some(ImageStatus::Failed));
    assert_eq!(
        h.documents.count_by_record_id(&id.to_string()).await.unwrap(),
        0
    );
    assert_eq!(h.documents.replace_calls(), 0);

    let emails = h.mailer.sent_to(RECIPIENT).await;
    assert_eq!(emails.len(), 1);
    assert!(emails[0].body.contains("unsuccessfully"));
    assert!(emails[0].body.contains("troubled"));

    assert!(path.exists(), "resource is kept when extraction fails");

    assert_eq!(
        h.task_types(outcome.pipeline_id().unwrap()).await,
        vec![
            (TaskType::ExtractMetadata, TaskStatus::Failed),
            (TaskType::SendNotification, TaskStatus::Completed),
            (TaskType::SetStatus, TaskStatus::Completed),
        ]
    );
}

#[tokio::test]
async fn missing_resource_on_first_run_fails_the_record() {
    let h = Harness::new();
    let id = h.pending_record().await;
    let path = h.dir.path().join("never-uploaded.jpg");

    h.orchestrator.run(h.input(id, &path)).await.unwrap();
    h.drain().await;

    assert_eq!(h.records.status_of(id).await, Some(ImageStatus::Failed));
    assert_eq!(h.mailer.sent_to(RECIPIENT).await.len(), 1);
}

#[tokio::test]
async fn document_store_outage_fails_the_record() {
    let h = Harness::new();
    let id = h.pending_record().await;
    let path = h.jpeg("holiday.jpg", 64, 48);
    h.documents.set_unavailable(true);

    let outcome = h.orchestrator.run(h.input(id, &path)).await.unwrap();
    h.drain().await;

    assert_eq!(h.records.status_of(id).await, Some(ImageStatus::Failed));
    assert!(h.documents.is_empty().await);

    let emails = h.mailer.sent_to(RECIPIENT).await;
    assert_eq!(emails.len(), 1);
    assert!(emails[0].body.contains("unsuccessfully"));

    let stages = h.task_types(outcome.pipeline_id().unwrap()).await;
    assert_eq!(stages[1], (TaskType::WriteDocument, TaskStatus::Failed));
    assert_eq!(stages.len(), 4);
}

#[tokio::test]
async fn refused_forward_submission_falls_back_to_compensation() {
    let h = Harness::refusing(1);
    let id = h.pending_record().await;
    let path = h.jpeg("holiday.jpg", 32, 32);

    let outcome = h.orchestrator.run(h.input(id, &path)).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Compensating { .. }));
    h.drain().await;

    assert_eq!(h.records.status_of(id).await, Some(ImageStatus::Failed));
    assert!(h.documents.is_empty().await);
    let emails = h.mailer.sent_to(RECIPIENT).await;
    assert_eq!(emails.len(), 1);
    assert!(emails[0].body.contains("unsuccessfully"));
    assert!(path.exists(), "extraction never ran");
}

#[tokio::test]
async fn refused_submissions_mark_record_failed_directly() {
    let h = Harness::refusing(2);
    let id = h.pending_record().await;
    let path = h.jpeg("holiday.jpg", 32, 32);

    let err = h.orchestrator.run(h.input(id, &path)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Submission(_)));

    assert_eq!(h.records.status_of(id).await, Some(ImageStatus::Failed));
    assert_eq!(h.drain().await, 0);
    assert!(h.mailer.sent().await.is_empty());
}

#[tokio::test]
async fn refused_forward_submission_does_not_leave_a_processing_orphan() {
    let h = Harness::refusing(1);
    let id = h.pending_record().await;
    let path = h.jpeg("holiday.jpg", 32, 32);

    let outcome = h.orchestrator.run(h.input(id, &path)).await.unwrap();
    let pipeline_id = outcome.pipeline_id().unwrap();

    // Exactly one head task exists for the claimed record: the compensation one.
    assert_eq!(h.records.status_of(id).await, Some(ImageStatus::Processing));
    let queued = h.tasks.list_by_pipeline(pipeline_id).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].task_type, TaskType::SendNotification);
    assert_eq!(queued[0].priority, Priority::High.as_i32());
}

#[tokio::test]
async fn second_trigger_for_same_record_is_skipped() {
    let h = Harness::new();
    let id = h.pending_record().await;
    let path = h.jpeg("holiday.jpg", 584, 560);

    h.orchestrator.run(h.input(id, &path)).await.unwrap();
    let again = h.orchestrator.run(h.input(id, &path)).await.unwrap();
    assert_eq!(
        again,
        RunOutcome::Skipped {
            status: ImageStatus::Processing
        }
    );

    assert_eq!(h.drain().await, 4);
    assert_eq!(h.mailer.sent().await.len(), 1);

    let after = h.orchestrator.run(h.input(id, &path)).await.unwrap();
    assert_eq!(
        after,
        RunOutcome::Skipped {
            status: ImageStatus::Completed
        }
    );
}

#[tokio::test]
async fn redelivered_extraction_after_cleanup_reuses_stored_metadata() {
    let h = Harness::new();
    let id = h.pending_record().await;
    let path = h.jpeg("holiday.jpg", 584, 560);
    let input = h.input(id, &path);

    h.orchestrator.run(input.clone()).await.unwrap();
    h.drain().await;
    assert!(!path.exists());

    // Replay the first two stages as a redelivery would.
    let mut replay = Orchestrator::forward_chain(&input);
    replay.links.truncate(2);
    let pipeline_id = Uuid::new_v4();
    h.orchestrator
        .queue()
        .submit_chain(pipeline_id, &replay, Priority::Normal)
        .await
        .unwrap();
    h.drain().await;

    assert_eq!(
        h.task_types(pipeline_id).await,
        vec![
            (TaskType::ExtractMetadata, TaskStatus::Completed),
            (TaskType::WriteDocument, TaskStatus::Completed),
        ]
    );
    let key = id.to_string();
    assert_eq!(h.documents.count_by_record_id(&key).await.unwrap(), 1);
    let document = h.documents.find_by_record_id(&key).await.unwrap().unwrap();
    assert_eq!(document.metadata.width, 584);
    assert_eq!(h.records.status_of(id).await, Some(ImageStatus::Completed));
    assert_eq!(h.mailer.sent().await.len(), 1);
}

#[tokio::test]
async fn unknown_record_is_not_found() {
    let h = Harness::new();
    let path = h.jpeg("holiday.jpg", 16, 16);
    let missing = Uuid::new_v4();

    let err = h.orchestrator.run(h.input(missing, &path)).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(id) if id == missing));
    assert_eq!(h.drain().await, 0);
}
