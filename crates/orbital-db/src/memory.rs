//! In-process store implementations
//!
//! Used by tests and single-node development runs. State lives behind
//! `Arc<Mutex<..>>`, so clones share the same data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use orbital_core::models::{
    ImageRecord, ImageStatus, MetadataDocument, NewTask, Task, TaskStats, TaskStatus,
};
use orbital_core::PipelineError;

use crate::store_traits::{DocumentStore, ImageRecordStore, TaskStore};

/// In-memory image record store
#[derive(Clone, Default)]
pub struct MemoryImageRecordStore {
    records: Arc<Mutex<HashMap<Uuid, ImageRecord>>>,
}

impl MemoryImageRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as the upload side would.
    pub async fn insert(&self, record: ImageRecord) {
        self.records.lock().await.insert(record.id, record);
    }

    pub async fn status_of(&self, id: Uuid) -> Option<ImageStatus> {
        self.records.lock().await.get(&id).map(|r| r.status)
    }
}

#[async_trait]
impl ImageRecordStore for MemoryImageRecordStore {
    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn create(&self, record: &ImageRecord) -> Result<ImageRecord> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Err(PipelineError::Store(format!("duplicate record id {}", record.id)).into());
        }
        records.insert(record.id, record.clone());
        Ok(record.clone())
    }

    async fn update_status_from(
        &self,
        id: Uuid,
        from: &[ImageStatus],
        status: ImageStatus,
    ) -> Result<Option<ImageStatus>> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&record.status) {
            return Ok(None);
        }
        let previous = record.status;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(Some(previous))
    }
}

/// In-memory document collection.
///
/// Like the real collection it has no uniqueness constraint on `record_id`;
/// only [`DocumentStore::replace`] keeps the one-document-per-record invariant.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    documents: Arc<Mutex<Vec<MetadataDocument>>>,
    unavailable: Arc<AtomicBool>,
    replace_calls: Arc<AtomicUsize>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with a store error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of replace calls received, including failed ones.
    pub fn replace_calls(&self) -> usize {
        self.replace_calls.load(Ordering::SeqCst)
    }

    /// Append a document without removing prior ones.
    pub async fn insert_raw(&self, document: MetadataDocument) {
        self.documents.lock().await.push(document);
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.lock().await.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::Store("document store unavailable".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn replace(&self, document: &MetadataDocument) -> Result<u64> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut documents = self.documents.lock().await;
        let before = documents.len();
        documents.retain(|d| d.record_id != document.record_id);
        let removed = (before - documents.len()) as u64;
        documents.push(document.clone());
        Ok(removed)
    }

    async fn find_by_record_id(&self, record_id: &str) -> Result<Option<MetadataDocument>> {
        self.check_available()?;
        Ok(self
            .documents
            .lock()
            .await
            .iter()
            .rev()
            .find(|d| d.record_id == record_id)
            .cloned())
    }

    async fn find_by_record_ids(
        &self,
        record_ids: &[String],
    ) -> Result<HashMap<String, MetadataDocument>> {
        self.check_available()?;
        let documents = self.documents.lock().await;
        Ok(documents
            .iter()
            .filter(|d| record_ids.contains(&d.record_id))
            .map(|d| (d.record_id.clone(), d.clone()))
            .collect())
    }

    async fn count_by_record_id(&self, record_id: &str) -> Result<i64> {
        self.check_available()?;
        Ok(self
            .documents
            .lock()
            .await
            .iter()
            .filter(|d| d.record_id == record_id)
            .count() as i64)
    }
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<Uuid, Task>,
    /// Insertion order, for FIFO among equal priorities.
    order: Vec<Uuid>,
}

impl TaskTable {
    fn insert(&mut self, new: &NewTask) -> Task {
        let now = Utc::now();
        let scheduled_at = new.scheduled_at.unwrap_or(now);
        let task = Task {
            id: Uuid::new_v4(),
            pipeline_id: new.pipeline_id,
            task_type: new.task_type,
            status: if scheduled_at > now {
                TaskStatus::Scheduled
            } else {
                TaskStatus::Pending
            },
            priority: new.priority.as_i32(),
            input: new.input.clone(),
            payload: new.payload.clone(),
            chain: new.chain.clone(),
            on_failure: new.on_failure.clone(),
            result: None,
            scheduled_at,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: new.max_retries,
            timeout_seconds: new.timeout_seconds,
            created_at: now,
            updated_at: now,
        };
        self.order.push(task.id);
        self.tasks.insert(task.id, task.clone());
        task
    }

    /// Settle the running attempt `claimed`. Anything else is a stale outcome.
    fn finish(
        &mut self,
        claimed: &Task,
        status: TaskStatus,
        result: serde_json::Value,
        follow_up: Option<NewTask>,
    ) -> Option<Task> {
        let task = self.running_attempt(claimed)?;
        let now = Utc::now();
        task.status = status;
        task.result = Some(result);
        task.completed_at = Some(now);
        task.updated_at = now;
        follow_up.map(|next| self.insert(&next))
    }

    /// The stored task, if it is still running the attempt `claimed` holds.
    fn running_attempt(&mut self, claimed: &Task) -> Option<&mut Task> {
        let task = self.tasks.get_mut(&claimed.id)?;
        if task.status != TaskStatus::Running || task.retry_count != claimed.retry_count {
            tracing::warn!(
                task_id = %claimed.id,
                retry_count = claimed.retry_count,
                "Task attempt is no longer running, dropping stale outcome"
            );
            return None;
        }
        Some(task)
    }
}

/// In-memory task queue storage.
///
/// Record claims need the image records, so stores used by the orchestrator
/// are built with [`MemoryTaskStore::with_records`].
#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    inner: Arc<Mutex<TaskTable>>,
    records: Option<MemoryImageRecordStore>,
    rejecting_inserts: Arc<AtomicBool>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: MemoryImageRecordStore) -> Self {
        Self {
            records: Some(records),
            ..Self::default()
        }
    }

    /// Make task creation fail with a store error until cleared.
    pub fn set_rejecting_inserts(&self, rejecting: bool) {
        self.rejecting_inserts.store(rejecting, Ordering::SeqCst);
    }

    fn check_insert(&self) -> Result<()> {
        if self.rejecting_inserts.load(Ordering::SeqCst) {
            return Err(PipelineError::Store("task store rejected the insert".to_string()).into());
        }
        Ok(())
    }

    /// Every task ever created, oldest first.
    pub async fn all_tasks(&self) -> Vec<Task> {
        let table = self.inner.lock().await;
        table
            .order
            .iter()
            .filter_map(|id| table.tasks.get(id).cloned())
            .collect()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_task(&self, task: NewTask) -> Result<Task> {
        self.check_insert()?;
        Ok(self.inner.lock().await.insert(&task))
    }

    async fn create_task_for_record(
        &self,
        record_id: Uuid,
        task: NewTask,
    ) -> Result<Option<Task>> {
        let records = self
            .records
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No image record store attached to the task store"))?;
        let mut records = records.records.lock().await;
        let Some(record) = records
            .get_mut(&record_id)
            .filter(|r| r.status == ImageStatus::Pending)
        else {
            return Ok(None);
        };
        // A rejected insert leaves the record untouched.
        self.check_insert()?;

        let created = self.inner.lock().await.insert(&task);
        record.status = ImageStatus::Processing;
        record.updated_at = Utc::now();
        Ok(Some(created))
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.inner.lock().await.tasks.get(&task_id).cloned())
    }

    async fn list_by_pipeline(&self, pipeline_id: Uuid) -> Result<Vec<Task>> {
        let table = self.inner.lock().await;
        Ok(table
            .order
            .iter()
            .filter_map(|id| table.tasks.get(id))
            .filter(|t| t.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn claim_next_task(&self) -> Result<Option<Task>> {
        let mut table = self.inner.lock().await;
        let mut best: Option<&Task> = None;
        for id in &table.order {
            let Some(task) = table.tasks.get(id) else {
                continue;
            };
            if !task.is_ready_to_run() {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    task.priority > b.priority
                        || (task.priority == b.priority && task.scheduled_at < b.scheduled_at)
                }
            };
            if better {
                best = Some(task);
            }
        }
        let Some(id) = best.map(|t| t.id) else {
            return Ok(None);
        };

        let Some(task) = table.tasks.get_mut(&id) else {
            return Ok(None);
        };
        let now = Utc::now();
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn complete_and_advance(
        &self,
        task: &Task,
        result: serde_json::Value,
        next: Option<NewTask>,
    ) -> Result<Option<Task>> {
        Ok(self
            .inner
            .lock()
            .await
            .finish(task, TaskStatus::Completed, result, next))
    }

    async fn fail_and_compensate(
        &self,
        task: &Task,
        error: serde_json::Value,
        compensation: Option<NewTask>,
    ) -> Result<Option<Task>> {
        Ok(self
            .inner
            .lock()
            .await
            .finish(task, TaskStatus::Failed, error, compensation))
    }

    async fn schedule_retry(
        &self,
        task: &Task,
        delay: Duration,
        error: serde_json::Value,
    ) -> Result<Option<Task>> {
        let mut table = self.inner.lock().await;
        let Some(stored) = table.running_attempt(task) else {
            return Ok(None);
        };
        let now = Utc::now();
        stored.status = TaskStatus::Scheduled;
        stored.retry_count += 1;
        stored.scheduled_at = now + chrono::Duration::from_std(delay)?;
        stored.started_at = None;
        stored.result = Some(error);
        stored.updated_at = now;
        Ok(Some(stored.clone()))
    }

    async fn reap_stale_running_tasks(&self, grace_period_secs: i64) -> Result<u64> {
        let mut table = self.inner.lock().await;
        let now = Utc::now();
        let stale: Vec<Uuid> = table
            .order
            .iter()
            .filter_map(|id| table.tasks.get(id))
            .filter(|t| t.status == TaskStatus::Running)
            .filter(|t| {
                let allowed = i64::from(t.timeout_seconds.unwrap_or(3600)) + grace_period_secs;
                t.started_at
                    .map(|started| started + chrono::Duration::seconds(allowed) < now)
                    .unwrap_or(false)
            })
            .map(|t| t.id)
            .collect();

        let mut compensations = Vec::new();
        for id in &stale {
            let Some(task) = table.tasks.get_mut(id) else {
                continue;
            };
            task.updated_at = now;
            if task.can_retry() {
                task.status = TaskStatus::Pending;
                task.retry_count += 1;
                task.started_at = None;
            } else {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now);
                task.result = Some(serde_json::json!({
                    "error": "Task exceeded its timeout and was reaped",
                    "retry_count": task.retry_count,
                }));
                compensations.extend(NewTask::compensation_for(task));
            }
        }
        for compensation in &compensations {
            table.insert(compensation);
        }

        Ok(stale.len() as u64)
    }

    async fn get_stats(&self) -> Result<TaskStats> {
        let table = self.inner.lock().await;
        let mut stats = TaskStats::default();
        for task in table.tasks.values() {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Scheduled => stats.scheduled += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbital_core::models::{
        status_literal, ChainLink, ImageMetadata, Priority, SendNotificationPayload,
        SetStatusPayload, TaskType,
    };
    use serde_json::json;

    fn doc(record_id: &str, width: u32) -> MetadataDocument {
        MetadataDocument {
            record_id: record_id.to_string(),
            metadata: ImageMetadata::new(width, 10, "PNG"),
        }
    }

    fn set_status_task(pipeline_id: Uuid) -> NewTask {
        let links = vec![ChainLink::new(&SetStatusPayload {
            record_id: Uuid::new_v4(),
        })
        .with_input(status_literal(ImageStatus::Completed))];
        let on_failure = vec![ChainLink::new(&SendNotificationPayload {
            recipient: "owner@example.com".into(),
            display_name: "pic".into(),
        })
        .with_input(status_literal(ImageStatus::Failed))];
        NewTask::from_links(pipeline_id, &links, &on_failure, Priority::Normal, 1, Some(60))
            .unwrap()
    }

    #[tokio::test]
    async fn replace_removes_every_prior_document() {
        let store = MemoryDocumentStore::new();
        store.insert_raw(doc("a", 1)).await;
        store.insert_raw(doc("a", 2)).await;
        store.insert_raw(doc("b", 3)).await;

        let removed = store.replace(&doc("a", 4)).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count_by_record_id("a").await.unwrap(), 1);
        assert_eq!(store.count_by_record_id("b").await.unwrap(), 1);
        let current = store.find_by_record_id("a").await.unwrap().unwrap();
        assert_eq!(current.metadata.width, 4);
    }

    #[tokio::test]
    async fn unavailable_store_fails_with_store_error() {
        let store = MemoryDocumentStore::new();
        store.set_unavailable(true);
        let err = store.replace(&doc("a", 1)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Store(_))
        ));
        assert_eq!(store.replace_calls(), 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn find_by_record_ids_returns_matches_only() {
        let store = MemoryDocumentStore::new();
        store.replace(&doc("a", 1)).await.unwrap();
        store.replace(&doc("b", 2)).await.unwrap();
        let found = store
            .find_by_record_ids(&["a".to_string(), "zzz".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("a"));
    }

    #[tokio::test]
    async fn update_status_from_respects_precondition() {
        let store = MemoryImageRecordStore::new();
        let record = ImageRecord::new("pic", Uuid::new_v4());
        let id = record.id;
        store.insert(record).await;

        let prev = store
            .update_status_from(id, &[ImageStatus::Pending], ImageStatus::Processing)
            .await
            .unwrap();
        assert_eq!(prev, Some(ImageStatus::Pending));

        let prev = store
            .update_status_from(id, &[ImageStatus::Pending], ImageStatus::Failed)
            .await
            .unwrap();
        assert_eq!(prev, None);
        assert_eq!(store.status_of(id).await, Some(ImageStatus::Processing));

        let missing = store
            .update_status_from(Uuid::new_v4(), &ImageStatus::ALL, ImageStatus::Failed)
            .await
            .unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn claim_prefers_priority_then_fifo() {
        let store = MemoryTaskStore::new();
        let pipeline = Uuid::new_v4();
        let first = store.create_task(set_status_task(pipeline)).await.unwrap();
        let _second = store.create_task(set_status_task(pipeline)).await.unwrap();
        let mut urgent = set_status_task(pipeline);
        urgent.priority = Priority::High;
        let urgent = store.create_task(urgent).await.unwrap();

        let claimed = store.claim_next_task().await.unwrap().unwrap();
        assert_eq!(claimed.id, urgent.id);
        assert_eq!(claimed.status, TaskStatus::Running);

        let claimed = store.claim_next_task().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
    }

    #[tokio::test]
    async fn complete_and_advance_is_atomic_with_follow_up() {
        let store = MemoryTaskStore::new();
        let pipeline = Uuid::new_v4();
        store.create_task(set_status_task(pipeline)).await.unwrap();
        let claimed = store.claim_next_task().await.unwrap().unwrap();

        let mut follow_up = set_status_task(pipeline);
        follow_up.input = Some(json!("COMPLETED"));
        let next = store
            .complete_and_advance(&claimed, json!(null), Some(follow_up))
            .await
            .unwrap();
        assert!(next.is_some());

        // A second outcome for the same task is stale and enqueues nothing.
        let again = store
            .complete_and_advance(&claimed, json!(null), Some(set_status_task(pipeline)))
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(store.list_by_pipeline(pipeline).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn schedule_retry_delays_task() {
        let store = MemoryTaskStore::new();
        let task = store
            .create_task(set_status_task(Uuid::new_v4()))
            .await
            .unwrap();
        let claimed = store.claim_next_task().await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);

        let retried = store
            .schedule_retry(&claimed, Duration::from_secs(60), json!({"error": "x"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.status, TaskStatus::Scheduled);
        assert_eq!(retried.retry_count, 1);
        assert!(store.claim_next_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reaped_attempt_cannot_settle_the_reclaimed_task() {
        let store = MemoryTaskStore::new();
        let pipeline = Uuid::new_v4();
        let mut new = set_status_task(pipeline);
        new.timeout_seconds = Some(0);
        store.create_task(new).await.unwrap();

        let first = store.claim_next_task().await.unwrap().unwrap();
        assert_eq!(store.reap_stale_running_tasks(-1).await.unwrap(), 1);
        let second = store.claim_next_task().await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.retry_count, 1);

        // The first worker fails late: neither a retry nor a failure applies.
        let retried = store
            .schedule_retry(&first, Duration::from_secs(60), json!({"error": "late"}))
            .await
            .unwrap();
        assert!(retried.is_none());
        let failed = store
            .fail_and_compensate(&first, json!({"error": "late"}), None)
            .await
            .unwrap();
        assert!(failed.is_none());

        store
            .complete_and_advance(&second, json!("done"), None)
            .await
            .unwrap();
        let settled = store.get_task(first.id).await.unwrap().unwrap();
        assert_eq!(settled.status, TaskStatus::Completed);
        assert_eq!(settled.retry_count, 1);
        assert_eq!(settled.result, Some(json!("done")));
    }

    #[tokio::test]
    async fn create_task_for_record_claims_pending_record() {
        let records = MemoryImageRecordStore::new();
        let record = ImageRecord::new("pic", Uuid::new_v4());
        let id = record.id;
        records.insert(record).await;
        let store = MemoryTaskStore::with_records(records.clone());

        let created = store
            .create_task_for_record(id, set_status_task(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(created.is_some());
        assert_eq!(records.status_of(id).await, Some(ImageStatus::Processing));

        // Already claimed: nothing else is enqueued.
        let again = store
            .create_task_for_record(id, set_status_task(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(store.all_tasks().await.len(), 1);

        let missing = store
            .create_task_for_record(Uuid::new_v4(), set_status_task(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn rejected_insert_leaves_record_pending() {
        let records = MemoryImageRecordStore::new();
        let record = ImageRecord::new("pic", Uuid::new_v4());
        let id = record.id;
        records.insert(record).await;
        let store = MemoryTaskStore::with_records(records.clone());

        store.set_rejecting_inserts(true);
        let err = store
            .create_task_for_record(id, set_status_task(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Store(_))
        ));
        assert_eq!(records.status_of(id).await, Some(ImageStatus::Pending));
        assert!(store.all_tasks().await.is_empty());

        store.set_rejecting_inserts(false);
        let created = store
            .create_task_for_record(id, set_status_task(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(created.is_some());
        assert_eq!(records.status_of(id).await, Some(ImageStatus::Processing));
    }

    #[tokio::test]
    async fn claim_without_record_store_is_an_error() {
        let store = MemoryTaskStore::new();
        assert!(store
            .create_task_for_record(Uuid::new_v4(), set_status_task(Uuid::new_v4()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reaper_requeues_then_fails_with_compensation() {
        let store = MemoryTaskStore::new();
        let pipeline = Uuid::new_v4();
        let mut new = set_status_task(pipeline);
        new.timeout_seconds = Some(0);
        let task = store.create_task(new).await.unwrap();

        store.claim_next_task().await.unwrap();
        assert_eq!(store.reap_stale_running_tasks(-1).await.unwrap(), 1);
        let requeued = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.retry_count, 1);

        // Retries exhausted: the task fails and its compensation is enqueued.
        store.claim_next_task().await.unwrap();
        assert_eq!(store.reap_stale_running_tasks(-1).await.unwrap(), 1);
        let failed = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);

        let tasks = store.list_by_pipeline(pipeline).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].task_type, TaskType::SendNotification);
        assert!(tasks[1].on_failure.is_empty());
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let store = MemoryTaskStore::new();
        store
            .create_task(set_status_task(Uuid::new_v4()))
            .await
            .unwrap();
        store
            .create_task(set_status_task(Uuid::new_v4()))
            .await
            .unwrap();
        store.claim_next_task().await.unwrap();
        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.pending, 1);
    }
}
