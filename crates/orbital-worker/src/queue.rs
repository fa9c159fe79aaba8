//! Task queue: worker pool, LISTEN/NOTIFY or polling, retry, chain advancement
//! and compensation.
//!
//! A chain is persisted one link at a time. When a task succeeds, its result
//! becomes the leading argument of the next link, enqueued in the same store
//! step that completes the task. When a task fails for good, its compensation
//! links are enqueued in the same step that fails it.
//!
//! Shutdown: [`TaskQueue::shutdown`] signals the pool to stop; it does not wait for
//! in-flight tasks. Tasks left running are picked up again by the stale task
//! reaper of the next worker.

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;
use uuid::Uuid;

use orbital_core::models::{NewTask, Priority, Task, TaskChain};
use orbital_core::task_error::FailureDisposition;
use orbital_core::{Config, PipelineError, TaskError};
use orbital_db::{TaskStore, TASK_NOTIFY_CHANNEL};
use orbital_infra::RateLimiter;

use crate::context::TaskHandlerContext;

/// Maximum delay in seconds before retrying a failed task. Caps exponential backoff
/// so that high retry counts do not produce excessively long delays.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// Timeout applied to tasks stored without one.
const FALLBACK_TIMEOUT_SECS: u64 = 3600;

/// Computes backoff in seconds for a given retry count (exponential with cap).
#[inline]
pub(crate) fn compute_retry_backoff_seconds(retry_count: i32) -> u64 {
    2_u64
        .saturating_pow(retry_count.max(0) as u32)
        .min(MAX_RETRY_BACKOFF_SECS)
}

/// Error code of the pipeline error behind `err`, if any.
fn error_code(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(te) = err.downcast_ref::<TaskError>() {
        return te
            .inner()
            .downcast_ref::<PipelineError>()
            .map(PipelineError::error_code);
    }
    err.chain()
        .find_map(|e| e.downcast_ref::<PipelineError>())
        .map(PipelineError::error_code)
}

#[derive(Clone, Debug)]
pub struct TaskQueueConfig {
    pub max_workers: usize,
    pub poll_interval_ms: u64,
    pub default_timeout_seconds: i32,
    pub max_retries: i32,
    /// Interval in seconds between runs of the stale task reaper. 0 = disabled.
    pub stale_task_reap_interval_secs: u64,
    /// Grace period in seconds added to task timeout before reaping stale running tasks.
    pub stale_task_grace_period_secs: i64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            poll_interval_ms: 1000,
            default_timeout_seconds: 300,
            max_retries: 3,
            stale_task_reap_interval_secs: 60,
            stale_task_grace_period_secs: 300,
        }
    }
}

impl TaskQueueConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_workers: config.task_queue_max_workers,
            poll_interval_ms: config.task_queue_poll_interval_ms,
            default_timeout_seconds: config.task_queue_default_timeout_seconds,
            max_retries: config.task_queue_max_retries,
            stale_task_reap_interval_secs: config.task_queue_stale_task_reap_interval_secs,
            stale_task_grace_period_secs: config.task_queue_stale_task_grace_period_secs,
        }
    }
}

pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    rate_limiter: RateLimiter,
    config: TaskQueueConfig,
    shutdown_tx: mpsc::Sender<()>,
}

impl TaskQueue {
    /// Create a TaskQueue and spawn its worker pool.
    ///
    /// If `pool` is `Some`, the worker uses PostgreSQL LISTEN/NOTIFY to wake immediately
    /// when tasks are created, in addition to polling at `poll_interval_ms`.
    /// If `pool` is `None`, only polling is used.
    pub fn new(
        store: Arc<dyn TaskStore>,
        rate_limiter: RateLimiter,
        config: TaskQueueConfig,
        context: Weak<dyn TaskHandlerContext>,
        pool: Option<sqlx::PgPool>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let store_clone = store.clone();
        let limiter_clone = rate_limiter.clone();
        let config_clone = config.clone();

        tokio::spawn(async move {
            Self::worker_pool(
                store_clone,
                limiter_clone,
                config_clone,
                context,
                shutdown_rx,
                pool,
            )
            .await;
        });

        Self {
            store,
            rate_limiter,
            config,
            shutdown_tx,
        }
    }

    /// Creates a TaskQueue that does not spawn a worker.
    ///
    /// Submitted chains are written to the store and picked up by whichever
    /// worker pool runs against it, or processed inline with [`TaskQueue::drain`].
    pub fn new_no_worker(
        store: Arc<dyn TaskStore>,
        rate_limiter: RateLimiter,
        config: TaskQueueConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        drop(shutdown_rx);
        Self {
            store,
            rate_limiter,
            config,
            shutdown_tx,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    fn head_task(
        &self,
        pipeline_id: Uuid,
        chain: &TaskChain,
        priority: Priority,
    ) -> Result<NewTask, PipelineError> {
        NewTask::from_links(
            pipeline_id,
            &chain.links,
            &chain.on_failure,
            priority,
            self.config.max_retries,
            Some(self.config.default_timeout_seconds),
        )
        .ok_or_else(|| PipelineError::Submission("Cannot submit an empty chain".to_string()))
    }

    fn submission_error(pipeline_id: Uuid, err: anyhow::Error) -> PipelineError {
        tracing::error!(
            error = %err,
            pipeline_id = %pipeline_id,
            "Failed to create task in store"
        );
        PipelineError::Submission(format!("Failed to create task in store: {:#}", err))
    }

    /// Persist the head of `chain` as a task carrying the remaining links and
    /// the compensation links.
    #[tracing::instrument(skip(self, chain), fields(stages = ?chain.task_types()))]
    pub async fn submit_chain(
        &self,
        pipeline_id: Uuid,
        chain: &TaskChain,
        priority: Priority,
    ) -> Result<Task, PipelineError> {
        let new_task = self.head_task(pipeline_id, chain, priority)?;
        let task = self
            .store
            .create_task(new_task)
            .await
            .map_err(|e| Self::submission_error(pipeline_id, e))?;

        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            pipeline_id = %pipeline_id,
            priority = priority.as_i32(),
            "Chain submitted to queue"
        );

        Ok(task)
    }

    /// Like [`TaskQueue::submit_chain`], but the head task is only persisted
    /// together with the PENDING → PROCESSING claim of `record_id`.
    ///
    /// Returns `Ok(None)` when the record is missing or not PENDING. On error
    /// neither the claim nor the task is stored.
    #[tracing::instrument(skip(self, chain), fields(stages = ?chain.task_types()))]
    pub async fn submit_chain_for_record(
        &self,
        record_id: Uuid,
        pipeline_id: Uuid,
        chain: &TaskChain,
        priority: Priority,
    ) -> Result<Option<Task>, PipelineError> {
        let new_task = self.head_task(pipeline_id, chain, priority)?;
        let task = self
            .store
            .create_task_for_record(record_id, new_task)
            .await
            .map_err(|e| Self::submission_error(pipeline_id, e))?;

        if let Some(ref task) = task {
            tracing::info!(
                task_id = %task.id,
                task_type = %task.task_type,
                pipeline_id = %pipeline_id,
                priority = priority.as_i32(),
                "Record claimed, chain submitted to queue"
            );
        }

        Ok(task)
    }

    /// Process ready tasks inline, one at a time, until none is left.
    ///
    /// Tasks scheduled for a later retry are not waited for. Returns the number
    /// of tasks processed.
    pub async fn drain(&self, context: Arc<dyn TaskHandlerContext>) -> Result<usize> {
        let mut processed = 0;
        while let Some(task) = self
            .store
            .claim_next_task()
            .await
            .context("Failed to claim task from queue")?
        {
            processed += 1;
            if let Err(e) =
                Self::process_task(task, &self.store, &self.rate_limiter, context.clone()).await
            {
                tracing::debug!(error = %e, "Task did not complete");
            }
        }
        Ok(processed)
    }

    async fn worker_pool(
        store: Arc<dyn TaskStore>,
        rate_limiter: RateLimiter,
        config: TaskQueueConfig,
        context: Weak<dyn TaskHandlerContext>,
        mut shutdown_rx: mpsc::Receiver<()>,
        pool: Option<sqlx::PgPool>,
    ) {
        let use_listen = pool.is_some();
        tracing::info!(
            max_workers = config.max_workers,
            poll_interval_ms = config.poll_interval_ms,
            listen_notify = use_listen,
            "Task queue worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(config.max_workers));
        let poll_interval = Duration::from_millis(config.poll_interval_ms);

        // Wakes the main loop when LISTEN receives a NOTIFY.
        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(16);
        if let Some(pool) = pool {
            let tx = notify_tx.clone();
            tokio::spawn(async move {
                loop {
                    match sqlx::postgres::PgListener::connect_with(&pool).await {
                        Ok(mut listener) => {
                            if let Err(e) = listener.listen(TASK_NOTIFY_CHANNEL).await {
                                tracing::warn!(error = %e, "LISTEN failed, will retry");
                                sleep(Duration::from_secs(5)).await;
                                continue;
                            }
                            while listener.recv().await.is_ok() {
                                let _ = tx.send(()).await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "PgListener connect failed, will retry");
                            sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            });
        }

        let (reaper_shutdown_tx, mut reaper_shutdown_rx) = mpsc::channel::<()>(1);
        if config.stale_task_reap_interval_secs > 0 {
            let reaper_store = store.clone();
            let reap_interval = Duration::from_secs(config.stale_task_reap_interval_secs);
            let grace_period = config.stale_task_grace_period_secs;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reap_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            match reaper_store.reap_stale_running_tasks(grace_period).await {
                                Ok(0) => {}
                                Ok(reaped) => tracing::warn!(reaped, "Reaped stale running tasks"),
                                Err(e) => tracing::error!(error = %e, "Stale task reaper failed"),
                            }
                        }
                        _ = reaper_shutdown_rx.recv() => break,
                    }
                }
            });
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Task queue worker pool shutting down");
                    let _ = reaper_shutdown_tx.send(()).await;
                    break;
                }
                _ = notify_rx.recv() => {
                    Self::claim_and_dispatch_one(&store, &rate_limiter, &semaphore, &context).await;
                }
                _ = sleep(poll_interval) => {
                    Self::claim_and_dispatch_one(&store, &rate_limiter, &semaphore, &context).await;
                }
            }
        }

        tracing::info!("Task queue worker pool stopped");
    }

    async fn claim_and_dispatch_one(
        store: &Arc<dyn TaskStore>,
        rate_limiter: &RateLimiter,
        semaphore: &Arc<Semaphore>,
        context: &Weak<dyn TaskHandlerContext>,
    ) {
        let Some(ctx) = context.upgrade() else {
            tracing::warn!("TaskHandlerContext was dropped, skipping claim");
            return;
        };

        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!("No workers available, skipping claim");
                return;
            }
        };

        match store.claim_next_task().await {
            Ok(Some(task)) => {
                let store = store.clone();
                let limiter = rate_limiter.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = Self::process_task(task, &store, &limiter, ctx).await {
                        tracing::error!(error = %e, "Task processing failed");
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                tracing::trace!("No tasks available in queue");
            }
            Err(e) => {
                drop(permit);
                tracing::error!(error = %e, "Failed to claim task from queue");
            }
        }
    }

    #[tracing::instrument(
        skip(task, store, rate_limiter, context),
        fields(task.id = %task.id, task.type = %task.task_type, pipeline_id = %task.pipeline_id)
    )]
    async fn process_task(
        task: Task,
        store: &Arc<dyn TaskStore>,
        rate_limiter: &RateLimiter,
        context: Arc<dyn TaskHandlerContext>,
    ) -> Result<()> {
        rate_limiter.acquire(task.task_type).await;

        let timeout_duration = task
            .timeout_seconds
            .filter(|s| *s > 0)
            .map(|s| Duration::from_secs(s as u64))
            .unwrap_or(Duration::from_secs(FALLBACK_TIMEOUT_SECS));

        match tokio::time::timeout(timeout_duration, context.dispatch_task(&task)).await {
            Ok(Ok(result)) => Self::advance(&task, result, store).await,
            Ok(Err(e)) => {
                let disposition = FailureDisposition::of(&e);
                Self::handle_failure(&task, e, disposition, store).await
            }
            Err(_) => {
                let e = anyhow::anyhow!(
                    "Task execution timed out after {}s",
                    timeout_duration.as_secs()
                );
                let disposition = FailureDisposition {
                    recoverable: true,
                    compensable: true,
                };
                Self::handle_failure(&task, e, disposition, store).await
            }
        }
    }

    async fn advance(
        task: &Task,
        result: serde_json::Value,
        store: &Arc<dyn TaskStore>,
    ) -> Result<()> {
        let next = NewTask::next_after(task, result.clone());
        let enqueued = store
            .complete_and_advance(task, result, next)
            .await
            .context("Failed to mark task as completed")?;

        match enqueued {
            Some(next) => tracing::info!(
                task_id = %task.id,
                next_task_id = %next.id,
                next_task_type = %next.task_type,
                "Task completed, chain advanced"
            ),
            None => tracing::info!(task_id = %task.id, "Task completed"),
        }
        Ok(())
    }

    async fn handle_failure(
        task: &Task,
        err: anyhow::Error,
        disposition: FailureDisposition,
        store: &Arc<dyn TaskStore>,
    ) -> Result<()> {
        let error_result = json!({
            "error": format!("{:#}", err),
            "error_code": error_code(&err),
            "retry_count": task.retry_count,
            "recoverable": disposition.recoverable,
            "compensable": disposition.compensable,
        });

        tracing::error!(
            task_id = %task.id,
            error = %err,
            retry_count = task.retry_count,
            max_retries = task.max_retries,
            recoverable = disposition.recoverable,
            "Task execution failed"
        );

        if disposition.recoverable && task.can_retry() {
            let backoff_seconds = compute_retry_backoff_seconds(task.retry_count);
            tracing::info!(
                task_id = %task.id,
                retry_count = task.retry_count + 1,
                backoff_seconds = backoff_seconds,
                "Scheduling task retry"
            );
            let retried = store
                .schedule_retry(task, Duration::from_secs(backoff_seconds), error_result)
                .await
                .context("Failed to schedule task retry")?;
            if retried.is_none() {
                tracing::warn!(
                    task_id = %task.id,
                    "Attempt was reaped, retry left to its new owner"
                );
            }
            return Ok(());
        }

        let compensation = if disposition.compensable {
            NewTask::compensation_for(task)
        } else {
            None
        };
        let enqueued = store
            .fail_and_compensate(task, error_result, compensation)
            .await
            .context("Failed to mark task as failed")?;

        match enqueued {
            Some(compensation) => tracing::warn!(
                task_id = %task.id,
                compensation_task_id = %compensation.id,
                "Task failed, compensation chain submitted"
            ),
            None => tracing::error!(
                task_id = %task.id,
                compensable = disposition.compensable,
                "Task failed, no compensation submitted"
            ),
        }
        Err(err)
    }

    /// Signals the worker pool to stop claiming new tasks and exit the main loop.
    ///
    /// Returns immediately after sending the signal; already-spawned task
    /// handlers keep running until they complete or time out.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating task queue shutdown");
        let _ = self.shutdown_tx.send(()).await;
    }
}

impl Clone for TaskQueue {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            rate_limiter: self.rate_limiter.clone(),
            config: self.config.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }
}
