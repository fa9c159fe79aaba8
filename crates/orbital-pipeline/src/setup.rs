//! Wiring of stores, stages and the task queue for binaries.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::sync::Arc;

use orbital_core::Config;
use orbital_db::{
    setup::{connect, run_migrations},
    DocumentRepository, ImageRecordRepository, TaskRepository,
};
use orbital_infra::RateLimiter;
use orbital_services::{sender_address, MailTransport, OutboxMailer, SmtpMailer};
use orbital_worker::{TaskHandlerContext, TaskQueue, TaskQueueConfig};

use crate::orchestrator::Orchestrator;
use crate::state::PipelineState;

/// Whether the process runs the worker pool or only submits and inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Worker,
    SubmitOnly,
}

pub struct PipelineRuntime {
    pub config: Config,
    pub pool: PgPool,
    pub state: Arc<PipelineState>,
    pub orchestrator: Orchestrator,
}

impl PipelineRuntime {
    pub fn queue(&self) -> &TaskQueue {
        self.orchestrator.queue()
    }

    /// Dispatch context for processing tasks inline.
    pub fn context(&self) -> Arc<dyn TaskHandlerContext> {
        self.state.clone()
    }
}

/// SMTP transport when a relay is configured, otherwise the logging outbox.
pub fn mail_transport(config: &Config) -> Result<Arc<dyn MailTransport>> {
    match SmtpMailer::from_config(config)? {
        Some(mailer) => Ok(Arc::new(mailer)),
        None => {
            tracing::warn!("SMTP_HOST not set, notifications are only logged");
            Ok(Arc::new(OutboxMailer::new()))
        }
    }
}

pub async fn initialize(config: Config, mode: QueueMode) -> Result<PipelineRuntime> {
    let pool = connect(&config).await?;
    run_migrations(&pool).await?;

    let records = Arc::new(ImageRecordRepository::new(pool.clone()));
    let documents = Arc::new(DocumentRepository::new(pool.clone()));
    let tasks = Arc::new(TaskRepository::new(pool.clone()));

    let mailer = mail_transport(&config).context("Failed to configure mail transport")?;
    let state = Arc::new(PipelineState::new(
        records.clone(),
        documents,
        mailer,
        sender_address(&config),
        config.remove_after_processing,
    ));

    let rate_limiter = RateLimiter::new(config.task_queue_notify_rate_limit);
    let queue_config = TaskQueueConfig::from_config(&config);

    let queue = match mode {
        QueueMode::Worker => {
            let context: Arc<dyn TaskHandlerContext> = state.clone();
            let queue = TaskQueue::new(
                tasks,
                rate_limiter,
                queue_config,
                Arc::downgrade(&context),
                Some(pool.clone()),
            );
            tracing::info!(
                max_workers = config.task_queue_max_workers,
                notify_rate_limit = config.task_queue_notify_rate_limit,
                remove_after_processing = config.remove_after_processing,
                "Task queue system initialized successfully"
            );
            queue
        }
        QueueMode::SubmitOnly => TaskQueue::new_no_worker(tasks, rate_limiter, queue_config),
    };

    Ok(PipelineRuntime {
        orchestrator: Orchestrator::new(records, queue),
        state,
        pool,
        config,
    })
}
