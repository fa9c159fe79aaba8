//! Pipeline orchestrator.
//!
//! Builds the forward chain and the compensation chain for one upload event and
//! hands them to the task queue. The forward chain carries the compensation
//! chain as its failure links, so once submitted the worker alone decides which
//! of the two runs to completion.

use std::sync::Arc;

use orbital_core::models::{
    status_literal, ChainLink, ExtractMetadataPayload, ImageStatus, PipelineInput, Priority,
    SendNotificationPayload, SetStatusPayload, TaskChain, WriteDocumentPayload,
};
use orbital_core::PipelineError;
use orbital_db::ImageRecordStore;
use orbital_worker::TaskQueue;
use serde_json::json;
use uuid::Uuid;

/// What [`Orchestrator::run`] did with an upload event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The forward chain was queued.
    Submitted { pipeline_id: Uuid, task_id: Uuid },
    /// The forward chain could not be queued; the compensation chain was.
    Compensating { pipeline_id: Uuid, task_id: Uuid },
    /// The record was not PENDING, nothing was queued.
    Skipped { status: ImageStatus },
}

impl RunOutcome {
    pub fn pipeline_id(&self) -> Option<Uuid> {
        match self {
            RunOutcome::Submitted { pipeline_id, .. }
            | RunOutcome::Compensating { pipeline_id, .. } => Some(*pipeline_id),
            RunOutcome::Skipped { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    records: Arc<dyn ImageRecordStore>,
    queue: TaskQueue,
}

impl Orchestrator {
    pub fn new(records: Arc<dyn ImageRecordStore>, queue: TaskQueue) -> Self {
        Self { records, queue }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Extract(path) → WriteDocument(record_id) → Notify(recipient, name) → SetStatus(record_id).
    pub fn forward_chain(input: &PipelineInput) -> TaskChain {
        TaskChain::new()
            .then(
                ChainLink::new(&ExtractMetadataPayload {
                    record_id: input.record_id,
                })
                .with_input(json!(input.resource_path.to_string_lossy())),
            )
            .then(ChainLink::new(&WriteDocumentPayload {
                record_id: input.record_id,
            }))
            .then(ChainLink::new(&Self::notification(input)))
            .then(ChainLink::new(&SetStatusPayload {
                record_id: input.record_id,
            }))
    }

    /// Notify(FAILED, recipient, name) → SetStatus(record_id).
    pub fn compensation_chain(input: &PipelineInput) -> TaskChain {
        TaskChain::new()
            .then(
                ChainLink::new(&Self::notification(input))
                    .with_input(status_literal(ImageStatus::Failed)),
            )
            .then(ChainLink::new(&SetStatusPayload {
                record_id: input.record_id,
            }))
    }

    fn notification(input: &PipelineInput) -> SendNotificationPayload {
        SendNotificationPayload {
            recipient: input.recipient.clone(),
            display_name: input.display_name.clone(),
        }
    }

    /// Start the pipeline for one upload event and return without waiting for it.
    ///
    /// The head task is stored in the same step that moves the record from
    /// PENDING to PROCESSING, so a record is never PROCESSING without a queued
    /// task. Any other status means another run owns or finished it and nothing
    /// is queued. If the forward chain cannot be queued the compensation chain
    /// is queued instead. If that fails too the record is set to FAILED here and
    /// the submission error is returned.
    #[tracing::instrument(skip(self, input), fields(record_id = %input.record_id))]
    pub async fn run(&self, input: PipelineInput) -> Result<RunOutcome, PipelineError> {
        let record_id = input.record_id;
        let pipeline_id = Uuid::new_v4();
        let compensation = Self::compensation_chain(&input);
        let forward = Self::forward_chain(&input).on_failure(compensation.clone());

        let submit_error = match self
            .queue
            .submit_chain_for_record(record_id, pipeline_id, &forward, Priority::Normal)
            .await
        {
            Ok(Some(task)) => {
                tracing::info!(
                    pipeline_id = %pipeline_id,
                    task_id = %task.id,
                    "Pipeline started"
                );
                return Ok(RunOutcome::Submitted {
                    pipeline_id,
                    task_id: task.id,
                });
            }
            Ok(None) => return self.skipped(record_id).await,
            Err(e) => e,
        };

        tracing::warn!(
            error = %submit_error,
            pipeline_id = %pipeline_id,
            "Forward chain submission failed, submitting compensation chain"
        );

        match self
            .queue
            .submit_chain_for_record(record_id, pipeline_id, &compensation, Priority::High)
            .await
        {
            Ok(Some(task)) => Ok(RunOutcome::Compensating {
                pipeline_id,
                task_id: task.id,
            }),
            Ok(None) => self.skipped(record_id).await,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    pipeline_id = %pipeline_id,
                    "Compensation chain submission failed, marking record failed"
                );
                // Neither submission stored its claim, the record is still PENDING.
                self.records
                    .update_status_from(record_id, &[ImageStatus::Pending], ImageStatus::Failed)
                    .await
                    .map_err(|e| PipelineError::Store(format!("{:#}", e)))?;
                Err(e)
            }
        }
    }

    /// Outcome for a record that could not be claimed.
    async fn skipped(&self, record_id: Uuid) -> Result<RunOutcome, PipelineError> {
        let record = self
            .records
            .get(record_id)
            .await
            .map_err(|e| PipelineError::Store(format!("{:#}", e)))?
            .ok_or(PipelineError::NotFound(record_id))?;
        tracing::info!(status = %record.status, "Record is not pending, pipeline not started");
        Ok(RunOutcome::Skipped {
            status: record.status,
        })
    }
}
