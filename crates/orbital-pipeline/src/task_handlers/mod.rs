mod document_handler;
mod extract_handler;
mod notification_handler;
mod status_handler;

pub use document_handler::DocumentTaskHandler;
pub use extract_handler::ExtractTaskHandler;
pub use notification_handler::NotificationTaskHandler;
pub use status_handler::StatusTaskHandler;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use orbital_core::models::{Task, TaskPayload};
use orbital_core::PipelineError;

use crate::state::PipelineState;

/// One pipeline stage as seen by the worker.
///
/// The returned value is handed to the next link of the chain as its leading
/// argument. Errors should carry a [`PipelineError`] so the worker can decide
/// between retry, compensation and plain failure.
#[async_trait]
pub trait TaskHandler {
    async fn process(&self, task: &Task, state: Arc<PipelineState>) -> Result<serde_json::Value>;
}

/// Bound arguments of `task`; a mismatch is a malformed task.
pub(crate) fn payload<P: TaskPayload>(task: &Task) -> Result<P, PipelineError> {
    task.try_payload_as::<P>()
        .map_err(|e| PipelineError::MalformedTask(format!("{} payload: {}", task.task_type, e)))
}

/// Status literal passed as the leading argument. Anything other than a
/// string is reported as an invalid status.
pub(crate) fn status_input(task: &Task) -> Result<String, PipelineError> {
    match &task.input {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(PipelineError::InvalidStatus(other.to_string())),
        None => Err(PipelineError::InvalidStatus("<missing>".to_string())),
    }
}
