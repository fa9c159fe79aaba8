use super::{payload, TaskHandler};
use crate::state::PipelineState;
use anyhow::Result;
use async_trait::async_trait;
use orbital_core::models::{status_literal, ImageMetadata, Task, WriteDocumentPayload};
use orbital_core::PipelineError;
use std::sync::Arc;

pub struct DocumentTaskHandler;

#[async_trait]
impl TaskHandler for DocumentTaskHandler {
    #[tracing::instrument(skip(self, task, state), fields(task.id = %task.id))]
    async fn process(&self, task: &Task, state: Arc<PipelineState>) -> Result<serde_json::Value> {
        let payload: WriteDocumentPayload = payload(task)?;
        let metadata: ImageMetadata = task
            .try_input_as()
            .map_err(|e| PipelineError::MalformedTask(format!("metadata map: {}", e)))?;

        let status = state
            .document_writer
            .write(payload.record_id, metadata)
            .await?;
        Ok(status_literal(status))
    }
}
