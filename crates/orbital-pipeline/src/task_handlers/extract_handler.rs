use super::{payload, TaskHandler};
use crate::state::PipelineState;
use anyhow::Result;
use async_trait::async_trait;
use orbital_core::models::{ExtractMetadataPayload, ImageMetadata, ImageStatus, Task};
use orbital_core::PipelineError;
use orbital_db::{DocumentStore, ImageRecordStore};
use orbital_processing::MetadataExtractor;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub struct ExtractTaskHandler;

#[async_trait]
impl TaskHandler for ExtractTaskHandler {
    #[tracing::instrument(skip(self, task, state), fields(task.id = %task.id, record_id = tracing::field::Empty))]
    async fn process(&self, task: &Task, state: Arc<PipelineState>) -> Result<serde_json::Value> {
        let payload: ExtractMetadataPayload = payload(task)?;
        tracing::Span::current().record("record_id", payload.record_id.to_string());

        let path: PathBuf = task
            .try_input_as()
            .map_err(|e| PipelineError::MalformedTask(format!("resource path: {}", e)))?;

        if MetadataExtractor::is_missing(&path).await {
            if let Some(metadata) = Self::previous_result(payload.record_id, &state).await? {
                tracing::info!(
                    path = %path.display(),
                    "Resource already removed by an earlier run, reusing stored metadata"
                );
                return Ok(serde_json::to_value(metadata)?);
            }
        }

        let metadata = state.extractor.extract(&path).await?;
        Ok(serde_json::to_value(metadata)?)
    }
}

impl ExtractTaskHandler {
    /// Metadata stored by an earlier successful run of this pipeline.
    ///
    /// Only trusted once the record has left PENDING; a record still PENDING
    /// has never been claimed, so a stored document cannot belong to this run.
    async fn previous_result(
        record_id: Uuid,
        state: &PipelineState,
    ) -> Result<Option<ImageMetadata>, PipelineError> {
        let record = state
            .records
            .get(record_id)
            .await
            .map_err(|e| PipelineError::Store(format!("{:#}", e)))?;
        match record {
            Some(r) if r.status != ImageStatus::Pending => {}
            _ => return Ok(None),
        }

        let document = state
            .documents
            .find_by_record_id(&record_id.to_string())
            .await
            .map_err(|e| PipelineError::Store(format!("{:#}", e)))?;
        Ok(document.map(|d| d.metadata))
    }
}
