use super::{payload, status_input, TaskHandler};
use crate::state::PipelineState;
use anyhow::Result;
use async_trait::async_trait;
use orbital_core::models::{SetStatusPayload, Task};
use serde_json::json;
use std::sync::Arc;

/// Last link of both chains. Its result is recorded on the task only.
pub struct StatusTaskHandler;

#[async_trait]
impl TaskHandler for StatusTaskHandler {
    #[tracing::instrument(skip(self, task, state), fields(task.id = %task.id))]
    async fn process(&self, task: &Task, state: Arc<PipelineState>) -> Result<serde_json::Value> {
        let payload: SetStatusPayload = payload(task)?;
        let literal = status_input(task)?;

        let outcome = state
            .status_updater
            .set_status(&literal, payload.record_id)
            .await?;

        Ok(json!({
            "record_id": payload.record_id,
            "status": literal,
            "outcome": outcome.label(),
        }))
    }
}
