use super::{payload, status_input, TaskHandler};
use crate::state::PipelineState;
use anyhow::Result;
use async_trait::async_trait;
use orbital_core::models::{status_literal, ImageStatus, SendNotificationPayload, Task};
use std::sync::Arc;

pub struct NotificationTaskHandler;

#[async_trait]
impl TaskHandler for NotificationTaskHandler {
    #[tracing::instrument(skip(self, task, state), fields(task.id = %task.id))]
    async fn process(&self, task: &Task, state: Arc<PipelineState>) -> Result<serde_json::Value> {
        let payload: SendNotificationPayload = payload(task)?;
        let status: ImageStatus = status_input(task)?.parse()?;

        let status = state
            .notifier
            .notify(status, &payload.recipient, &payload.display_name)
            .await?;
        Ok(status_literal(status))
    }
}
