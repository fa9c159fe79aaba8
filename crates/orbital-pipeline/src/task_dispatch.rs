//! TaskHandlerContext implementation for PipelineState.
//!
//! Dispatches tasks to the stage handler matching their task type.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use orbital_core::models::{Task, TaskType};
use orbital_worker::TaskHandlerContext;

use crate::state::PipelineState;
use crate::task_handlers::{
    DocumentTaskHandler, ExtractTaskHandler, NotificationTaskHandler, StatusTaskHandler,
    TaskHandler,
};

#[async_trait]
impl TaskHandlerContext for PipelineState {
    async fn dispatch_task(self: Arc<Self>, task: &Task) -> Result<serde_json::Value> {
        match task.task_type {
            TaskType::ExtractMetadata => ExtractTaskHandler.process(task, self).await,
            TaskType::WriteDocument => DocumentTaskHandler.process(task, self).await,
            TaskType::SendNotification => NotificationTaskHandler.process(task, self).await,
            TaskType::SetStatus => StatusTaskHandler.process(task, self).await,
        }
    }
}
