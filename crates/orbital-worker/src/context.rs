//! Task handler context trait
//!
//! The pipeline implements this trait for its state. The worker calls
//! `dispatch_task` for every claimed task; the implementation matches on the
//! task type and runs the stage.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use orbital_core::models::Task;

/// Context for task dispatch.
///
/// The worker pool holds a weak reference, so dropping the pipeline state stops
/// dispatch. The returned value becomes the leading argument of the next link
/// in the task's chain.
#[async_trait]
pub trait TaskHandlerContext: Send + Sync {
    async fn dispatch_task(self: Arc<Self>, task: &Task) -> Result<serde_json::Value>;
}
