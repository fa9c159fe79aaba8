//! Orbital Worker
//!
//! The task executor: chains persisted as tasks, a worker pool claiming them,
//! and the retry / compensation policy applied when a stage fails.

pub mod context;
pub mod queue;

pub use context::TaskHandlerContext;
pub use queue::{TaskQueue, TaskQueueConfig, MAX_RETRY_BACKOFF_SECS};
