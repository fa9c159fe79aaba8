//! Orbital Core Library
//!
//! Domain models, task models, error types and configuration shared by every
//! crate of the image processing pipeline.

pub mod config;
pub mod constants;
pub mod error;
pub mod models;
pub mod task_error;

// Re-export commonly used types
pub use config::Config;
pub use error::PipelineError;
pub use task_error::{TaskError, TaskResultExt};
