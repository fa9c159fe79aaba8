//! PostgreSQL repositories
//!
//! One repository per store: image records (relational status field), metadata
//! documents (JSONB bodies keyed by record id) and the durable task queue.

pub mod document;
pub mod image;
pub mod task;

pub use document::DocumentRepository;
pub use image::ImageRecordRepository;
pub use task::{TaskRepository, TASK_NOTIFY_CHANNEL};
