//! Orbital Database Layer
//!
//! Store traits for image records, metadata documents and tasks, with
//! PostgreSQL repositories and in-process implementations.

pub mod db;
pub mod memory;
pub mod setup;
pub mod store_traits;

// Re-exports: PostgreSQL repositories
pub use db::{DocumentRepository, ImageRecordRepository, TaskRepository, TASK_NOTIFY_CHANNEL};

// Re-exports: In-process stores
pub use memory::{MemoryDocumentStore, MemoryImageRecordStore, MemoryTaskStore};

// Re-exports: Store traits
pub use store_traits::{DocumentStore, ImageRecordStore, TaskStore};
