//! Orbital Pipeline
//!
//! Wires the stages into the task executor: stage handlers, the dispatch
//! context and the orchestrator that submits forward and compensation chains.

pub mod orchestrator;
pub mod setup;
pub mod state;
pub mod task_dispatch;
pub mod task_handlers;

pub use orchestrator::{Orchestrator, RunOutcome};
pub use state::PipelineState;
