use anyhow::Context;
use orbital_pipeline::RunOutcome;
use serde_json::{json, Value};
use uuid::Uuid;

/// Parse record ids given on the command line, naming the first bad one.
pub fn parse_record_ids(raw: &[String]) -> anyhow::Result<Vec<Uuid>> {
    raw.iter()
        .map(|s| Uuid::parse_str(s).with_context(|| format!("Invalid record id: {}", s)))
        .collect()
}

pub fn outcome_json(outcome: &RunOutcome) -> Value {
    match outcome {
        RunOutcome::Submitted {
            pipeline_id,
            task_id,
        } => json!({"outcome": "submitted", "pipeline_id": pipeline_id, "task_id": task_id}),
        RunOutcome::Compensating {
            pipeline_id,
            task_id,
        } => json!({"outcome": "compensating", "pipeline_id": pipeline_id, "task_id": task_id}),
        RunOutcome::Skipped { status } => json!({"outcome": "skipped", "status": status}),
    }
}

/// Initialize tracing for the CLI binary.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}
