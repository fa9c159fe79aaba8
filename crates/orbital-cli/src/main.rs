//! Orbital CLI: operate the image pipeline against the configured database.
//!
//! Reads the same environment as the worker (DATABASE_URL, SMTP_*, TASK_QUEUE_*).

use anyhow::Context;
use clap::{Parser, Subcommand};
use orbital_cli::{init_tracing, outcome_json, parse_record_ids};
use orbital_core::models::{ImageRecord, PipelineInput};
use orbital_core::Config;
use orbital_db::{DocumentStore, ImageRecordStore, TaskStore};
use orbital_pipeline::setup::{initialize, QueueMode};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "orbital", about = "Image pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Create a PENDING image record, as the upload side does
    Register {
        /// Image title shown in notifications
        title: String,
        /// Owner UUID
        #[arg(long)]
        owner: Option<Uuid>,
    },
    /// Start the pipeline for an existing record
    Trigger {
        /// Record UUID
        record_id: Uuid,
        /// Path of the uploaded file
        path: PathBuf,
        /// Address that receives the outcome email
        #[arg(long)]
        recipient: String,
        /// Display name used in the email, defaults to the record title
        #[arg(long)]
        name: Option<String>,
    },
    /// Show a record and its status
    Status {
        /// Record UUID
        record_id: Uuid,
    },
    /// Show the metadata documents attached to records
    Details {
        /// Record UUIDs
        #[arg(required = true)]
        record_ids: Vec<String>,
    },
    /// Process ready tasks in this process until none is left
    Drain,
    /// Task queue counters
    Stats,
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize output")?;
    println!("{}", out);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    let runtime = initialize(config, QueueMode::SubmitOnly).await?;
    let records = runtime.state.records.clone();

    match cli.command {
        Commands::Migrate => {
            print_json(&serde_json::json!({ "success": true, "message": "Migrations applied" }))?;
        }
        Commands::Register { title, owner } => {
            let record = ImageRecord::new(title, owner.unwrap_or_else(Uuid::new_v4));
            let created = records.create(&record).await?;
            print_json(&created)?;
        }
        Commands::Trigger {
            record_id,
            path,
            recipient,
            name,
        } => {
            let display_name = match name {
                Some(name) => name,
                None => records
                    .get(record_id)
                    .await?
                    .map(|r| r.title)
                    .with_context(|| format!("Record {} not found", record_id))?,
            };
            let input = PipelineInput::new(record_id, path, display_name, recipient);
            let outcome = runtime.orchestrator.run(input).await?;
            print_json(&outcome_json(&outcome))?;
        }
        Commands::Status { record_id } => {
            let record = records
                .get(record_id)
                .await?
                .with_context(|| format!("Record {} not found", record_id))?;
            print_json(&record)?;
        }
        Commands::Details { record_ids } => {
            let keys: Vec<String> = parse_record_ids(&record_ids)?
                .iter()
                .map(Uuid::to_string)
                .collect();
            let documents = runtime.state.documents.find_by_record_ids(&keys).await?;
            print_json(&documents)?;
        }
        Commands::Drain => {
            let processed = runtime.queue().drain(runtime.context()).await?;
            print_json(&serde_json::json!({ "processed": processed }))?;
        }
        Commands::Stats => {
            let stats = runtime.queue().store().get_stats().await?;
            print_json(&stats)?;
        }
    }

    runtime.pool.close().await;
    Ok(())
}
