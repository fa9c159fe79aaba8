use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use super::image::ImageStatus;

/// The four pipeline stages, one task type each.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ExtractMetadata,
    WriteDocument,
    SendNotification,
    SetStatus,
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskType::ExtractMetadata => write!(f, "extract_metadata"),
            TaskType::WriteDocument => write!(f, "write_document"),
            TaskType::SendNotification => write!(f, "send_notification"),
            TaskType::SetStatus => write!(f, "set_status"),
        }
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extract_metadata" => Ok(TaskType::ExtractMetadata),
            "write_document" => Ok(TaskType::WriteDocument),
            "send_notification" => Ok(TaskType::SendNotification),
            "set_status" => Ok(TaskType::SetStatus),
            _ => Err(anyhow::anyhow!("Invalid task type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Scheduled,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Scheduled => write!(f, "scheduled"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "scheduled" => Ok(TaskStatus::Scheduled),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 3,
    #[default]
    Normal = 5,
    High = 7,
    Critical = 10,
}

impl Priority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            i32::MIN..=3 => Priority::Low,
            4..=6 => Priority::Normal,
            7..=9 => Priority::High,
            _ => Priority::Critical,
        }
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority as i32
    }
}

/// One stage descriptor of a chain: which handler runs and the arguments bound
/// to it up front.
///
/// `input` is the leading argument. Only the first link of a chain sets it;
/// every later link receives the previous stage's result instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainLink {
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    pub payload: serde_json::Value,
}

impl ChainLink {
    pub fn new<P: TaskPayload>(payload: &P) -> Self {
        Self {
            task_type: P::task_type(),
            input: None,
            payload: Task::payload_from(payload),
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// An ordered list of links plus the links to run once if any of them fails
/// for good.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskChain {
    pub links: Vec<ChainLink>,
    #[serde(default)]
    pub on_failure: Vec<ChainLink>,
}

impl TaskChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, link: ChainLink) -> Self {
        self.links.push(link);
        self
    }

    pub fn on_failure(mut self, compensation: TaskChain) -> Self {
        self.on_failure = compensation.links;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Task types in execution order.
    pub fn task_types(&self) -> Vec<TaskType> {
        self.links.iter().map(|l| l.task_type).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Shared by every task of one pipeline run, forward and compensation.
    pub pipeline_id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: i32,
    /// Leading argument: the upstream result or the link's explicit input.
    pub input: Option<serde_json::Value>,
    pub payload: serde_json::Value,
    /// Links still to run after this one succeeds.
    pub chain: Vec<ChainLink>,
    /// Links to run once if this task fails for good.
    pub on_failure: Vec<ChainLink>,
    pub result: Option<serde_json::Value>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub timeout_seconds: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Task {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let links = |column: &str| -> Result<Vec<ChainLink>, sqlx::Error> {
            let value: serde_json::Value = row.try_get(column)?;
            serde_json::from_value(value).map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse {}: {}", column, e).into())
            })
        };
        Ok(Task {
            id: row.try_get("id")?,
            pipeline_id: row.try_get("pipeline_id")?,
            task_type: row.try_get::<String, _>("task_type")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse task_type: {}", e).into())
            })?,
            status: row.try_get::<String, _>("status")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse status: {}", e).into())
            })?,
            priority: row.try_get("priority")?,
            input: row.try_get("input")?,
            payload: row.try_get("payload")?,
            chain: links("chain")?,
            on_failure: links("on_failure")?,
            result: row.try_get("result")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Task {
    pub fn is_ready_to_run(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Scheduled)
            && self.scheduled_at <= Utc::now()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Extract the payload as a typed struct, returning an error on failure.
    pub fn try_payload_as<P: TaskPayload>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Decode the leading argument.
    pub fn try_input_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.input.clone().unwrap_or_default())
    }

    /// Extract the result as a typed struct.
    /// Returns None if result is not set or deserialization fails.
    pub fn result_as<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        self.result
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Create a new payload from a typed struct.
    pub fn payload_from<P: TaskPayload>(payload: &P) -> serde_json::Value {
        serde_json::to_value(payload).unwrap_or_default()
    }
}

/// Everything needed to enqueue one task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub pipeline_id: Uuid,
    pub task_type: TaskType,
    pub input: Option<serde_json::Value>,
    pub payload: serde_json::Value,
    pub chain: Vec<ChainLink>,
    pub on_failure: Vec<ChainLink>,
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: i32,
    pub timeout_seconds: Option<i32>,
}

impl NewTask {
    /// Head of `links` as a task carrying the rest of the chain.
    /// Returns None for an empty chain.
    pub fn from_links(
        pipeline_id: Uuid,
        links: &[ChainLink],
        on_failure: &[ChainLink],
        priority: Priority,
        max_retries: i32,
        timeout_seconds: Option<i32>,
    ) -> Option<Self> {
        let (head, rest) = links.split_first()?;
        Some(Self {
            pipeline_id,
            task_type: head.task_type,
            input: head.input.clone(),
            payload: head.payload.clone(),
            chain: rest.to_vec(),
            on_failure: on_failure.to_vec(),
            priority,
            scheduled_at: None,
            max_retries,
            timeout_seconds,
        })
    }

    /// The link following `task`, fed with `result` as its leading argument.
    pub fn next_after(task: &Task, result: serde_json::Value) -> Option<Self> {
        let mut next = Self::from_links(
            task.pipeline_id,
            &task.chain,
            &task.on_failure,
            Priority::from_i32(task.priority),
            task.max_retries,
            task.timeout_seconds,
        )?;
        next.input = Some(result);
        Some(next)
    }

    /// The compensation chain of `task`, as a task without compensation of its own.
    pub fn compensation_for(task: &Task) -> Option<Self> {
        Self::from_links(
            task.pipeline_id,
            &task.on_failure,
            &[],
            Priority::High,
            task.max_retries,
            task.timeout_seconds,
        )
    }
}

/// Trait for type-safe task payloads
pub trait TaskPayload: Serialize + for<'de> Deserialize<'de> {
    fn task_type() -> TaskType;
}

/// Bound arguments of the extraction stage. The leading argument is the
/// resource path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractMetadataPayload {
    pub record_id: Uuid,
}

impl TaskPayload for ExtractMetadataPayload {
    fn task_type() -> TaskType {
        TaskType::ExtractMetadata
    }
}

/// Bound arguments of the document stage. The leading argument is the
/// metadata map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteDocumentPayload {
    pub record_id: Uuid,
}

impl TaskPayload for WriteDocumentPayload {
    fn task_type() -> TaskType {
        TaskType::WriteDocument
    }
}

/// Bound arguments of the notification stage. The leading argument is the
/// status literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendNotificationPayload {
    pub recipient: String,
    pub display_name: String,
}

impl TaskPayload for SendNotificationPayload {
    fn task_type() -> TaskType {
        TaskType::SendNotification
    }
}

/// Bound arguments of the status stage. The leading argument is the status
/// literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStatusPayload {
    pub record_id: Uuid,
}

impl TaskPayload for SetStatusPayload {
    fn task_type() -> TaskType {
        TaskType::SetStatus
    }
}

/// Status literal travelling between stages as a leading argument.
pub fn status_literal(status: ImageStatus) -> serde_json::Value {
    serde_json::Value::String(status.as_str().to_string())
}

#[derive(Debug, Default, Serialize)]
pub struct TaskStats {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub scheduled: i64,
}
