//! Error types module
//!
//! Every stage of the pipeline reports failures through [`PipelineError`]. Each
//! variant knows two things about itself: whether the executor should retry it
//! and whether a failure of this kind, once final, collapses the run into the
//! compensation chain.

use std::io;

use uuid::Uuid;

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The image resource could not be opened or decoded.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Document store or relational store unavailable, or a write was rejected.
    #[error("Store error: {0}")]
    Store(String),

    /// The email transport rejected the message.
    #[error("Notification error: {0}")]
    Notification(String),

    /// A recipient or sender that is not a valid mailbox. Resending cannot fix it.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A status literal outside PENDING, PROCESSING, COMPLETED, FAILED.
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Record not found: {0}")]
    NotFound(Uuid),

    /// The executor refused to accept a chain.
    #[error("Submission error: {0}")]
    Submission(String),

    /// A task payload or upstream value that does not match its stage contract.
    #[error("Malformed task: {0}")]
    MalformedTask(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether the executor should redeliver the stage after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Store(_) | PipelineError::Notification(_) | PipelineError::Submission(_)
        )
    }

    /// Whether a final failure of this kind triggers the compensation chain.
    ///
    /// Invalid status values, unknown records and malformed tasks mean the
    /// request itself is wrong; they surface as plain task failures.
    pub fn is_compensable(&self) -> bool {
        matches!(
            self,
            PipelineError::Extraction(_)
                | PipelineError::Store(_)
                | PipelineError::Notification(_)
                | PipelineError::InvalidAddress(_)
                | PipelineError::Submission(_)
        )
    }

    /// Machine-readable error code recorded in failed task results.
    pub fn error_code(&self) -> &'static str {
        match self {
            PipelineError::Extraction(_) => "EXTRACTION_ERROR",
            PipelineError::Store(_) => "STORE_ERROR",
            PipelineError::Notification(_) => "NOTIFICATION_ERROR",
            PipelineError::InvalidAddress(_) => "INVALID_ADDRESS",
            PipelineError::InvalidStatus(_) => "INVALID_STATUS",
            PipelineError::NotFound(_) => "NOT_FOUND",
            PipelineError::Submission(_) => "SUBMISSION_ERROR",
            PipelineError::MalformedTask(_) => "MALFORMED_TASK",
            PipelineError::Config(_) => "CONFIG_ERROR",
        }
    }
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for PipelineError {
    fn from(err: SqlxError) -> Self {
        PipelineError::Store(err.to_string())
    }
}

impl From<io::Error> for PipelineError {
    fn from(err: io::Error) -> Self {
        PipelineError::Extraction(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::MalformedTask(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compensable_errors() {
        assert!(PipelineError::Extraction("corrupt".into()).is_compensable());
        assert!(PipelineError::Store("down".into()).is_compensable());
        assert!(PipelineError::Submission("queue".into()).is_compensable());
        assert!(PipelineError::Notification("smtp".into()).is_compensable());
        assert!(PipelineError::InvalidAddress("to".into()).is_compensable());
        assert!(!PipelineError::InvalidStatus("DONE".into()).is_compensable());
        assert!(!PipelineError::NotFound(Uuid::nil()).is_compensable());
        assert!(!PipelineError::MalformedTask("x".into()).is_compensable());
    }

    #[test]
    fn recoverable_errors() {
        assert!(PipelineError::Store("down".into()).is_recoverable());
        assert!(PipelineError::Notification("smtp".into()).is_recoverable());
        assert!(!PipelineError::InvalidAddress("to".into()).is_recoverable());
        assert!(!PipelineError::Extraction("corrupt".into()).is_recoverable());
        assert!(!PipelineError::InvalidStatus("DONE".into()).is_recoverable());
        assert!(!PipelineError::NotFound(Uuid::nil()).is_recoverable());
    }

    #[test]
    fn io_error_maps_to_extraction() {
        let err: PipelineError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.error_code(), "EXTRACTION_ERROR");
        assert!(err.to_string().contains("gone"));
    }
}
