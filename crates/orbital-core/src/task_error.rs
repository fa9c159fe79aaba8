//! Task execution error types
//!
//! Stage handlers return `anyhow::Result`. The worker inspects the error chain
//! to decide whether the task is retried and whether, once it fails for good,
//! the chain's compensation links are submitted.

use std::fmt;

use crate::error::PipelineError;

/// Task execution error carrying its retry and compensation policy.
#[derive(Debug)]
pub struct TaskError {
    inner: anyhow::Error,
    recoverable: bool,
    compensable: bool,
}

impl TaskError {
    /// Create a new unrecoverable task error
    ///
    /// Unrecoverable errors fail the task immediately without retrying. The
    /// failure still triggers compensation.
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
            compensable: true,
        }
    }

    /// Create a new recoverable task error
    ///
    /// Recoverable errors are retried according to the task's retry policy.
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: true,
            compensable: true,
        }
    }

    /// Create an error that fails the task without retry and without
    /// compensation (malformed request, unknown record).
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
            compensable: false,
        }
    }

    /// Check if this error is recoverable (should be retried)
    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    /// Check if a final failure with this error should run compensation
    pub fn is_compensable(&self) -> bool {
        self.compensable
    }

    /// Get the inner error
    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    /// Consume self and return the inner error
    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for TaskError {
    /// Default conversion from anyhow::Error creates a recoverable error
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err)
    }
}

impl From<PipelineError> for TaskError {
    fn from(err: PipelineError) -> Self {
        let recoverable = err.is_recoverable();
        let compensable = err.is_compensable();
        Self {
            inner: err.into(),
            recoverable,
            compensable,
        }
    }
}

/// How the worker treats a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureDisposition {
    pub recoverable: bool,
    pub compensable: bool,
}

impl FailureDisposition {
    /// Classify an error returned by a stage handler.
    ///
    /// A [`TaskError`] anywhere in the chain wins, then a [`PipelineError`].
    /// Anything else is treated as a transient, compensable fault.
    pub fn of(err: &anyhow::Error) -> Self {
        if let Some(te) = err.downcast_ref::<TaskError>() {
            return Self {
                recoverable: te.is_recoverable(),
                compensable: te.is_compensable(),
            };
        }
        if let Some(pe) = err.chain().find_map(|e| e.downcast_ref::<PipelineError>()) {
            return Self {
                recoverable: pe.is_recoverable(),
                compensable: pe.is_compensable(),
            };
        }
        Self {
            recoverable: true,
            compensable: true,
        }
    }
}

/// Extension trait for Result to easily create unrecoverable task errors
pub trait TaskResultExt<T> {
    /// Mark this result as unrecoverable on error
    fn unrecoverable(self) -> Result<T, TaskError>;

    /// Mark this result as fatal (no retry, no compensation) on error
    fn fatal(self) -> Result<T, TaskError>;
}

impl<T, E: Into<anyhow::Error>> TaskResultExt<T> for Result<T, E> {
    fn unrecoverable(self) -> Result<T, TaskError> {
        self.map_err(|e| TaskError::unrecoverable(e.into()))
    }

    fn fatal(self) -> Result<T, TaskError> {
        self.map_err(|e| TaskError::fatal(e.into()))
    }
}
