//! Task processing status and error types.

use thiserror::Error;

/// Coarse outcome of processing a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Job ran to completion
    Success,
    /// Task failed transiently and may succeed on retry
    NeedRetry,
    /// Task input was inconsistent
    InvalidEntry,
    /// Task failed permanently
    Failed,
    /// Task was refused or dropped during shutdown
    Cancelled,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::NeedRetry)
    }

    /// Returns the label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::NeedRetry => "need_retry",
            TaskStatus::InvalidEntry => "invalid_entry",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Why a job attempt did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Store read/write conflict or similar transient condition
    #[error("Transient failure: {reason}")]
    Transient { reason: String },

    /// Task (or one of its suspension points) exceeded its deadline
    #[error("Timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// Task input was inconsistent
    #[error("Invalid entry: {message}")]
    InvalidEntry { message: String },

    /// Programming invariant violated
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Task was refused because the scheduler is shutting down
    #[error("Cancelled: {key}")]
    Cancelled { key: String },
}

impl TaskError {
    pub fn transient(reason: impl Into<String>) -> Self {
        TaskError::Transient {
            reason: reason.into(),
        }
    }

    pub fn timeout(after_ms: u64) -> Self {
        TaskError::Timeout { after_ms }
    }

    pub fn invalid_entry(message: impl Into<String>) -> Self {
        TaskError::InvalidEntry {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        TaskError::Internal {
            message: message.into(),
        }
    }

    pub fn cancelled(key: impl Into<String>) -> Self {
        TaskError::Cancelled { key: key.into() }
    }

    /// Returns true if retrying the task may succeed.
    pub fn is_retryable(&self) -> bool {
        self.to_status().is_retryable()
    }

    /// Maps the error onto the coarse status used for retry decisions.
    pub fn to_status(&self) -> TaskStatus {
        match self {
            TaskError::Transient { .. } | TaskError::Timeout { .. } => TaskStatus::NeedRetry,
            TaskError::InvalidEntry { .. } => TaskStatus::InvalidEntry,
            TaskError::Internal { .. } => TaskStatus::Failed,
            TaskError::Cancelled { .. } => TaskStatus::Cancelled,
        }
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
