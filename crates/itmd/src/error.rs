//! Error types for itmd.
//!
//! All errors implement `std::error::Error` via `thiserror`. Jobs return
//! [`itm_common::TaskResult`]; the `From` impl below lets them propagate
//! store and provisioner failures with `?` while keeping the retry
//! classification.

use std::io;

use itm_common::TaskError;
use thiserror::Error;

/// Result type alias for itmd operations.
pub type ItmResult<T> = Result<T, ItmError>;

/// Errors that can occur in the transport manager.
#[derive(Debug, Error)]
pub enum ItmError {
    /// A store operation exceeded its deadline.
    #[error("Store operation '{operation}' timed out after {timeout_ms}ms")]
    StoreTimeout {
        /// The operation that timed out (e.g., "read", "commit").
        operation: String,
        /// The configured deadline.
        timeout_ms: u64,
    },

    /// A store transaction conflicted with a concurrent writer.
    #[error("Store conflict on {table}:{key}")]
    StoreConflict {
        /// The table name.
        table: String,
        /// The key.
        key: String,
    },

    /// Any other store failure.
    #[error("Store operation failed: {operation}: {message}")]
    Store {
        /// The operation that failed.
        operation: String,
        /// Error message.
        message: String,
    },

    /// A stored record could not be decoded.
    #[error("Malformed record {table}:{key}: {source}")]
    Codec {
        /// The table name.
        table: String,
        /// The key.
        key: String,
        /// The decoding error.
        #[source]
        source: serde_json::Error,
    },

    /// The tunnel provisioning collaborator rejected a command.
    #[error("Provisioner rejected {command}: {message}")]
    Provisioner {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// The coordinator refused a submission because it is shutting down.
    #[error("Coordinator is shutting down, job '{key}' was cancelled")]
    CoordinatorClosed {
        /// The job key.
        key: String,
    },

    /// IO error (configuration file access).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TOML parse error.
    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Metrics registry error.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl ItmError {
    /// Creates a store error.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::StoreConflict {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Creates a provisioner error.
    pub fn provisioner(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provisioner {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ItmError::StoreTimeout { .. }
                | ItmError::StoreConflict { .. }
                | ItmError::Store { .. }
                | ItmError::Provisioner { .. }
        )
    }
}

impl From<ItmError> for TaskError {
    fn from(err: ItmError) -> Self {
        match err {
            ItmError::StoreTimeout { timeout_ms, .. } => TaskError::timeout(timeout_ms),
            ItmError::CoordinatorClosed { key } => TaskError::cancelled(key),
            ItmError::InvalidConfig { .. } => TaskError::invalid_entry(err.to_string()),
            e if e.is_retryable() => TaskError::transient(e.to_string()),
            e => TaskError::internal(e.to_string()),
        }
    }
}
