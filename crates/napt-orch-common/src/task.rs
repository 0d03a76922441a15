//! Task processing status and result types.
//!
//! Every operation exposed by the control plane returns a [`TaskResult`];
//! its error side carries a [`TaskStatus`] reason code so callers (and logs)
//! can tell a missing router from an exhausted pool or a transient failure.

use thiserror::Error;

/// Reason code of a processed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Task completed successfully
    Success,
    /// Task failed due to invalid input
    InvalidEntry,
    /// A router, node, mapping or other referenced object does not exist
    NotFound,
    /// No free identifier or port was left
    Exhausted,
    /// A dependency never became visible within its wait bound
    DependencyExpired,
    /// Collaborator call or transaction failed; worth retrying
    NeedRetry,
    /// Task was ignored (duplicate, superseded, ...)
    Ignore,
    /// Task failed (generic)
    Failed,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Ignore)
    }

    /// Returns true if the queue infrastructure should retry the task.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::NeedRetry)
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::InvalidEntry => "invalid_entry",
            TaskStatus::NotFound => "not_found",
            TaskStatus::Exhausted => "exhausted",
            TaskStatus::DependencyExpired => "dependency_expired",
            TaskStatus::NeedRetry => "need_retry",
            TaskStatus::Ignore => "ignored",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for task processing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("Invalid entry: {message}")]
    InvalidEntry { message: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Exhausted: {pool}")]
    Exhausted { pool: String },

    #[error("Dependency not visible in time: {dependency}")]
    DependencyExpired { dependency: String },

    #[error("Transient failure: {reason}")]
    Transient { reason: String },

    #[error("Ignored: {reason}")]
    Ignored { reason: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TaskError {
    pub fn invalid_entry(message: impl Into<String>) -> Self {
        TaskError::InvalidEntry {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        TaskError::NotFound { what: what.into() }
    }

    pub fn exhausted(pool: impl Into<String>) -> Self {
        TaskError::Exhausted { pool: pool.into() }
    }

    pub fn dependency_expired(dependency: impl Into<String>) -> Self {
        TaskError::DependencyExpired {
            dependency: dependency.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        TaskError::Transient {
            reason: reason.into(),
        }
    }

    pub fn ignored(reason: impl Into<String>) -> Self {
        TaskError::Ignored {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        TaskError::Internal {
            message: message.into(),
        }
    }

    /// Converts this error to its reason code.
    pub fn to_status(&self) -> TaskStatus {
        match self {
            TaskError::InvalidEntry { .. } => TaskStatus::InvalidEntry,
            TaskError::NotFound { .. } => TaskStatus::NotFound,
            TaskError::Exhausted { .. } => TaskStatus::Exhausted,
            TaskError::DependencyExpired { .. } => TaskStatus::DependencyExpired,
            TaskError::Transient { .. } => TaskStatus::NeedRetry,
            TaskError::Ignored { .. } => TaskStatus::Ignore,
            TaskError::Internal { .. } => TaskStatus::Failed,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.to_status().is_retryable()
    }
}

/// Result type for task processing.
pub type TaskResult<T> = Result<T, TaskError>;

/// Extension trait for converting TaskResult to TaskStatus.
pub trait TaskResultExt {
    fn to_status(&self) -> TaskStatus;
}

impl<T> TaskResultExt for TaskResult<T> {
    fn to_status(&self) -> TaskStatus {
        match self {
            Ok(_) => TaskStatus::Success,
            Err(e) => e.to_status(),
        }
    }
}
