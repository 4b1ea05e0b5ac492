//! Error types for the Courier dispatcher

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// A boxed error as produced by a task callback
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for Courier operations
#[derive(Error, Debug, Clone)]
pub enum CourierError {
    #[error("Add new task failed because the dispatcher queue is closed")]
    AddTaskFailed,

    #[error("Task timed out after {timeout:?}; the task itself keeps running")]
    TaskTimeout { timeout: Duration },

    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// The opaque failure produced by a task callback.
///
/// Cloning is cheap: the underlying error is shared, so the same failure can
/// be handed to a finish callback, a batch error map and a reporter.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error(transparent)]
    Failed(Arc<dyn std::error::Error + Send + Sync + 'static>),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

/// Errors related to configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid queue capacity: {value} (must be > 0)")]
    InvalidQueueCapacity { value: usize },

    #[error("Invalid max running tasks: {value} (must be > 0)")]
    InvalidMaxRunning { value: usize },

    #[error("Invalid batch concurrency limit: {value} (must be > 0)")]
    InvalidMaxConcurrent { value: usize },

    #[error("The process-wide dispatcher is already initialized")]
    AlreadyInitialized,
}

/// Result type alias for Courier operations
pub type CourierResult<T> = Result<T, CourierError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

impl CourierError {
    /// Create a new invalid state error
    pub fn invalid_state<S: Into<String>>(reason: S) -> Self {
        CourierError::InvalidState {
            reason: reason.into(),
        }
    }

    /// Create a timeout error for a wait budget
    pub fn timeout(timeout: Duration) -> Self {
        CourierError::TaskTimeout { timeout }
    }

    /// Check if this error indicates an observer timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, CourierError::TaskTimeout { .. })
    }

    /// Check if this error indicates the dispatcher refused the task
    pub fn is_add_task_failed(&self) -> bool {
        matches!(self, CourierError::AddTaskFailed)
    }

    /// Check if this error indicates API misuse
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, CourierError::InvalidState { .. })
    }

    /// The task's own failure, if this error carries one
    pub fn as_task_error(&self) -> Option<&TaskError> {
        match self {
            CourierError::Task(err) => Some(err),
            _ => None,
        }
    }
}

impl TaskError {
    /// Wrap an error returned by a task callback
    pub fn new<E: Into<BoxError>>(error: E) -> Self {
        TaskError::Failed(Arc::from(error.into()))
    }

    /// Build an error from a caught panic payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        TaskError::Panicked(message)
    }

    /// Check if the callback panicked rather than returning an error
    pub fn is_panic(&self) -> bool {
        matches!(self, TaskError::Panicked(_))
    }

    /// Attempt to downcast the callback's error to a concrete type
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            TaskError::Failed(inner) => inner.downcast_ref::<E>(),
            TaskError::Panicked(_) => None,
        }
    }
}

impl From<CourierError> for TaskError {
    fn from(error: CourierError) -> Self {
        match error {
            CourierError::Task(inner) => inner,
            other => TaskError::new(other),
        }
    }
}

impl ConfigError {
    /// Create an invalid queue capacity error
    pub fn invalid_queue_capacity(value: usize) -> Self {
        ConfigError::InvalidQueueCapacity { value }
    }

    /// Create an invalid max running error
    pub fn invalid_max_running(value: usize) -> Self {
        ConfigError::InvalidMaxRunning { value }
    }

    /// Create an invalid batch concurrency limit error
    pub fn invalid_max_concurrent(value: usize) -> Self {
        ConfigError::InvalidMaxConcurrent { value }
    }
}
