use std::time::Duration;

use thiserror::Error;

use crate::domain::{TaskId, TaskStatus};

/// Errors raised by a storage backend.
///
/// "No task available" is not an error: `claim_task` returns `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task {id} is {status}, expected processing")]
    InvalidState { id: TaskId, status: TaskStatus },

    #[error("duration out of range: {0:?}")]
    InvalidDuration(Duration),

    #[error("storage backend: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("payload is required")]
    PayloadRequired,

    #[error("priority {0} out of range 0..=100")]
    InvalidPriority(u8),

    #[error("delay {0:?} cannot be represented")]
    InvalidDelay(Duration),

    #[error("payload serialization failed: {0}")]
    SerializationFailed(#[source] serde_json::Error),

    #[error("persisting task failed: {0}")]
    PersistenceFailed(#[source] StoreError),
}

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("no handlers registered")]
    NoHandlersRegistered,

    #[error("dispatcher already started")]
    AlreadyStarted,

    #[error("handler not found for task_name={0}")]
    HandlerNotFound(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task name {0} is already registered")]
    DuplicateTaskName(String),

    #[error("priority {0} out of range 0..=100")]
    InvalidPriority(u8),

    #[error("no recurring tasks registered")]
    NoTasksRegistered,

    #[error("scheduler already started")]
    AlreadyStarted,
}

/// Error returned by a task handler, or synthesized by the dispatcher when
/// the handler could not finish.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),

    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Fail-fast wiring errors from `DispatcherBuilder::build`.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing handlers for task names: {0:?}")]
    MissingTaskNames(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
