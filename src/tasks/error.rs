use serde::Serialize;
use thiserror::Error;

use super::model::TaskStatus;
use crate::batch::BatchError;
use crate::ledger::RegistryError;
use crate::notify::NotifyError;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("user '{user}' does not own task {task_id}")]
    PermissionDenied { task_id: String, user: String },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("task {task_id} is not ready: {reason}")]
    NotReady { task_id: String, reason: String },

    #[error("could not allocate a unique task id after {0} attempts")]
    IdAllocationExhausted(usize),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("remote processor error: {0}")]
    Remote(#[from] BatchError),

    #[error("notification failed: {0}")]
    Notify(#[from] NotifyError),
}

pub type Result<T> = std::result::Result<T, TaskError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupAction {
    StopRemoteJob,
    DeleteArtifact,
    RemoveChild,
}

/// One fan-out step that failed during cancellation. Reported, never raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupFailure {
    pub action: CleanupAction,
    pub target: String,
    pub message: String,
}
