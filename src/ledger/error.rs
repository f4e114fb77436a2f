use thiserror::Error;

use crate::tasks::TaskStatus;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry lock poisoned")]
    Lock,

    #[error("task {0} was created concurrently by another writer")]
    Conflict(String),

    #[error("task {task_id} moved from {expected} to {found} before commit")]
    StaleStatus {
        task_id: String,
        expected: TaskStatus,
        found: TaskStatus,
    },
}

pub type Result<T> = std::result::Result<T, RegistryError>;
