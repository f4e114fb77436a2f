use serde_json::Value;

use super::error::Result;
use crate::tasks::{DownloadTask, TaskPatch, TaskStatus};

/// Result of a status-guarded merge.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardedMerge {
    /// The stored status matched and the patch was applied.
    Applied(DownloadTask),
    /// Another writer moved the task on; carries the stored record.
    Stale(DownloadTask),
    Missing,
}

/// Persistent task store keyed by task id.
///
/// Every implementation must make `insert_if_absent` and `merge_if` atomic
/// with respect to concurrent writers.
pub trait TaskRegistry: Send + Sync {
    /// Store `task` unless its id is taken. Returns whether it was stored.
    fn insert_if_absent(&self, task: &DownloadTask) -> Result<bool>;

    fn get(&self, task_id: &str) -> Result<Option<DownloadTask>>;

    /// Apply `patch` to the stored task. `None` if the id is unknown.
    fn merge(&self, task_id: &str, patch: &TaskPatch) -> Result<Option<DownloadTask>>;

    /// Apply `patch` only while the stored status is still `expected`.
    fn merge_if(
        &self,
        task_id: &str,
        expected: TaskStatus,
        patch: &TaskPatch,
    ) -> Result<GuardedMerge>;

    /// Returns whether a record was removed.
    fn delete(&self, task_id: &str) -> Result<bool>;

    fn search(&self, owner_id: &str, status: Option<TaskStatus>) -> Result<Vec<DownloadTask>>;

    /// Tasks whose serialized `field` equals `value`.
    fn find_by_field(&self, field: &str, value: &Value) -> Result<Vec<DownloadTask>>;
}

pub(crate) fn field_matches(task: &DownloadTask, field: &str, value: &Value) -> Result<bool> {
    let serialized = serde_json::to_value(task)?;
    Ok(serialized.get(field) == Some(value))
}
