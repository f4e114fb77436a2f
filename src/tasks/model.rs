use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::error::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    #[serde(rename = "In_progress", alias = "In progress")]
    InProgress,
    #[serde(rename = "Finished_ok")]
    FinishedOk,
    #[serde(rename = "Finished_nok")]
    FinishedNok,
    Rejected,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "Queued",
            TaskStatus::InProgress => "In_progress",
            TaskStatus::FinishedOk => "Finished_ok",
            TaskStatus::FinishedNok => "Finished_nok",
            TaskStatus::Rejected => "Rejected",
            TaskStatus::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Queued | TaskStatus::InProgress)
    }

    /// Whether `self -> next` is a legal move. Staying put is not a
    /// transition and is handled by callers as a no-op.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, InProgress | FinishedOk | FinishedNok | Cancelled)
                | (InProgress, FinishedOk | FinishedNok | Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(TaskStatus::Queued),
            "In_progress" | "In progress" => Ok(TaskStatus::InProgress),
            "Finished_ok" => Ok(TaskStatus::FinishedOk),
            "Finished_nok" => Ok(TaskStatus::FinishedNok),
            "Rejected" => Ok(TaskStatus::Rejected),
            "Cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskRole {
    Parent,
    Child,
}

/// One tracked download. Children and their parent share `group_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub task_id: String,
    pub owner_id: String,
    pub role: TaskRole,
    pub group_id: String,
    pub status: TaskStatus,
    pub dataset_id: String,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub finalized_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub remote_job_ids: Vec<String>,
    #[serde(default)]
    pub artifact_names: Vec<String>,
    /// Set once the parent has been handed to the downstream service
    #[serde(default)]
    pub external_task_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl DownloadTask {
    pub fn new(
        task_id: String,
        owner_id: &str,
        role: TaskRole,
        group_id: &str,
        dataset_id: &str,
    ) -> Self {
        Self {
            task_id,
            owner_id: owner_id.to_string(),
            role,
            group_id: group_id.to_string(),
            status: TaskStatus::Queued,
            dataset_id: dataset_id.to_string(),
            registered_at: Utc::now(),
            finalized_at: None,
            download_url: None,
            file_size: None,
            remote_job_ids: Vec::new(),
            artifact_names: Vec::new(),
            external_task_id: None,
            message: None,
        }
    }

    pub fn is_dispatched(&self) -> bool {
        self.external_task_id.is_some()
    }
}

/// Keys accepted from status callbacks. Everything else is dropped.
pub const PATCHABLE_FIELDS: [&str; 6] = [
    "Status",
    "DownloadURL",
    "FileSize",
    "FinalizationDateTime",
    "RemoteJobId",
    "Message",
];

/// Partial update merged into a stored task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub download_url: Option<String>,
    pub file_size: Option<u64>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub external_task_id: Option<String>,
    /// Appended to `remote_job_ids`, skipping ids already present
    pub add_remote_job_ids: Vec<String>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Build from callback fields, dropping anything off the allow-list.
    pub fn from_fields(fields: &Map<String, Value>) -> Result<Self, TaskError> {
        let mut patch = TaskPatch::default();
        for (key, value) in fields {
            match key.as_str() {
                "Status" => {
                    let raw = expect_str(key, value)?;
                    let status = raw.parse().map_err(|reason| TaskError::InvalidField {
                        field: key.clone(),
                        reason,
                    })?;
                    patch.status = Some(status);
                }
                "DownloadURL" => patch.download_url = Some(expect_str(key, value)?.to_string()),
                "FileSize" => patch.file_size = Some(parse_size(key, value)?),
                "FinalizationDateTime" => {
                    let raw = expect_str(key, value)?;
                    let parsed = DateTime::parse_from_rfc3339(raw).map_err(|e| {
                        TaskError::InvalidField {
                            field: key.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    patch.finalized_at = Some(parsed.with_timezone(&Utc));
                }
                "RemoteJobId" => patch
                    .add_remote_job_ids
                    .push(expect_str(key, value)?.to_string()),
                "Message" => patch.message = Some(expect_str(key, value)?.to_string()),
                other => debug!(field = other, "Dropping non-patchable field"),
            }
        }
        Ok(patch)
    }

    pub fn is_empty(&self) -> bool {
        *self == TaskPatch::default()
    }

    /// Fold a later patch into this one; later values win.
    pub fn then(&mut self, later: &TaskPatch) {
        if later.status.is_some() {
            self.status = later.status;
        }
        if later.download_url.is_some() {
            self.download_url.clone_from(&later.download_url);
        }
        if later.file_size.is_some() {
            self.file_size = later.file_size;
        }
        if later.finalized_at.is_some() {
            self.finalized_at = later.finalized_at;
        }
        if later.message.is_some() {
            self.message.clone_from(&later.message);
        }
        if later.external_task_id.is_some() {
            self.external_task_id.clone_from(&later.external_task_id);
        }
        for id in &later.add_remote_job_ids {
            if !self.add_remote_job_ids.contains(id) {
                self.add_remote_job_ids.push(id.clone());
            }
        }
    }

    pub fn apply(&self, task: &mut DownloadTask) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(url) = &self.download_url {
            task.download_url = Some(url.clone());
        }
        if let Some(size) = self.file_size {
            task.file_size = Some(size);
        }
        if let Some(at) = self.finalized_at {
            task.finalized_at = Some(at);
        }
        if let Some(message) = &self.message {
            task.message = Some(message.clone());
        }
        if let Some(external) = &self.external_task_id {
            task.external_task_id = Some(external.clone());
        }
        for id in &self.add_remote_job_ids {
            if !task.remote_job_ids.contains(id) {
                task.remote_job_ids.push(id.clone());
            }
        }
    }
}

fn expect_str<'v>(field: &str, value: &'v Value) -> Result<&'v str, TaskError> {
    value.as_str().ok_or_else(|| TaskError::InvalidField {
        field: field.to_string(),
        reason: format!("expected a string, got {value}"),
    })
}

fn parse_size(field: &str, value: &Value) -> Result<u64, TaskError> {
    let invalid = || TaskError::InvalidField {
        field: field.to_string(),
        reason: format!("expected a non-negative integer, got {value}"),
    };
    match value {
        Value::Number(n) => n.as_u64().ok_or_else(invalid),
        Value::String(s) => s.trim().parse().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}
