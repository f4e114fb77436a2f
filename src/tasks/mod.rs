//! Download task lifecycle.
//!
//! One parent task per request aggregates one child task per accepted
//! remote job. [`TaskManager`] owns every state change.

pub mod error;
pub mod manager;
pub mod model;

pub use error::{CleanupAction, CleanupFailure, Result, TaskError};
pub use manager::{
    BatchPatchReport, CancelOutcome, DispatchOutcome, DispatchRequest, SyncReport, TaskManager,
    aggregate_status,
};
pub use model::{DownloadTask, PATCHABLE_FIELDS, TaskPatch, TaskRole, TaskStatus};
