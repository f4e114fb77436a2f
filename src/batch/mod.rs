//! Batch job construction and submission.
//!
//! Accepted tiles become one shared [`GeometryPackage`]; each (acquisition
//! window, tile) pair becomes one [`ProcessingJob`] sent to a
//! [`BatchProcessor`].

pub mod builder;
pub mod client;
pub mod package;
pub mod status;
pub mod submit;

pub use builder::{BatchSpec, OutputSpec, ProcessingJob, build_jobs};
pub use client::{BatchProcessor, HttpBatchProcessor, MockBatchProcessor, RemoteJobStatus};
pub use package::GeometryPackage;
pub use status::{STATUS_TABLE, StatusMapping, map_remote_status};
pub use submit::{FailedJob, SubmissionReport, SubmittedJob, submit_all};

use thiserror::Error;

use crate::http::HttpError;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("remote submission failed: {0}")]
    RemoteSubmissionFailed(String),

    #[error("remote processor accepted the job but returned no id")]
    RemoteJobMissingId,

    #[error("batch API request failed: {0}")]
    Http(#[from] HttpError),

    #[error("unexpected batch API response: {0}")]
    Decode(String),
}
