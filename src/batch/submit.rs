use serde::Serialize;
use tracing::{info, warn};

use super::BatchError;
use super::builder::ProcessingJob;
use super::client::BatchProcessor;

/// A job the processor accepted. `remote_id` is `None` only when built by
/// hand; [`submit_all`] routes id-less answers to the failure list.
#[derive(Debug, Clone, Serialize)]
pub struct SubmittedJob {
    pub job: ProcessingJob,
    pub remote_id: Option<String>,
}

#[derive(Debug)]
pub struct FailedJob {
    pub job: ProcessingJob,
    pub error: BatchError,
}

#[derive(Debug, Default)]
pub struct SubmissionReport {
    pub succeeded: Vec<SubmittedJob>,
    pub failed: Vec<FailedJob>,
}

impl SubmissionReport {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_partial(&self) -> bool {
        !self.succeeded.is_empty() && !self.failed.is_empty()
    }
}

/// Submit every job sequentially. A failure never stops the loop.
pub async fn submit_all(processor: &dyn BatchProcessor, jobs: Vec<ProcessingJob>) -> SubmissionReport {
    let mut report = SubmissionReport::default();

    for job in jobs {
        match processor.submit(&job).await {
            Ok(Some(remote_id)) => report.succeeded.push(SubmittedJob {
                job,
                remote_id: Some(remote_id),
            }),
            Ok(None) => {
                warn!(
                    feature_id = job.feature_id,
                    artifact = %job.artifact_name,
                    "Processor accepted job without an id"
                );
                report.failed.push(FailedJob {
                    job,
                    error: BatchError::RemoteJobMissingId,
                });
            }
            Err(e) => {
                warn!(
                    feature_id = job.feature_id,
                    artifact = %job.artifact_name,
                    error = %e,
                    "Job submission failed"
                );
                let error = match e {
                    BatchError::RemoteSubmissionFailed(_) => e,
                    other => BatchError::RemoteSubmissionFailed(other.to_string()),
                };
                report.failed.push(FailedJob { job, error });
            }
        }
    }

    info!(
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "Batch submission finished"
    );
    report
}
