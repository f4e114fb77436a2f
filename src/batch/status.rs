//! Remote processor status vocabulary, collapsed onto [`TaskStatus`].

use tracing::warn;

use crate::tasks::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMapping {
    pub remote: &'static str,
    pub status: TaskStatus,
    /// The job waits for an explicit start call before it progresses
    pub needs_start: bool,
}

const fn row(remote: &'static str, status: TaskStatus, needs_start: bool) -> StatusMapping {
    StatusMapping {
        remote,
        status,
        needs_start,
    }
}

/// Every native status the processor is known to report. New upstream
/// values must be added here deliberately; anything missing maps to `None`.
pub const STATUS_TABLE: &[StatusMapping] = &[
    row("CREATED", TaskStatus::Queued, true),
    row("ANALYSING", TaskStatus::InProgress, false),
    row("ANALYSIS", TaskStatus::InProgress, false),
    row("ANALYSIS_DONE", TaskStatus::InProgress, true),
    row("PROCESSING", TaskStatus::InProgress, false),
    row("DONE", TaskStatus::FinishedOk, false),
    row("PARTIAL", TaskStatus::FinishedNok, false),
    row("FAILED", TaskStatus::FinishedNok, false),
    row("STOPPED", TaskStatus::Cancelled, false),
];

pub fn map_remote_status(remote: &str) -> Option<StatusMapping> {
    let found = STATUS_TABLE
        .iter()
        .find(|m| m.remote.eq_ignore_ascii_case(remote.trim()))
        .copied();
    if found.is_none() {
        warn!(remote, "Unmapped remote job status");
    }
    found
}
