//! In-process counters, exposed through `GET /health`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    requests_accepted: AtomicU64,
    requests_rejected: AtomicU64,
    tiles_planned: AtomicU64,
    jobs_submitted: AtomicU64,
    jobs_failed: AtomicU64,
    tasks_cancelled: AtomicU64,
}

fn bump(counter: &AtomicU64, name: &'static str, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
    tracing::debug!(counter = name, by, "Metric incremented");
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_accepted(&self) {
        bump(&self.requests_accepted, "requests_accepted", 1);
    }

    pub fn request_rejected(&self) {
        bump(&self.requests_rejected, "requests_rejected", 1);
    }

    pub fn tiles_planned(&self, n: usize) {
        bump(&self.tiles_planned, "tiles_planned", n as u64);
    }

    pub fn jobs_submitted(&self, n: usize) {
        bump(&self.jobs_submitted, "jobs_submitted", n as u64);
    }

    pub fn jobs_failed(&self, n: usize) {
        bump(&self.jobs_failed, "jobs_failed", n as u64);
    }

    pub fn task_cancelled(&self) {
        bump(&self.tasks_cancelled, "tasks_cancelled", 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_accepted: self.requests_accepted.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            tiles_planned: self.tiles_planned.load(Ordering::Relaxed),
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_accepted: u64,
    pub requests_rejected: u64,
    pub tiles_planned: u64,
    pub jobs_submitted: u64,
    pub jobs_failed: u64,
    pub tasks_cancelled: u64,
}
