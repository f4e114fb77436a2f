use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{CleanupAction, CleanupFailure, Result, TaskError};
use super::model::{DownloadTask, TaskPatch, TaskRole, TaskStatus};
use crate::batch::{BatchProcessor, SubmittedJob, map_remote_status};
use crate::ledger::{GuardedMerge, TaskRegistry};
use crate::notify::{DatasetRequest, DispatchParams, NotificationSink};
use crate::storage::StorageClient;

/// Attempts at a fresh task id before giving up
pub const ID_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CancelOutcome {
    pub task_id: String,
    pub already_cancelled: bool,
    pub stopped_jobs: Vec<String>,
    pub deleted_objects: usize,
    pub removed_children: Vec<String>,
    pub cleanup_failures: Vec<CleanupFailure>,
}

impl CancelOutcome {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            ..Self::default()
        }
    }

    fn record(&mut self, action: CleanupAction, target: &str, error: impl std::fmt::Display) {
        warn!(
            task_id = %self.task_id,
            ?action,
            target,
            error = %error,
            "Cancellation cleanup step failed"
        );
        self.cleanup_failures.push(CleanupFailure {
            action,
            target: target.to_string(),
            message: error.to_string(),
        });
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchPatchReport {
    pub updated: Vec<String>,
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub parent_id: String,
    pub parent_status: TaskStatus,
    pub updated_children: Vec<String>,
    pub started_jobs: Vec<String>,
    pub unmapped_jobs: Vec<String>,
}

/// Contact details supplied when a finished group is handed downstream.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    pub contact: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub task_id: String,
    pub external_task_id: String,
    pub already_dispatched: bool,
}

/// Parent status derived from its children.
pub fn aggregate_status(children: &[TaskStatus]) -> TaskStatus {
    if children.is_empty() {
        return TaskStatus::Queued;
    }
    if children.iter().all(|s| *s == TaskStatus::FinishedOk) {
        return TaskStatus::FinishedOk;
    }
    if children.iter().any(|s| !s.is_terminal()) {
        return if children.iter().any(|s| *s != TaskStatus::Queued) {
            TaskStatus::InProgress
        } else {
            TaskStatus::Queued
        };
    }
    if children.iter().all(|s| *s == TaskStatus::Cancelled) {
        return TaskStatus::Cancelled;
    }
    TaskStatus::FinishedNok
}

/// Task lifecycle operations over borrowed collaborators.
pub struct TaskManager<'a> {
    registry: &'a dyn TaskRegistry,
    processor: &'a dyn BatchProcessor,
    storage: &'a StorageClient,
}

impl<'a> TaskManager<'a> {
    pub fn new(
        registry: &'a dyn TaskRegistry,
        processor: &'a dyn BatchProcessor,
        storage: &'a StorageClient,
    ) -> Self {
        Self {
            registry,
            processor,
            storage,
        }
    }

    /// Insert a task under a fresh id, retrying on collision.
    fn allocate(&self, build: impl Fn(String) -> DownloadTask) -> Result<DownloadTask> {
        for attempt in 1..=ID_ATTEMPTS {
            let task = build(Uuid::new_v4().simple().to_string());
            if self.registry.insert_if_absent(&task)? {
                return Ok(task);
            }
            warn!(attempt, task_id = %task.task_id, "Task id collision, retrying");
        }
        Err(TaskError::IdAllocationExhausted(ID_ATTEMPTS))
    }

    fn load(&self, task_id: &str) -> Result<DownloadTask> {
        self.registry
            .get(task_id)?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    fn load_owned(&self, task_id: &str, user: &str) -> Result<DownloadTask> {
        let task = self.load(task_id)?;
        if task.owner_id != user {
            return Err(TaskError::PermissionDenied {
                task_id: task_id.to_string(),
                user: user.to_string(),
            });
        }
        Ok(task)
    }

    fn children_of(&self, group_id: &str) -> Result<Vec<DownloadTask>> {
        let mut children: Vec<DownloadTask> = self
            .registry
            .find_by_field("group_id", &json!(group_id))?
            .into_iter()
            .filter(|t| t.role == TaskRole::Child)
            .collect();
        children.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        Ok(children)
    }

    /// Register one child for an accepted job. A job without a remote id is
    /// skipped with a warning.
    pub fn create_child(
        &self,
        group_id: &str,
        owner_id: &str,
        submitted: &SubmittedJob,
    ) -> Result<Option<String>> {
        let Some(remote_id) = submitted
            .remote_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
        else {
            warn!(
                group_id,
                artifact = %submitted.job.artifact_name,
                "Remote job has no id, child not registered"
            );
            return Ok(None);
        };

        let job = &submitted.job;
        let task = self.allocate(|id| {
            let mut task = DownloadTask::new(id, owner_id, TaskRole::Child, group_id, &job.dataset_id);
            task.remote_job_ids = vec![remote_id.to_string()];
            task.artifact_names = vec![job.artifact_name.clone()];
            task
        })?;
        debug!(task_id = %task.task_id, group_id, remote_id, "Registered child task");
        Ok(Some(task.task_id))
    }

    /// Register the aggregate task once its children exist.
    pub fn create_parent(
        &self,
        group_id: &str,
        owner_id: &str,
        dataset_id: &str,
        child_ids: &[String],
        extra_artifacts: &[String],
    ) -> Result<String> {
        let mut remote_job_ids = Vec::new();
        let mut artifact_names = Vec::new();
        for child_id in child_ids {
            let child = self.load(child_id)?;
            push_unique(&mut remote_job_ids, &child.remote_job_ids);
            push_unique(&mut artifact_names, &child.artifact_names);
        }
        push_unique(&mut artifact_names, extra_artifacts);

        let task = self.allocate(|id| {
            let mut task = DownloadTask::new(id, owner_id, TaskRole::Parent, group_id, dataset_id);
            task.remote_job_ids = remote_job_ids.clone();
            task.artifact_names = artifact_names.clone();
            task
        })?;
        info!(
            task_id = %task.task_id,
            group_id,
            children = child_ids.len(),
            jobs = task.remote_job_ids.len(),
            "Registered parent task"
        );
        Ok(task.task_id)
    }

    /// Record a request that produced no accepted job.
    pub fn create_rejected(
        &self,
        group_id: &str,
        owner_id: &str,
        dataset_id: &str,
        message: &str,
    ) -> Result<String> {
        let now = Utc::now();
        let task = self.allocate(|id| {
            let mut task = DownloadTask::new(id, owner_id, TaskRole::Parent, group_id, dataset_id);
            task.status = TaskStatus::Rejected;
            task.finalized_at = Some(now);
            task.message = Some(message.to_string());
            task
        })?;
        warn!(task_id = %task.task_id, group_id, message, "Registered rejected request");
        Ok(task.task_id)
    }

    pub fn get(&self, task_id: &str, user: &str) -> Result<DownloadTask> {
        self.load_owned(task_id, user)
    }

    /// The user's tasks, newest first.
    pub fn list(&self, user: &str, status: Option<TaskStatus>) -> Result<Vec<DownloadTask>> {
        let mut tasks = self.registry.search(user, status)?;
        tasks.sort_by(|a, b| b.registered_at.cmp(&a.registered_at));
        Ok(tasks)
    }

    /// Mark a task cancelled. An undispatched parent also stops its remote
    /// jobs, deletes its artifacts and removes its children; those steps are
    /// best-effort and reported in the outcome.
    ///
    /// The status write is guarded on the status it was checked against and
    /// lands before any fan-out, so concurrent cancels clean up once.
    pub async fn cancel(&self, task_id: &str, user: &str) -> Result<CancelOutcome> {
        let mut task = self.load_owned(task_id, user)?;
        let mut outcome = CancelOutcome::new(task_id);

        let mut patch = TaskPatch::status(TaskStatus::Cancelled);
        patch.finalized_at = Some(Utc::now());

        // status only moves forward, so this ends
        loop {
            if task.status == TaskStatus::Cancelled {
                info!(task_id, "Task already cancelled");
                outcome.already_cancelled = true;
                return Ok(outcome);
            }
            if !task.status.can_transition_to(TaskStatus::Cancelled) {
                return Err(TaskError::InvalidTransition {
                    from: task.status,
                    to: TaskStatus::Cancelled,
                });
            }
            match self.registry.merge_if(task_id, task.status, &patch)? {
                GuardedMerge::Applied(_) => break,
                GuardedMerge::Stale(current) => task = current,
                GuardedMerge::Missing => return Err(TaskError::NotFound(task_id.to_string())),
            }
        }

        if task.role == TaskRole::Parent && !task.is_dispatched() {
            self.fan_out(&task, &mut outcome).await;
        }

        info!(
            task_id,
            role = ?task.role,
            stopped = outcome.stopped_jobs.len(),
            deleted = outcome.deleted_objects,
            removed = outcome.removed_children.len(),
            failures = outcome.cleanup_failures.len(),
            "Cancelled task"
        );
        Ok(outcome)
    }

    async fn fan_out(&self, parent: &DownloadTask, outcome: &mut CancelOutcome) {
        let children = match self.children_of(&parent.group_id) {
            Ok(children) => children,
            Err(e) => {
                outcome.record(CleanupAction::RemoveChild, &parent.group_id, e);
                Vec::new()
            }
        };

        let mut remote_ids = parent.remote_job_ids.clone();
        let mut artifacts = parent.artifact_names.clone();
        for child in &children {
            push_unique(&mut remote_ids, &child.remote_job_ids);
            push_unique(&mut artifacts, &child.artifact_names);
        }

        for remote_id in &remote_ids {
            match self.processor.stop(remote_id).await {
                Ok(()) => outcome.stopped_jobs.push(remote_id.clone()),
                Err(e) => outcome.record(CleanupAction::StopRemoteJob, remote_id, e),
            }
        }

        for artifact in &artifacts {
            match self.storage.delete_prefix(artifact).await {
                Ok(removed) => outcome.deleted_objects += removed,
                Err(e) => outcome.record(CleanupAction::DeleteArtifact, artifact, e),
            }
        }

        for child in &children {
            match self.registry.delete(&child.task_id) {
                Ok(true) => outcome.removed_children.push(child.task_id.clone()),
                Ok(false) => debug!(task_id = %child.task_id, "Child already gone"),
                Err(e) => outcome.record(CleanupAction::RemoveChild, &child.task_id, e),
            }
        }
    }

    /// Merge callback fields into a task. Only allow-listed keys are kept
    /// and a status change must follow the state machine.
    pub fn patch_status(&self, task_id: &str, fields: &Map<String, Value>) -> Result<DownloadTask> {
        let requested = TaskPatch::from_fields(fields)?;
        let mut task = self.load(task_id)?;

        loop {
            let mut patch = requested.clone();
            if let Some(next) = patch.status {
                if next == task.status {
                    patch.status = None;
                } else if !task.status.can_transition_to(next) {
                    return Err(TaskError::InvalidTransition {
                        from: task.status,
                        to: next,
                    });
                } else if next.is_terminal() && patch.finalized_at.is_none() {
                    patch.finalized_at = Some(Utc::now());
                }
            }

            if patch.is_empty() {
                debug!(task_id, "Nothing to patch");
                return Ok(task);
            }

            match self.registry.merge_if(task_id, task.status, &patch)? {
                GuardedMerge::Applied(updated) => {
                    debug!(task_id, status = %updated.status, "Patched task");
                    return Ok(updated);
                }
                GuardedMerge::Stale(current) => {
                    debug!(task_id, found = %current.status, "Task changed underneath, rechecking");
                    task = current;
                }
                GuardedMerge::Missing => return Err(TaskError::NotFound(task_id.to_string())),
            }
        }
    }

    /// [`patch_status`](Self::patch_status) per entry of `updates`, keyed
    /// by task id. Failures are collected, never raised.
    pub fn patch_status_multiple(&self, updates: &Map<String, Value>) -> BatchPatchReport {
        let mut report = BatchPatchReport::default();
        for (task_id, fields) in updates {
            let result = match fields.as_object() {
                Some(fields) => self.patch_status(task_id, fields).map(|_| ()),
                None => Err(TaskError::InvalidField {
                    field: task_id.clone(),
                    reason: "expected an object of fields".into(),
                }),
            };
            match result {
                Ok(()) => report.updated.push(task_id.clone()),
                Err(e) => {
                    warn!(task_id, error = %e, "Batch patch entry failed");
                    report.errors.insert(task_id.clone(), e.to_string());
                }
            }
        }
        report
    }

    /// Delete a task. Removing a parent removes its children too.
    pub fn remove(&self, task_id: &str, user: &str) -> Result<Vec<String>> {
        let task = self.load_owned(task_id, user)?;
        let mut removed = Vec::new();

        if task.role == TaskRole::Parent {
            for child in self.children_of(&task.group_id)? {
                if self.registry.delete(&child.task_id)? {
                    removed.push(child.task_id);
                }
            }
        }
        if self.registry.delete(task_id)? {
            removed.push(task_id.to_string());
        }

        info!(task_id, removed = removed.len(), "Removed task");
        Ok(removed)
    }

    /// Poll the remote processor for every child of `parent_id`, patch the
    /// children, start jobs that wait for it and recompute the parent.
    pub async fn sync_group(&self, parent_id: &str) -> Result<SyncReport> {
        let parent = self.load(parent_id)?;
        let children = self.children_of(&parent.group_id)?;

        let remote_ids: Vec<String> = children
            .iter()
            .flat_map(|c| c.remote_job_ids.iter().cloned())
            .collect();
        let remote = if remote_ids.is_empty() {
            Vec::new()
        } else {
            self.processor.statuses(&remote_ids).await?
        };
        let by_id: HashMap<&str, &str> = remote
            .iter()
            .map(|r| (r.id.as_str(), r.status.as_str()))
            .collect();

        let mut report = SyncReport {
            parent_id: parent_id.to_string(),
            parent_status: parent.status,
            updated_children: Vec::new(),
            started_jobs: Vec::new(),
            unmapped_jobs: Vec::new(),
        };
        let mut statuses = Vec::with_capacity(children.len());

        for child in &children {
            let mut next = child.status;
            for remote_id in &child.remote_job_ids {
                let Some(native) = by_id.get(remote_id.as_str()) else {
                    debug!(remote_id, "No status reported for job");
                    continue;
                };
                let Some(mapping) = map_remote_status(native) else {
                    report.unmapped_jobs.push(remote_id.clone());
                    continue;
                };
                if mapping.needs_start {
                    match self.processor.start(remote_id).await {
                        Ok(()) => report.started_jobs.push(remote_id.clone()),
                        Err(e) => warn!(remote_id, error = %e, "Failed to start remote job"),
                    }
                }
                next = mapping.status;
            }

            if next != child.status {
                if child.status.can_transition_to(next) {
                    let mut patch = TaskPatch::status(next);
                    if next.is_terminal() {
                        patch.finalized_at = Some(Utc::now());
                    }
                    match self.registry.merge_if(&child.task_id, child.status, &patch)? {
                        GuardedMerge::Applied(_) => {
                            report.updated_children.push(child.task_id.clone());
                        }
                        GuardedMerge::Stale(current) => {
                            debug!(task_id = %child.task_id, found = %current.status, "Child changed during sync");
                            next = current.status;
                        }
                        GuardedMerge::Missing => {
                            debug!(task_id = %child.task_id, "Child removed during sync");
                            continue;
                        }
                    }
                } else {
                    warn!(
                        task_id = %child.task_id,
                        from = %child.status,
                        to = %next,
                        "Ignoring remote status that breaks the state machine"
                    );
                    next = child.status;
                }
            }
            statuses.push(next);
        }

        let aggregate = aggregate_status(&statuses);
        if aggregate != parent.status && parent.status.can_transition_to(aggregate) {
            let mut patch = TaskPatch::status(aggregate);
            if aggregate.is_terminal() {
                patch.finalized_at = Some(Utc::now());
            }
            report.parent_status = match self.registry.merge_if(parent_id, parent.status, &patch)? {
                GuardedMerge::Applied(_) => aggregate,
                GuardedMerge::Stale(current) => current.status,
                GuardedMerge::Missing => return Err(TaskError::NotFound(parent_id.to_string())),
            };
        }

        info!(
            parent_id,
            status = %report.parent_status,
            updated = report.updated_children.len(),
            started = report.started_jobs.len(),
            "Synchronised task group"
        );
        Ok(report)
    }

    /// Hand a finished group to the downstream service. Runs at most once
    /// per parent.
    pub async fn dispatch(
        &self,
        parent_id: &str,
        sink: &dyn NotificationSink,
        request: &DispatchRequest,
    ) -> Result<DispatchOutcome> {
        let parent = self.load(parent_id)?;
        let not_ready = |reason: String| TaskError::NotReady {
            task_id: parent_id.to_string(),
            reason,
        };

        if parent.role != TaskRole::Parent {
            return Err(not_ready("only parent tasks are dispatched".into()));
        }
        if let Some(external) = &parent.external_task_id {
            return Ok(DispatchOutcome {
                task_id: parent_id.to_string(),
                external_task_id: external.clone(),
                already_dispatched: true,
            });
        }
        if matches!(parent.status, TaskStatus::Cancelled | TaskStatus::Rejected) {
            return Err(not_ready(format!("task is {}", parent.status)));
        }

        let children = self.children_of(&parent.group_id)?;
        let finished = children
            .iter()
            .filter(|c| c.status == TaskStatus::FinishedOk)
            .count();
        if children.is_empty() || finished < children.len() {
            return Err(not_ready(format!(
                "{finished} of {} children finished",
                children.len()
            )));
        }

        let params = DispatchParams {
            task_id: parent.task_id.clone(),
            owner_id: parent.owner_id.clone(),
            contact: request.contact.clone(),
            callback_url: request.callback_url.clone(),
            datasets: children
                .iter()
                .map(|c| DatasetRequest {
                    task_id: c.task_id.clone(),
                    dataset_id: c.dataset_id.clone(),
                    download_url: c.download_url.clone(),
                    file_size: c.file_size,
                })
                .collect(),
        };
        let external = sink.dispatch(&params).await?;

        let finalized_at = Utc::now();
        let mut current = parent.status;
        loop {
            let mut patch = TaskPatch {
                external_task_id: Some(external.clone()),
                ..TaskPatch::default()
            };
            if current.can_transition_to(TaskStatus::FinishedOk) {
                patch.status = Some(TaskStatus::FinishedOk);
                patch.finalized_at = Some(finalized_at);
            }
            match self.registry.merge_if(parent_id, current, &patch)? {
                GuardedMerge::Applied(_) => break,
                GuardedMerge::Stale(task) => current = task.status,
                GuardedMerge::Missing => return Err(TaskError::NotFound(parent_id.to_string())),
            }
        }

        info!(parent_id, external_task_id = %external, "Dispatched task group");
        Ok(DispatchOutcome {
            task_id: parent_id.to_string(),
            external_task_id: external,
            already_dispatched: false,
        })
    }
}

fn push_unique(target: &mut Vec<String>, items: &[String]) {
    for item in items {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{MockBatchProcessor, OutputSpec, ProcessingJob};
    use crate::catalog::AcquisitionWindow;
    use crate::ledger::{FjallRegistry, RegistryError, UnitOfWork};
    use crate::notify::MockNotificationSink;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        registry: FjallRegistry,
        processor: MockBatchProcessor,
        storage: StorageClient,
        _temp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            Self {
                registry: FjallRegistry::open(temp.path().join("registry")).unwrap(),
                processor: MockBatchProcessor::new(),
                storage: StorageClient::in_memory(),
                _temp: temp,
            }
        }

        fn manager(&self) -> TaskManager<'_> {
            TaskManager::new(&self.registry, &self.processor, &self.storage)
        }

        /// Parent owned by alice with `n` submitted children and one
        /// uploaded artifact per child plus the package.
        async fn group(&self, n: u32) -> (String, Vec<String>) {
            let manager = self.manager();
            let mut child_ids = Vec::new();
            for feature_id in 1..=n {
                let job = job(feature_id);
                let remote_id = self.processor.submit(&job).await.unwrap();
                self.storage
                    .upload(&format!("{}/part-0.tif", job.artifact_name), vec![1])
                    .await
                    .unwrap();
                let submitted = SubmittedJob { job, remote_id };
                child_ids.push(manager.create_child("g1", "alice", &submitted).unwrap().unwrap());
            }
            self.storage
                .upload("packages/g1.geojson", vec![1])
                .await
                .unwrap();
            let parent = manager
                .create_parent("g1", "alice", "landcover", &child_ids, &["packages/g1.geojson".into()])
                .unwrap();
            (parent, child_ids)
        }
    }

    fn job(feature_id: u32) -> ProcessingJob {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        ProcessingJob {
            feature_id,
            window: AcquisitionWindow { start: ts, end: ts },
            package_key: "packages/g1.geojson".into(),
            artifact_name: format!("artifacts/r1/{feature_id}_20240501T100000"),
            outputs: vec![OutputSpec {
                identifier: "default".into(),
                format: "image/tiff".into(),
            }],
            dataset_id: "landcover".into(),
            crs: "EPSG:3035".into(),
            resolution: 100.0,
        }
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_aggregate_status() {
        use TaskStatus::*;
        assert_eq!(aggregate_status(&[]), Queued);
        assert_eq!(aggregate_status(&[Queued, Queued]), Queued);
        assert_eq!(aggregate_status(&[Queued, InProgress]), InProgress);
        assert_eq!(aggregate_status(&[Queued, FinishedOk]), InProgress);
        assert_eq!(aggregate_status(&[FinishedOk, FinishedOk]), FinishedOk);
        assert_eq!(aggregate_status(&[FinishedOk, FinishedNok]), FinishedNok);
        assert_eq!(aggregate_status(&[Cancelled, Cancelled]), Cancelled);
        assert_eq!(aggregate_status(&[Cancelled, FinishedOk]), FinishedNok);
    }

    #[test]
    fn test_child_without_remote_id_is_skipped() {
        let fx = Fixture::new();
        let submitted = SubmittedJob {
            job: job(1),
            remote_id: None,
        };
        assert!(fx.manager().create_child("g1", "alice", &submitted).unwrap().is_none());

        let blank = SubmittedJob {
            job: job(2),
            remote_id: Some("  ".into()),
        };
        assert!(fx.manager().create_child("g1", "alice", &blank).unwrap().is_none());
        assert_eq!(fx.registry.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_parent_holds_union_of_children() {
        let fx = Fixture::new();
        let (parent_id, child_ids) = fx.group(3).await;

        let parent = fx.registry.get(&parent_id).unwrap().unwrap();
        assert_eq!(parent.role, TaskRole::Parent);
        assert_eq!(parent.status, TaskStatus::Queued);
        assert_eq!(parent.remote_job_ids, vec!["remote-1", "remote-2", "remote-3"]);
        assert_eq!(parent.artifact_names.len(), 4);
        assert!(parent.artifact_names.contains(&"packages/g1.geojson".to_string()));

        for child_id in &child_ids {
            let child = fx.registry.get(child_id).unwrap().unwrap();
            assert_eq!(child.group_id, parent.group_id);
            assert_eq!(child.remote_job_ids.len(), 1);
        }
    }

    #[test]
    fn test_rejected_is_initial_terminal_state() {
        let fx = Fixture::new();
        let id = fx
            .manager()
            .create_rejected("g9", "alice", "landcover", "no acquisitions")
            .unwrap();
        let task = fx.registry.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Rejected);
        assert!(task.finalized_at.is_some());
        assert_eq!(task.message.as_deref(), Some("no acquisitions"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_foreign_tasks() {
        let fx = Fixture::new();
        let (parent_id, _) = fx.group(1).await;
        let manager = fx.manager();

        assert!(matches!(
            manager.cancel("missing", "alice").await,
            Err(TaskError::NotFound(_))
        ));
        assert!(matches!(
            manager.cancel(&parent_id, "bob").await,
            Err(TaskError::PermissionDenied { .. })
        ));

        let parent = fx.registry.get(&parent_id).unwrap().unwrap();
        assert_eq!(parent.status, TaskStatus::Queued);
        assert!(fx.processor.stopped().is_empty());
        assert!(fx.storage.exists("packages/g1.geojson").await.unwrap());
    }

    #[tokio::test]
    async fn test_overlapping_cancels_fan_out_once() {
        let fx = Fixture::new();
        let (parent_id, _) = fx.group(2).await;

        let first_uow = UnitOfWork::new(&fx.registry);
        let second_uow = UnitOfWork::new(&fx.registry);
        let first = TaskManager::new(&first_uow, &fx.processor, &fx.storage);
        let second = TaskManager::new(&second_uow, &fx.processor, &fx.storage);
        assert_eq!(
            second.get(&parent_id, "alice").unwrap().status,
            TaskStatus::Queued
        );

        let o1 = first.cancel(&parent_id, "alice").await.unwrap();
        let o2 = second.cancel(&parent_id, "alice").await.unwrap();
        first_uow.commit().unwrap();
        second_uow.commit().unwrap();

        assert!(!o1.already_cancelled);
        assert!(o2.already_cancelled);
        assert!(o2.stopped_jobs.is_empty());
        assert_eq!(fx.processor.stopped(), vec!["remote-1", "remote-2"]);
        let tasks = fx.registry.search("alice", None).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_callback_cannot_overwrite_concurrent_cancel() {
        let fx = Fixture::new();
        let (_, child_ids) = fx.group(1).await;
        let child_id = &child_ids[0];

        let cancel_uow = UnitOfWork::new(&fx.registry);
        let patch_uow = UnitOfWork::new(&fx.registry);
        let canceller = TaskManager::new(&cancel_uow, &fx.processor, &fx.storage);
        let patcher = TaskManager::new(&patch_uow, &fx.processor, &fx.storage);
        assert_eq!(patch_uow.get(child_id).unwrap().unwrap().status, TaskStatus::Queued);

        canceller.cancel(child_id, "alice").await.unwrap();
        let result = patcher.patch_status(child_id, &fields(json!({"Status": "Finished_ok"})));
        assert!(matches!(
            result,
            Err(TaskError::InvalidTransition {
                from: TaskStatus::Cancelled,
                to: TaskStatus::FinishedOk
            })
        ));

        cancel_uow.commit().unwrap();
        patch_uow.commit().unwrap();
        assert_eq!(
            fx.registry.get(child_id).unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_parent_fans_out() {
        let fx = Fixture::new();
        let (parent_id, child_ids) = fx.group(3).await;

        let outcome = fx.manager().cancel(&parent_id, "alice").await.unwrap();
        assert!(!outcome.already_cancelled);
        assert_eq!(outcome.stopped_jobs.len(), 3);
        assert_eq!(outcome.deleted_objects, 4);
        assert_eq!(outcome.removed_children.len(), 3);
        assert!(outcome.cleanup_failures.is_empty());

        let parent = fx.registry.get(&parent_id).unwrap().unwrap();
        assert_eq!(parent.status, TaskStatus::Cancelled);
        assert!(parent.finalized_at.is_some());
        for child_id in &child_ids {
            assert!(fx.registry.get(child_id).unwrap().is_none());
        }
        assert!(!fx.storage.exists("packages/g1.geojson").await.unwrap());
    }

    #[tokio::test]
    async fn test_second_cancel_has_no_side_effects() {
        let fx = Fixture::new();
        let (parent_id, _) = fx.group(2).await;
        let manager = fx.manager();

        manager.cancel(&parent_id, "alice").await.unwrap();
        let stopped = fx.processor.stopped().len();

        let again = manager.cancel(&parent_id, "alice").await.unwrap();
        assert!(again.already_cancelled);
        assert!(again.stopped_jobs.is_empty());
        assert_eq!(fx.processor.stopped().len(), stopped);
    }

    #[tokio::test]
    async fn test_cancel_continues_past_failures() {
        let fx = Fixture::new();
        let (parent_id, _) = fx.group(3).await;
        fx.processor.fail_stop_for("remote-2");

        let outcome = fx.manager().cancel(&parent_id, "alice").await.unwrap();
        assert_eq!(outcome.stopped_jobs, vec!["remote-1", "remote-3"]);
        assert_eq!(outcome.cleanup_failures.len(), 1);
        assert_eq!(outcome.cleanup_failures[0].action, CleanupAction::StopRemoteJob);
        assert_eq!(outcome.cleanup_failures[0].target, "remote-2");
        assert_eq!(outcome.removed_children.len(), 3);
        assert_eq!(
            fx.registry.get(&parent_id).unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_dispatched_parent_only_marks_it() {
        let fx = Fixture::new();
        let (parent_id, child_ids) = fx.group(2).await;
        let patch = TaskPatch {
            external_task_id: Some("ext-1".into()),
            ..TaskPatch::default()
        };
        fx.registry.merge(&parent_id, &patch).unwrap();

        let outcome = fx.manager().cancel(&parent_id, "alice").await.unwrap();
        assert!(outcome.stopped_jobs.is_empty());
        assert!(outcome.removed_children.is_empty());
        assert!(fx.processor.stopped().is_empty());
        assert!(fx.registry.get(&child_ids[0]).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancel_child_only_marks_it() {
        let fx = Fixture::new();
        let (_, child_ids) = fx.group(2).await;

        fx.manager().cancel(&child_ids[0], "alice").await.unwrap();
        assert!(fx.processor.stopped().is_empty());
        assert_eq!(
            fx.registry.get(&child_ids[0]).unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(
            fx.registry.get(&child_ids[1]).unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_cancel_terminal_task_is_invalid() {
        let fx = Fixture::new();
        let (_, child_ids) = fx.group(1).await;
        fx.registry
            .merge(&child_ids[0], &TaskPatch::status(TaskStatus::FinishedOk))
            .unwrap();

        assert!(matches!(
            fx.manager().cancel(&child_ids[0], "alice").await,
            Err(TaskError::InvalidTransition {
                from: TaskStatus::FinishedOk,
                to: TaskStatus::Cancelled
            })
        ));
    }

    #[tokio::test]
    async fn test_patch_status() {
        let fx = Fixture::new();
        let (_, child_ids) = fx.group(1).await;
        let manager = fx.manager();
        let id = &child_ids[0];

        let updated = manager
            .patch_status(
                id,
                &fields(json!({"Status": "In_progress", "owner_id": "mallory"})),
            )
            .unwrap();
        assert_eq!(updated.status, TaskStatus::InProgress);
        assert_eq!(updated.owner_id, "alice");

        let same = manager
            .patch_status(id, &fields(json!({"Status": "In progress"})))
            .unwrap();
        assert_eq!(same.status, TaskStatus::InProgress);

        let done = manager
            .patch_status(
                id,
                &fields(json!({"Status": "Finished_ok", "DownloadURL": "https://x/y.zip", "FileSize": 10})),
            )
            .unwrap();
        assert!(done.finalized_at.is_some());
        assert_eq!(done.file_size, Some(10));

        assert!(matches!(
            manager.patch_status(id, &fields(json!({"Status": "Queued"}))),
            Err(TaskError::InvalidTransition { .. })
        ));
        assert!(matches!(
            manager.patch_status("missing", &fields(json!({"Status": "Queued"}))),
            Err(TaskError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_patch_status_multiple_collects_errors() {
        let fx = Fixture::new();
        let (_, child_ids) = fx.group(2).await;

        let mut updates = Map::new();
        updates.insert(child_ids[0].clone(), json!({"Status": "In_progress"}));
        updates.insert(child_ids[1].clone(), json!({"Status": "Exploded"}));
        updates.insert("missing".into(), json!({"Status": "In_progress"}));
        updates.insert("weird".into(), json!("not an object"));

        let report = fx.manager().patch_status_multiple(&updates);
        assert_eq!(report.updated, vec![child_ids[0].clone()]);
        assert_eq!(report.errors.len(), 3);
        assert!(report.errors.contains_key("missing"));
    }

    #[tokio::test]
    async fn test_remove_parent_removes_children() {
        let fx = Fixture::new();
        let (parent_id, _) = fx.group(2).await;
        let manager = fx.manager();

        assert!(matches!(
            manager.remove(&parent_id, "bob"),
            Err(TaskError::PermissionDenied { .. })
        ));
        let removed = manager.remove(&parent_id, "alice").unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(fx.registry.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_and_list() {
        let fx = Fixture::new();
        let (parent_id, _) = fx.group(2).await;
        let manager = fx.manager();

        assert_eq!(manager.get(&parent_id, "alice").unwrap().task_id, parent_id);
        assert!(matches!(
            manager.get(&parent_id, "bob"),
            Err(TaskError::PermissionDenied { .. })
        ));

        let all = manager.list("alice", None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].registered_at >= w[1].registered_at));
        assert!(manager.list("alice", Some(TaskStatus::Cancelled)).unwrap().is_empty());
        assert!(manager.list("bob", None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_group_starts_and_finishes() {
        let fx = Fixture::new();
        let (parent_id, child_ids) = fx.group(2).await;
        let manager = fx.manager();

        let mut first = manager.sync_group(&parent_id).await.unwrap();
        first.started_jobs.sort();
        assert_eq!(first.started_jobs, vec!["remote-1", "remote-2"]);
        assert_eq!(first.parent_status, TaskStatus::Queued);

        let second = manager.sync_group(&parent_id).await.unwrap();
        assert!(second.started_jobs.is_empty());
        assert_eq!(second.updated_children.len(), 2);
        assert_eq!(second.parent_status, TaskStatus::InProgress);

        fx.processor.set_status("remote-1", "DONE");
        fx.processor.set_status("remote-2", "DONE");
        let third = manager.sync_group(&parent_id).await.unwrap();
        assert_eq!(third.parent_status, TaskStatus::FinishedOk);
        for child_id in &child_ids {
            assert_eq!(
                fx.registry.get(child_id).unwrap().unwrap().status,
                TaskStatus::FinishedOk
            );
        }
    }

    #[tokio::test]
    async fn test_sync_group_reports_unmapped() {
        let fx = Fixture::new();
        let (parent_id, _) = fx.group(1).await;
        fx.processor.set_status("remote-1", "SOMETHING_NEW");

        let report = fx.manager().sync_group(&parent_id).await.unwrap();
        assert_eq!(report.unmapped_jobs, vec!["remote-1"]);
        assert_eq!(report.parent_status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_dispatch_requires_finished_children() {
        let fx = Fixture::new();
        let (parent_id, child_ids) = fx.group(2).await;
        let manager = fx.manager();
        let sink = MockNotificationSink::new();
        let request = DispatchRequest {
            contact: "alice@example.org".into(),
            callback_url: "https://example.org/cb".into(),
        };

        assert!(matches!(
            manager.dispatch(&parent_id, &sink, &request).await,
            Err(TaskError::NotReady { .. })
        ));

        for child_id in &child_ids {
            fx.registry
                .merge(child_id, &TaskPatch::status(TaskStatus::FinishedOk))
                .unwrap();
        }
        let outcome = manager.dispatch(&parent_id, &sink, &request).await.unwrap();
        assert!(!outcome.already_dispatched);
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(sink.sent()[0].datasets.len(), 2);

        let parent = fx.registry.get(&parent_id).unwrap().unwrap();
        assert!(parent.is_dispatched());
        assert_eq!(parent.status, TaskStatus::FinishedOk);

        let again = manager.dispatch(&parent_id, &sink, &request).await.unwrap();
        assert!(again.already_dispatched);
        assert_eq!(again.external_task_id, outcome.external_task_id);
        assert_eq!(sink.sent().len(), 1);
    }

    /// Rejects the first `collisions` inserts as if the id were taken.
    struct CollidingRegistry {
        inner: FjallRegistry,
        collisions: AtomicUsize,
    }

    impl TaskRegistry for CollidingRegistry {
        fn insert_if_absent(&self, task: &DownloadTask) -> crate::ledger::Result<bool> {
            let left = self.collisions.load(Ordering::SeqCst);
            if left > 0 {
                self.collisions.store(left - 1, Ordering::SeqCst);
                return Ok(false);
            }
            self.inner.insert_if_absent(task)
        }
        fn get(&self, task_id: &str) -> crate::ledger::Result<Option<DownloadTask>> {
            self.inner.get(task_id)
        }
        fn merge(
            &self,
            task_id: &str,
            patch: &TaskPatch,
        ) -> crate::ledger::Result<Option<DownloadTask>> {
            self.inner.merge(task_id, patch)
        }
        fn merge_if(
            &self,
            task_id: &str,
            expected: TaskStatus,
            patch: &TaskPatch,
        ) -> crate::ledger::Result<GuardedMerge> {
            self.inner.merge_if(task_id, expected, patch)
        }
        fn delete(&self, task_id: &str) -> crate::ledger::Result<bool> {
            self.inner.delete(task_id)
        }
        fn search(
            &self,
            owner_id: &str,
            status: Option<TaskStatus>,
        ) -> crate::ledger::Result<Vec<DownloadTask>> {
            self.inner.search(owner_id, status)
        }
        fn find_by_field(&self, field: &str, value: &Value) -> crate::ledger::Result<Vec<DownloadTask>> {
            self.inner.find_by_field(field, value)
        }
    }

    /// Cancels `target` behind the caller's back right before the first
    /// guarded merge, as a concurrent request would.
    struct InterleavingRegistry {
        inner: FjallRegistry,
        target: String,
        fired: AtomicUsize,
    }

    impl TaskRegistry for InterleavingRegistry {
        fn insert_if_absent(&self, task: &DownloadTask) -> crate::ledger::Result<bool> {
            self.inner.insert_if_absent(task)
        }
        fn get(&self, task_id: &str) -> crate::ledger::Result<Option<DownloadTask>> {
            self.inner.get(task_id)
        }
        fn merge(
            &self,
            task_id: &str,
            patch: &TaskPatch,
        ) -> crate::ledger::Result<Option<DownloadTask>> {
            self.inner.merge(task_id, patch)
        }
        fn merge_if(
            &self,
            task_id: &str,
            expected: TaskStatus,
            patch: &TaskPatch,
        ) -> crate::ledger::Result<GuardedMerge> {
            if self.fired.fetch_add(1, Ordering::SeqCst) == 0 {
                self.inner
                    .merge(&self.target, &TaskPatch::status(TaskStatus::Cancelled))?;
            }
            self.inner.merge_if(task_id, expected, patch)
        }
        fn delete(&self, task_id: &str) -> crate::ledger::Result<bool> {
            self.inner.delete(task_id)
        }
        fn search(
            &self,
            owner_id: &str,
            status: Option<TaskStatus>,
        ) -> crate::ledger::Result<Vec<DownloadTask>> {
            self.inner.search(owner_id, status)
        }
        fn find_by_field(&self, field: &str, value: &Value) -> crate::ledger::Result<Vec<DownloadTask>> {
            self.inner.find_by_field(field, value)
        }
    }

    #[tokio::test]
    async fn test_patch_rechecks_after_losing_race() {
        let fx = Fixture::new();
        let (_, child_ids) = fx.group(1).await;
        let registry = InterleavingRegistry {
            inner: fx.registry.clone(),
            target: child_ids[0].clone(),
            fired: AtomicUsize::new(0),
        };
        let manager = TaskManager::new(&registry, &fx.processor, &fx.storage);

        let result = manager.patch_status(&child_ids[0], &fields(json!({"Status": "Finished_ok"})));
        assert!(matches!(
            result,
            Err(TaskError::InvalidTransition {
                from: TaskStatus::Cancelled,
                to: TaskStatus::FinishedOk
            })
        ));
        assert_eq!(
            fx.registry.get(&child_ids[0]).unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_after_losing_race_skips_fan_out() {
        let fx = Fixture::new();
        let (parent_id, _) = fx.group(2).await;
        let registry = InterleavingRegistry {
            inner: fx.registry.clone(),
            target: parent_id.clone(),
            fired: AtomicUsize::new(0),
        };
        let manager = TaskManager::new(&registry, &fx.processor, &fx.storage);

        let outcome = manager.cancel(&parent_id, "alice").await.unwrap();
        assert!(outcome.already_cancelled);
        assert!(fx.processor.stopped().is_empty());
        assert_eq!(fx.registry.search("alice", None).unwrap().len(), 3);
    }

    #[test]
    fn test_id_collisions_are_retried() {
        let fx = Fixture::new();
        let registry = CollidingRegistry {
            inner: fx.registry.clone(),
            collisions: AtomicUsize::new(ID_ATTEMPTS - 1),
        };
        let manager = TaskManager::new(&registry, &fx.processor, &fx.storage);
        let id = manager.create_rejected("g", "alice", "ds", "x").unwrap();
        assert!(fx.registry.get(&id).unwrap().is_some());

        registry.collisions.store(ID_ATTEMPTS, Ordering::SeqCst);
        assert!(matches!(
            manager.create_rejected("g", "alice", "ds", "x"),
            Err(TaskError::IdAllocationExhausted(ID_ATTEMPTS))
        ));
    }

    #[test]
    fn test_registry_errors_propagate() {
        let err: TaskError = RegistryError::Lock.into();
        assert!(matches!(err, TaskError::Registry(_)));
    }
}
