//! Deferred registry writes.
//!
//! A [`UnitOfWork`] wraps a registry for the duration of one request. Writes
//! are queued instead of applied; reads see the queued state. [`commit`]
//! replays the queue once, in FIFO order of first appearance, with repeated
//! writes to the same task folded together. Dropping the unit (or calling
//! [`discard`]) applies nothing queued.
//!
//! Status-guarded merges ([`TaskRegistry::merge_if`]) on a task the unit has
//! not touched go straight to the wrapped registry, so a concurrent unit sees
//! the new status at once. On a task the unit already holds they are queued
//! with their expected status, which commit checks again.
//!
//! [`commit`]: UnitOfWork::commit
//! [`discard`]: UnitOfWork::discard

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, info};

use super::error::{RegistryError, Result};
use super::registry::{GuardedMerge, TaskRegistry, field_matches};
use crate::tasks::{DownloadTask, TaskPatch, TaskStatus};

#[derive(Debug, Clone)]
enum Effect {
    Insert(DownloadTask),
    /// Patch plus the stored status it was checked against, if guarded
    Merge(String, TaskPatch, Option<TaskStatus>),
    Delete(String),
}

impl Effect {
    fn task_id(&self) -> &str {
        match self {
            Effect::Insert(task) => &task.task_id,
            Effect::Merge(id, ..) | Effect::Delete(id) => id,
        }
    }
}

#[derive(Default)]
struct Pending {
    effects: Vec<Effect>,
    /// Queued view of touched tasks; `None` marks a queued delete
    overlay: HashMap<String, Option<DownloadTask>>,
}

pub struct UnitOfWork<'a> {
    inner: &'a dyn TaskRegistry,
    pending: Mutex<Pending>,
}

impl<'a> UnitOfWork<'a> {
    pub fn new(inner: &'a dyn TaskRegistry) -> Self {
        Self {
            inner,
            pending: Mutex::new(Pending::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Pending>> {
        self.pending.lock().map_err(|_| RegistryError::Lock)
    }

    pub fn pending_effects(&self) -> usize {
        self.lock().map(|p| p.effects.len()).unwrap_or(0)
    }

    /// Apply the queued effects to the wrapped registry. Returns how many
    /// writes reached it after coalescing.
    pub fn commit(mut self) -> Result<usize> {
        let effects = match self.pending.get_mut() {
            Ok(pending) => std::mem::take(&mut pending.effects),
            Err(_) => return Err(RegistryError::Lock),
        };
        let queued = effects.len();
        let effects = coalesce(effects);

        for effect in &effects {
            match effect {
                Effect::Insert(task) => {
                    if !self.inner.insert_if_absent(task)? {
                        return Err(RegistryError::Conflict(task.task_id.clone()));
                    }
                }
                Effect::Merge(id, patch, None) => {
                    if self.inner.merge(id, patch)?.is_none() {
                        debug!(task_id = %id, "Merged task vanished before commit");
                    }
                }
                Effect::Merge(id, patch, Some(expected)) => {
                    match self.inner.merge_if(id, *expected, patch)? {
                        GuardedMerge::Applied(_) => {}
                        GuardedMerge::Stale(found) => {
                            return Err(RegistryError::StaleStatus {
                                task_id: id.clone(),
                                expected: *expected,
                                found: found.status,
                            });
                        }
                        GuardedMerge::Missing => {
                            debug!(task_id = %id, "Merged task vanished before commit");
                        }
                    }
                }
                Effect::Delete(id) => {
                    self.inner.delete(id)?;
                }
            }
        }

        info!(queued, applied = effects.len(), "Committed unit of work");
        Ok(effects.len())
    }

    pub fn discard(self) {
        debug!(pending = self.pending_effects(), "Discarded unit of work");
    }

    fn overlaid(&self, pending: &Pending, task_id: &str) -> Result<Option<DownloadTask>> {
        match pending.overlay.get(task_id) {
            Some(queued) => Ok(queued.clone()),
            None => self.inner.get(task_id),
        }
    }

    fn overlay_filter(
        pending: &Pending,
        base: Vec<DownloadTask>,
        keep: impl Fn(&DownloadTask) -> Result<bool>,
    ) -> Result<Vec<DownloadTask>> {
        let mut found: Vec<DownloadTask> = base
            .into_iter()
            .filter(|t| !pending.overlay.contains_key(&t.task_id))
            .collect();
        for task in pending.overlay.values().flatten() {
            if keep(task)? {
                found.push(task.clone());
            }
        }
        Ok(found)
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if let Ok(pending) = self.pending.get_mut() {
            if !pending.effects.is_empty() {
                debug!(
                    pending = pending.effects.len(),
                    "Unit of work dropped without commit"
                );
            }
        }
    }
}

impl TaskRegistry for UnitOfWork<'_> {
    fn insert_if_absent(&self, task: &DownloadTask) -> Result<bool> {
        let mut pending = self.lock()?;
        if self.overlaid(&pending, &task.task_id)?.is_some() {
            return Ok(false);
        }
        pending
            .overlay
            .insert(task.task_id.clone(), Some(task.clone()));
        pending.effects.push(Effect::Insert(task.clone()));
        Ok(true)
    }

    fn get(&self, task_id: &str) -> Result<Option<DownloadTask>> {
        let pending = self.lock()?;
        self.overlaid(&pending, task_id)
    }

    fn merge(&self, task_id: &str, patch: &TaskPatch) -> Result<Option<DownloadTask>> {
        let mut pending = self.lock()?;
        let Some(mut task) = self.overlaid(&pending, task_id)? else {
            return Ok(None);
        };
        patch.apply(&mut task);
        pending
            .overlay
            .insert(task_id.to_string(), Some(task.clone()));
        pending
            .effects
            .push(Effect::Merge(task_id.to_string(), patch.clone(), None));
        Ok(Some(task))
    }

    fn merge_if(
        &self,
        task_id: &str,
        expected: TaskStatus,
        patch: &TaskPatch,
    ) -> Result<GuardedMerge> {
        let mut pending = self.lock()?;
        let Some(queued) = pending.overlay.get(task_id).cloned() else {
            return self.inner.merge_if(task_id, expected, patch);
        };
        let Some(mut task) = queued else {
            return Ok(GuardedMerge::Missing);
        };
        if task.status != expected {
            return Ok(GuardedMerge::Stale(task));
        }
        patch.apply(&mut task);
        pending
            .overlay
            .insert(task_id.to_string(), Some(task.clone()));
        pending.effects.push(Effect::Merge(
            task_id.to_string(),
            patch.clone(),
            Some(expected),
        ));
        Ok(GuardedMerge::Applied(task))
    }

    fn delete(&self, task_id: &str) -> Result<bool> {
        let mut pending = self.lock()?;
        if self.overlaid(&pending, task_id)?.is_none() {
            return Ok(false);
        }
        pending.overlay.insert(task_id.to_string(), None);
        pending.effects.push(Effect::Delete(task_id.to_string()));
        Ok(true)
    }

    fn search(&self, owner_id: &str, status: Option<TaskStatus>) -> Result<Vec<DownloadTask>> {
        let pending = self.lock()?;
        let base = self.inner.search(owner_id, status)?;
        Self::overlay_filter(&pending, base, |t| {
            Ok(t.owner_id == owner_id && status.is_none_or(|s| t.status == s))
        })
    }

    fn find_by_field(&self, field: &str, value: &Value) -> Result<Vec<DownloadTask>> {
        let pending = self.lock()?;
        let base = self.inner.find_by_field(field, value)?;
        Self::overlay_filter(&pending, base, |t| field_matches(t, field, value))
    }
}

/// Fold repeated writes to one task into the slot of its first write.
fn coalesce(effects: Vec<Effect>) -> Vec<Effect> {
    let mut out: Vec<Option<Effect>> = Vec::with_capacity(effects.len());
    let mut open: HashMap<String, usize> = HashMap::new();

    for effect in effects {
        let id = effect.task_id().to_string();
        let Some(&i) = open.get(&id) else {
            open.insert(id, out.len());
            out.push(Some(effect));
            continue;
        };

        let slot = &mut out[i];
        match (slot.take(), effect) {
            (Some(Effect::Insert(mut task)), Effect::Merge(_, patch, _)) => {
                patch.apply(&mut task);
                *slot = Some(Effect::Insert(task));
            }
            // the first guard is the one that holds against the registry
            (Some(Effect::Merge(_, mut queued, first)), Effect::Merge(_, patch, later)) => {
                queued.then(&patch);
                *slot = Some(Effect::Merge(id, queued, first.or(later)));
            }
            // created and removed inside the unit: the registry never sees it
            (Some(Effect::Insert(_)), Effect::Delete(_)) => {
                open.remove(&id);
            }
            (Some(Effect::Merge(..)), Effect::Delete(_)) => {
                *slot = Some(Effect::Delete(id));
            }
            (previous, effect) => {
                *slot = previous;
                open.insert(id, out.len());
                out.push(Some(effect));
            }
        }
    }

    out.into_iter().flatten().collect()
}
