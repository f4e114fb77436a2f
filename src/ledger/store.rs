use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde_json::Value;
use tracing::{debug, info};

use super::error::{RegistryError, Result};
use super::partitions::{
    decode_owner_key, encode_owner_key, encode_owner_prefix, encode_task_key,
};
use super::registry::{GuardedMerge, TaskRegistry, field_matches};
use crate::tasks::{DownloadTask, TaskPatch, TaskStatus};

/// Fjall-backed task registry
#[derive(Clone)]
pub struct FjallRegistry {
    keyspace: Keyspace,
    tasks: PartitionHandle,
    owners: PartitionHandle,
    write_lock: Arc<Mutex<()>>,
}

impl FjallRegistry {
    /// Open or create a registry at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening task registry at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let tasks = keyspace.open_partition("tasks", PartitionCreateOptions::default())?;
        let owners = keyspace.open_partition("owners", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            tasks,
            owners,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| RegistryError::Lock)
    }

    fn read(&self, task_id: &str) -> Result<Option<DownloadTask>> {
        match self.tasks.get(encode_task_key(task_id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn write(&self, task: &DownloadTask) -> Result<()> {
        let value = serde_json::to_vec(task)?;
        self.tasks.insert(encode_task_key(&task.task_id), value)?;
        Ok(())
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let mut count = 0;
        for item in self.tasks.iter() {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

impl TaskRegistry for FjallRegistry {
    fn insert_if_absent(&self, task: &DownloadTask) -> Result<bool> {
        let _guard = self.lock()?;
        if self.tasks.contains_key(encode_task_key(&task.task_id))? {
            debug!(task_id = %task.task_id, "Task id already taken");
            return Ok(false);
        }
        self.write(task)?;
        self.owners
            .insert(encode_owner_key(&task.owner_id, &task.task_id), Vec::<u8>::new())?;
        debug!(task_id = %task.task_id, role = ?task.role, "Inserted task");
        Ok(true)
    }

    fn get(&self, task_id: &str) -> Result<Option<DownloadTask>> {
        self.read(task_id)
    }

    fn merge(&self, task_id: &str, patch: &TaskPatch) -> Result<Option<DownloadTask>> {
        let _guard = self.lock()?;
        let Some(mut task) = self.read(task_id)? else {
            return Ok(None);
        };
        patch.apply(&mut task);
        self.write(&task)?;
        debug!(task_id, status = %task.status, "Merged task patch");
        Ok(Some(task))
    }

    fn merge_if(
        &self,
        task_id: &str,
        expected: TaskStatus,
        patch: &TaskPatch,
    ) -> Result<GuardedMerge> {
        let _guard = self.lock()?;
        let Some(mut task) = self.read(task_id)? else {
            return Ok(GuardedMerge::Missing);
        };
        if task.status != expected {
            debug!(task_id, %expected, found = %task.status, "Guarded merge lost the race");
            return Ok(GuardedMerge::Stale(task));
        }
        patch.apply(&mut task);
        self.write(&task)?;
        debug!(task_id, status = %task.status, "Merged guarded task patch");
        Ok(GuardedMerge::Applied(task))
    }

    fn delete(&self, task_id: &str) -> Result<bool> {
        let _guard = self.lock()?;
        let Some(task) = self.read(task_id)? else {
            return Ok(false);
        };
        self.tasks.remove(encode_task_key(task_id))?;
        self.owners
            .remove(encode_owner_key(&task.owner_id, task_id))?;
        debug!(task_id, "Deleted task");
        Ok(true)
    }

    fn search(&self, owner_id: &str, status: Option<TaskStatus>) -> Result<Vec<DownloadTask>> {
        let mut found = Vec::new();
        for item in self.owners.prefix(encode_owner_prefix(owner_id)) {
            let (key, _) = item?;
            let Some(task_id) = decode_owner_key(&key) else {
                continue;
            };
            let Some(task) = self.read(&task_id)? else {
                continue;
            };
            if task.owner_id == owner_id && status.is_none_or(|s| task.status == s) {
                found.push(task);
            }
        }
        Ok(found)
    }

    fn find_by_field(&self, field: &str, value: &Value) -> Result<Vec<DownloadTask>> {
        let mut found = Vec::new();
        for item in self.tasks.iter() {
            let (_, raw) = item?;
            let task: DownloadTask = serde_json::from_slice(&raw)?;
            if field_matches(&task, field, value)? {
                found.push(task);
            }
        }
        Ok(found)
    }
}
