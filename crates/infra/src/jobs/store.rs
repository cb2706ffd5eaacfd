//! Task storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use reportforge_core::{ExportError, OwnerId, TaskId, WorkerId};

use super::types::{ExportTask, TaskStatus, TransitionError};

/// Mutator applied by [`TaskStore::update`]. Returning an error leaves the task untouched.
pub type TaskMutator<'a> = &'a mut dyn FnMut(&mut ExportTask) -> Result<(), TransitionError>;

/// Durable task bookkeeping.
///
/// Implementations must make `claim_pending` and `update` atomic per task: two callers
/// racing to claim the same PENDING task see exactly one winner.
pub trait TaskStore: Send + Sync {
    fn create(&self, task: ExportTask) -> Result<TaskId, TaskStoreError>;

    fn get(&self, id: TaskId) -> Result<Option<ExportTask>, TaskStoreError>;

    /// Apply `mutate` atomically and return the updated task.
    fn update(&self, id: TaskId, mutate: TaskMutator<'_>) -> Result<ExportTask, TaskStoreError>;

    /// Move the task PENDING -> RUNNING for `worker` if it is still PENDING.
    ///
    /// `Ok(None)` when the task is gone or no longer PENDING.
    fn claim_pending(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportTask>, TaskStoreError>;

    /// Tasks in `status`, oldest first.
    fn list_by_status(&self, status: TaskStatus) -> Result<Vec<ExportTask>, TaskStoreError>;

    /// Tasks submitted by `owner`, newest first.
    fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<ExportTask>, TaskStoreError>;

    /// Every task, newest first.
    fn list_all(&self) -> Result<Vec<ExportTask>, TaskStoreError>;

    /// Flip RUNNING tasks with no heartbeat since `threshold` back to PENDING.
    fn reset_stuck(
        &self,
        threshold: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExportTask>, TaskStoreError>;

    /// Remove tasks whose `expire_at` is before `now` and return them.
    fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<ExportTask>, TaskStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<TaskStoreError> for ExportError {
    fn from(value: TaskStoreError) -> Self {
        ExportError::store(value.to_string())
    }
}

fn poisoned<T>(_: T) -> TaskStoreError {
    TaskStoreError::Storage("task store lock poisoned".to_string())
}

fn oldest_first(tasks: &mut [ExportTask]) {
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

fn newest_first(tasks: &mut [ExportTask]) {
    oldest_first(tasks);
    tasks.reverse();
}

/// In-memory task store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, ExportTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn collect(
        &self,
        filter: impl Fn(&ExportTask) -> bool,
    ) -> Result<Vec<ExportTask>, TaskStoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.values().filter(|t| filter(t)).cloned().collect())
    }
}

impl TaskStore for InMemoryTaskStore {
    fn create(&self, task: ExportTask) -> Result<TaskId, TaskStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        if tasks.contains_key(&task.id) {
            return Err(TaskStoreError::AlreadyExists(task.id));
        }
        let id = task.id;
        tasks.insert(id, task);
        Ok(id)
    }

    fn get(&self, id: TaskId) -> Result<Option<ExportTask>, TaskStoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.get(&id).cloned())
    }

    fn update(&self, id: TaskId, mutate: TaskMutator<'_>) -> Result<ExportTask, TaskStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let task = tasks.get_mut(&id).ok_or(TaskStoreError::NotFound(id))?;

        let mut draft = task.clone();
        mutate(&mut draft)?;
        *task = draft;
        Ok(task.clone())
    }

    fn claim_pending(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportTask>, TaskStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        match tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.mark_running(worker, now)?;
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    fn list_by_status(&self, status: TaskStatus) -> Result<Vec<ExportTask>, TaskStoreError> {
        let mut result = self.collect(|t| t.status == status)?;
        oldest_first(&mut result);
        Ok(result)
    }

    fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<ExportTask>, TaskStoreError> {
        let mut result = self.collect(|t| &t.owner == owner)?;
        newest_first(&mut result);
        Ok(result)
    }

    fn list_all(&self) -> Result<Vec<ExportTask>, TaskStoreError> {
        let mut result = self.collect(|_| true)?;
        newest_first(&mut result);
        Ok(result)
    }

    fn reset_stuck(
        &self,
        threshold: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExportTask>, TaskStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let mut reset = Vec::new();
        for task in tasks.values_mut().filter(|t| t.is_stale(threshold)) {
            task.reset_to_pending(now)?;
            reset.push(task.clone());
        }
        oldest_first(&mut reset);
        Ok(reset)
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<ExportTask>, TaskStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let expired: Vec<TaskId> = tasks
            .values()
            .filter(|t| t.expire_at < now)
            .map(|t| t.id)
            .collect();
        let mut removed: Vec<_> = expired.iter().filter_map(|id| tasks.remove(id)).collect();
        oldest_first(&mut removed);
        Ok(removed)
    }
}

impl<S: TaskStore + ?Sized> TaskStore for Arc<S> {
    fn create(&self, task: ExportTask) -> Result<TaskId, TaskStoreError> {
        (**self).create(task)
    }

    fn get(&self, id: TaskId) -> Result<Option<ExportTask>, TaskStoreError> {
        (**self).get(id)
    }

    fn update(&self, id: TaskId, mutate: TaskMutator<'_>) -> Result<ExportTask, TaskStoreError> {
        (**self).update(id, mutate)
    }

    fn claim_pending(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportTask>, TaskStoreError> {
        (**self).claim_pending(id, worker, now)
    }

    fn list_by_status(&self, status: TaskStatus) -> Result<Vec<ExportTask>, TaskStoreError> {
        (**self).list_by_status(status)
    }

    fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<ExportTask>, TaskStoreError> {
        (**self).list_by_owner(owner)
    }

    fn list_all(&self) -> Result<Vec<ExportTask>, TaskStoreError> {
        (**self).list_all()
    }

    fn reset_stuck(
        &self,
        threshold: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExportTask>, TaskStoreError> {
        (**self).reset_stuck(threshold, now)
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<ExportTask>, TaskStoreError> {
        (**self).delete_expired(now)
    }
}
