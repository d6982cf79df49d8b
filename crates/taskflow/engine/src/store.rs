//! Workflow store: persistence of instances and tasks
//!
//! The engine reaches instance and task records only through
//! [`WorkflowStore`]. Every mutation goes through a guarded update: the
//! closure runs exactly once, under the record's exclusive guard, on a
//! copy that is committed only if the closure returns `Ok`.
//!
//! Guard order is instance before task. Task updates may run inside an
//! instance update; an instance update must never run inside a task
//! update.

use dashmap::DashMap;
use std::collections::BTreeSet;
use taskflow_types::{
    ActivationId, Task, TaskId, UserId, WorkflowError, WorkflowInstance, WorkflowInstanceId,
    WorkflowResult,
};

/// Closure applied by a guarded update
pub type UpdateFn<'a, T> = &'a mut dyn FnMut(&mut T) -> WorkflowResult<()>;

/// Read and guarded-write access to workflow records
pub trait WorkflowStore: Send + Sync {
    fn insert_instance(&self, instance: WorkflowInstance) -> WorkflowResult<()>;

    fn load_instance(&self, id: &WorkflowInstanceId) -> WorkflowResult<WorkflowInstance>;

    /// Guarded update of one instance; returns the committed record
    fn update_instance(
        &self,
        id: &WorkflowInstanceId,
        update: UpdateFn<'_, WorkflowInstance>,
    ) -> WorkflowResult<WorkflowInstance>;

    fn insert_task(&self, task: Task) -> WorkflowResult<()>;

    fn load_task(&self, id: &TaskId) -> WorkflowResult<Task>;

    /// Guarded update of one task; returns the committed record
    fn update_task(&self, id: &TaskId, update: UpdateFn<'_, Task>) -> WorkflowResult<Task>;

    /// Every task of an instance, oldest first
    fn tasks_for_instance(&self, id: &WorkflowInstanceId) -> WorkflowResult<Vec<Task>>;

    /// Every task dispatched for one step activation, oldest first
    fn tasks_for_activation(&self, id: &ActivationId) -> WorkflowResult<Vec<Task>>;

    /// Pending tasks a user is eligible for, oldest first
    fn pending_tasks_for(&self, user: &UserId) -> WorkflowResult<Vec<Task>>;

    fn instance_ids(&self) -> WorkflowResult<Vec<WorkflowInstanceId>>;
}

// ── In-memory store ──────────────────────────────────────────────────

/// Workflow store held in memory, guarded per record by DashMap shards
pub struct InMemoryStore {
    /// All instances indexed by ID
    instances: DashMap<WorkflowInstanceId, WorkflowInstance>,
    /// All tasks indexed by ID
    tasks: DashMap<TaskId, Task>,
    /// Task IDs indexed by instance ID, in creation order
    by_instance: DashMap<WorkflowInstanceId, Vec<TaskId>>,
    /// Task IDs indexed by step activation, in creation order
    by_activation: DashMap<ActivationId, Vec<TaskId>>,
    /// Open tasks indexed by eligible validator
    inbox: DashMap<UserId, BTreeSet<TaskId>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            tasks: DashMap::new(),
            by_instance: DashMap::new(),
            by_activation: DashMap::new(),
            inbox: DashMap::new(),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    fn collect_tasks(&self, ids: &[TaskId]) -> Vec<Task> {
        let mut tasks: Vec<Task> = ids
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|t| t.clone()))
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    fn index_pending(&self, task: &Task) {
        for user in &task.eligible_validators {
            self.inbox
                .entry(user.clone())
                .or_default()
                .insert(task.id.clone());
        }
    }

    fn unindex(&self, task: &Task) {
        for user in &task.eligible_validators {
            if let Some(mut ids) = self.inbox.get_mut(user) {
                ids.remove(&task.id);
            }
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowStore for InMemoryStore {
    fn insert_instance(&self, instance: WorkflowInstance) -> WorkflowResult<()> {
        if self.instances.contains_key(&instance.id) {
            return Err(WorkflowError::Storage(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        self.by_instance.entry(instance.id.clone()).or_default();
        self.instances.insert(instance.id.clone(), instance);
        Ok(())
    }

    fn load_instance(&self, id: &WorkflowInstanceId) -> WorkflowResult<WorkflowInstance> {
        self.instances
            .get(id)
            .map(|i| i.clone())
            .ok_or_else(|| WorkflowError::InstanceNotFound(id.clone()))
    }

    fn update_instance(
        &self,
        id: &WorkflowInstanceId,
        update: UpdateFn<'_, WorkflowInstance>,
    ) -> WorkflowResult<WorkflowInstance> {
        let mut guard = self
            .instances
            .get_mut(id)
            .ok_or_else(|| WorkflowError::InstanceNotFound(id.clone()))?;
        let mut draft = guard.clone();
        update(&mut draft)?;
        *guard = draft.clone();
        Ok(draft)
    }

    fn insert_task(&self, task: Task) -> WorkflowResult<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(WorkflowError::Storage(format!(
                "task {} already exists",
                task.id
            )));
        }
        if task.is_pending() {
            self.index_pending(&task);
        }
        self.by_instance
            .entry(task.instance_id.clone())
            .or_default()
            .push(task.id.clone());
        self.by_activation
            .entry(task.activation_id.clone())
            .or_default()
            .push(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn load_task(&self, id: &TaskId) -> WorkflowResult<Task> {
        self.tasks
            .get(id)
            .map(|t| t.clone())
            .ok_or_else(|| WorkflowError::TaskNotFound(id.clone()))
    }

    fn update_task(&self, id: &TaskId, update: UpdateFn<'_, Task>) -> WorkflowResult<Task> {
        let committed = {
            let mut guard = self
                .tasks
                .get_mut(id)
                .ok_or_else(|| WorkflowError::TaskNotFound(id.clone()))?;
            let mut draft = guard.clone();
            update(&mut draft)?;
            *guard = draft.clone();
            draft
        };
        if !committed.is_pending() {
            self.unindex(&committed);
        }
        Ok(committed)
    }

    fn tasks_for_instance(&self, id: &WorkflowInstanceId) -> WorkflowResult<Vec<Task>> {
        let ids = self
            .by_instance
            .get(id)
            .map(|ids| ids.clone())
            .ok_or_else(|| WorkflowError::InstanceNotFound(id.clone()))?;
        Ok(self.collect_tasks(&ids))
    }

    fn tasks_for_activation(&self, id: &ActivationId) -> WorkflowResult<Vec<Task>> {
        let ids = self
            .by_activation
            .get(id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        Ok(self.collect_tasks(&ids))
    }

    fn pending_tasks_for(&self, user: &UserId) -> WorkflowResult<Vec<Task>> {
        let ids: Vec<TaskId> = self
            .inbox
            .get(user)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        Ok(self
            .collect_tasks(&ids)
            .into_iter()
            .filter(|t| t.is_pending())
            .collect())
    }

    fn instance_ids(&self) -> WorkflowResult<Vec<WorkflowInstanceId>> {
        Ok(self.instances.iter().map(|i| i.key().clone()).collect())
    }
}
