//! Subjects: the business objects workflows are about
//!
//! A type takes part in workflows by implementing [`WorkflowSubject`].
//! The engine never owns subject state; it looks subjects up through a
//! [`SubjectRepository`] and calls their hooks after a task transition
//! has been committed.

use dashmap::DashMap;
use std::sync::Arc;
use taskflow_types::{SubjectId, TaskId, UserId};

/// Capability a business object declares to participate in workflows.
///
/// Hooks run outside every engine guard. They may update the subject's
/// own state but must not call back into the engine.
pub trait WorkflowSubject: Send + Sync {
    /// A validator accepted a task bound to this subject
    fn accept_task(&self, task_id: &TaskId, user: &UserId);

    /// A validator rejected a task bound to this subject
    fn reject_task(&self, task_id: &TaskId, user: &UserId);

    /// The workflow entered a step that declares a lifecycle state
    fn change_state(&self, _state: &str) {}
}

/// Looks subjects up by id (the persistence collaborator for subjects)
pub trait SubjectRepository<S>: Send + Sync {
    fn lookup(&self, id: &SubjectId) -> Option<Arc<S>>;
}

/// Subject repository held in memory
pub struct InMemorySubjects<S> {
    subjects: DashMap<SubjectId, Arc<S>>,
}

impl<S> InMemorySubjects<S> {
    pub fn new() -> Self {
        Self {
            subjects: DashMap::new(),
        }
    }

    /// Add or replace a subject; returns the shared handle
    pub fn insert(&self, id: SubjectId, subject: S) -> Arc<S> {
        let subject = Arc::new(subject);
        self.subjects.insert(id, subject.clone());
        subject
    }

    pub fn remove(&self, id: &SubjectId) -> Option<Arc<S>> {
        self.subjects.remove(id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

impl<S> Default for InMemorySubjects<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Send + Sync> SubjectRepository<S> for InMemorySubjects<S> {
    fn lookup(&self, id: &SubjectId) -> Option<Arc<S>> {
        self.subjects.get(id).map(|s| s.value().clone())
    }
}
