//! Tasks: units of human decision work
//!
//! A task is created by the engine when an action step activates (or is
//! re-dispatched after a rejection). It moves out of `Pending` exactly
//! once. A rejected task is superseded by a new task, never reused.

use crate::{StepId, SubjectId, UserId, WorkflowError, WorkflowInstanceId, WorkflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a task
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one activation of a step; tasks created for the activation
/// and its re-dispatches share it
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationId(pub String);

impl ActivationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ActivationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Task ─────────────────────────────────────────────────────────────

/// A unit of human decision work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// The instance this task belongs to
    pub instance_id: WorkflowInstanceId,
    /// The step that created this task
    pub step_id: StepId,
    /// The step activation this task was dispatched for
    pub activation_id: ActivationId,
    /// The business object under decision
    pub subject_id: SubjectId,
    /// Users allowed to resolve this task
    pub eligible_validators: BTreeSet<UserId>,
    /// Users who already rejected within this activation chain
    pub attempted_validators: BTreeSet<UserId>,
    /// Current status
    pub status: TaskStatus,
    /// Who resolved the task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<UserId>,
    /// Free-text comment given with the decision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// The rejected task this one replaces
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<TaskId>,
    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// When the task left `Pending`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task
    pub fn new(
        instance_id: WorkflowInstanceId,
        step_id: StepId,
        activation_id: ActivationId,
        subject_id: SubjectId,
        eligible_validators: BTreeSet<UserId>,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            instance_id,
            step_id,
            activation_id,
            subject_id,
            eligible_validators,
            attempted_validators: BTreeSet::new(),
            status: TaskStatus::Pending,
            resolved_by: None,
            comment: None,
            supersedes: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn with_attempted(mut self, attempted: BTreeSet<UserId>) -> Self {
        self.attempted_validators = attempted;
        self
    }

    pub fn superseding(mut self, rejected: TaskId) -> Self {
        self.supersedes = Some(rejected);
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    pub fn is_eligible(&self, user: &UserId) -> bool {
        self.eligible_validators.contains(user)
    }

    /// Check that `user` may resolve this task now.
    ///
    /// Eligibility is checked first, so an ineligible user gets
    /// `NotEligible` whatever the task status.
    pub fn check_resolvable(&self, user: &UserId) -> WorkflowResult<()> {
        if !self.is_eligible(user) {
            return Err(WorkflowError::NotEligible {
                task_id: self.id.clone(),
                user: user.clone(),
            });
        }
        if !self.is_pending() {
            return Err(WorkflowError::AlreadyResolved {
                task_id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Resolve the task. This is the only way out of `Pending` besides
    /// cancellation; on reject the resolver joins `attempted_validators`.
    pub fn resolve(
        &mut self,
        user: &UserId,
        decision: Decision,
        comment: Option<String>,
    ) -> WorkflowResult<()> {
        self.check_resolvable(user)?;

        self.status = match decision {
            Decision::Accept => TaskStatus::Accepted,
            Decision::Reject => {
                self.attempted_validators.insert(user.clone());
                TaskStatus::Rejected
            }
        };
        self.resolved_by = Some(user.clone());
        self.comment = comment;
        self.resolved_at = Some(Utc::now());
        Ok(())
    }

    /// Cancel a pending task. Returns false if it had already left `Pending`.
    pub fn cancel(&mut self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.resolved_at = Some(Utc::now());
        true
    }
}

// ── Status & Decision ────────────────────────────────────────────────

/// Lifecycle status of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TaskStatus {
    /// Waiting for a validator
    #[default]
    Pending,
    /// Accepted by a validator (terminal)
    Accepted,
    /// Rejected by a validator and superseded (terminal)
    Rejected,
    /// Made non-actionable by the engine (terminal)
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A validator's decision on a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Accept,
    Reject,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Reject => write!(f, "reject"),
        }
    }
}
