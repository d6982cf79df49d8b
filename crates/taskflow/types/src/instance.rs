//! Workflow instances: running executions of workflow graphs
//!
//! A WorkflowInstance binds one subject to its position in a graph:
//! the current step, the live activation of that step and, once
//! terminal, how it ended. Only the engine mutates instances, and only
//! inside its guarded advancement path.

use crate::{ActivationId, ErrorClass, StepId, Task, UserId, WorkflowError, WorkflowGraphId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a workflow instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowInstanceId(pub String);

impl WorkflowInstanceId {
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

impl std::fmt::Display for WorkflowInstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the business object a workflow is about
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Workflow Instance ────────────────────────────────────────────────

/// A running (or finished) execution of a workflow graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Unique instance identifier
    pub id: WorkflowInstanceId,
    /// The graph this instance walks
    pub graph_id: WorkflowGraphId,
    /// The business object under workflow
    pub subject_id: SubjectId,
    /// The step the instance is positioned on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<StepId>,
    /// Lifecycle status
    pub status: InstanceStatus,
    /// The live activation of the current step, if it is waiting on tasks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation: Option<StepActivation>,
    /// Why the instance failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    /// Steps completed so far, in order
    #[serde(default)]
    pub completed_steps: Vec<StepId>,
    /// When the instance was created
    pub created_at: DateTime<Utc>,
    /// When the instance was last updated
    pub updated_at: DateTime<Utc>,
    /// When the instance reached a terminal status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Create a new running instance, not yet positioned on a step
    pub fn new(graph_id: WorkflowGraphId, subject_id: SubjectId) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowInstanceId::generate(),
            graph_id,
            subject_id,
            current_step_id: None,
            status: InstanceStatus::Running,
            activation: None,
            failure: None,
            completed_steps: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Position the instance on a step that suspends, with a fresh activation
    pub fn activate_step(&mut self, step_id: StepId, slots: usize) -> &StepActivation {
        self.current_step_id = Some(step_id.clone());
        self.updated_at = Utc::now();
        self.activation.insert(StepActivation::new(step_id, slots))
    }

    /// Close the current activation and record the step as completed
    pub fn complete_step(&mut self, step_id: &StepId) {
        self.activation = None;
        self.completed_steps.push(step_id.clone());
        self.updated_at = Utc::now();
    }

    /// Complete the workflow at a terminal step
    pub fn complete(&mut self, terminal: StepId) {
        self.current_step_id = Some(terminal);
        self.status = InstanceStatus::Completed;
        self.activation = None;
        let now = Utc::now();
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    /// Fail the workflow with a fatal error
    pub fn fail(&mut self, error: &WorkflowError) {
        self.status = InstanceStatus::Failed;
        self.failure = Some(FailureRecord::from_error(error));
        let now = Utc::now();
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    /// Bring a failed instance back to running on its current step
    pub fn reopen(&mut self) {
        self.status = InstanceStatus::Running;
        self.failure = None;
        self.finished_at = None;
        self.updated_at = Utc::now();
    }

    // ── Query methods ────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `activation_id` is the activation the instance is waiting on
    pub fn is_current_activation(&self, activation_id: &ActivationId) -> bool {
        self.is_running()
            && self
                .activation
                .as_ref()
                .map(|a| &a.id == activation_id)
                .unwrap_or(false)
    }

    /// The failure class, if the instance failed
    pub fn failure_class(&self) -> Option<ErrorClass> {
        self.failure.as_ref().map(|f| f.class)
    }

    /// Duration since creation
    pub fn elapsed_secs(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.created_at)
            .num_seconds()
    }
}

// ── Instance Status ──────────────────────────────────────────────────

/// The lifecycle status of a workflow instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InstanceStatus {
    /// Positioned on a step, or being advanced
    #[default]
    Running,
    /// Reached a terminal step
    Completed,
    /// Stopped by a fatal error
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

// ── Step Activation ──────────────────────────────────────────────────

/// One activation of a suspending step and its re-dispatch chain
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepActivation {
    /// Shared by every task of this activation
    pub id: ActivationId,
    /// The activated step
    pub step_id: StepId,
    /// Number of parallel task slots (1 for pooled dispatch)
    pub slots: usize,
    /// Validators that rejected within this activation; only grows
    pub attempted: BTreeSet<UserId>,
    /// When the step was activated
    pub started_at: DateTime<Utc>,
}

impl StepActivation {
    pub fn new(step_id: StepId, slots: usize) -> Self {
        Self {
            id: ActivationId::generate(),
            step_id,
            slots,
            attempted: BTreeSet::new(),
            started_at: Utc::now(),
        }
    }

    /// Record a rejection; returns the attempted set after the insert
    pub fn record_attempt(&mut self, user: &UserId) -> &BTreeSet<UserId> {
        self.attempted.insert(user.clone());
        &self.attempted
    }
}

// ── Failure ──────────────────────────────────────────────────────────

/// Why an instance failed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Integrity or Routing
    pub class: ErrorClass,
    /// Rendered error
    pub message: String,
    /// When the failure happened
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn from_error(error: &WorkflowError) -> Self {
        Self {
            class: error.class(),
            message: error.to_string(),
            failed_at: Utc::now(),
        }
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────

/// Read-only view of an instance and its tasks
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance: WorkflowInstance,
    /// Every task ever created for the instance, oldest first
    pub tasks: Vec<Task>,
}

impl InstanceSnapshot {
    pub fn status(&self) -> InstanceStatus {
        self.instance.status
    }

    pub fn current_step(&self) -> Option<&StepId> {
        self.instance.current_step_id.as_ref()
    }

    pub fn pending_tasks(&self) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.is_pending()).collect()
    }

    pub fn tasks_for_step(&self, step_id: &StepId) -> Vec<&Task> {
        self.tasks.iter().filter(|t| &t.step_id == step_id).collect()
    }
}
