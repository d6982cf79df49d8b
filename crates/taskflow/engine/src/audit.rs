//! Audit trail: ordered record of everything that happened to an instance
//!
//! Records are appended after the state change they describe has been
//! committed, and numbered per instance in append order.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use taskflow_types::{
    Decision, ErrorClass, StepId, TaskId, UserId, WorkflowGraphId, WorkflowInstanceId,
};

/// Audit records for all instances
#[derive(Debug, Default)]
pub struct AuditTrail {
    /// Records indexed by instance ID
    records: DashMap<WorkflowInstanceId, Vec<AuditRecord>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record
    pub fn record(&self, instance_id: &WorkflowInstanceId, record: AuditRecord) {
        self.append(instance_id, vec![record]);
    }

    /// Append records in order, assigning their sequence numbers
    pub fn append(&self, instance_id: &WorkflowInstanceId, records: Vec<AuditRecord>) {
        if records.is_empty() {
            return;
        }
        let mut trail = self.records.entry(instance_id.clone()).or_default();
        for mut record in records {
            record.sequence = trail.len() as u64 + 1;
            tracing::trace!(
                instance_id = %instance_id,
                sequence = record.sequence,
                event = %record.event,
                "Audit recorded"
            );
            trail.push(record);
        }
    }

    // ── Query methods ────────────────────────────────────────────────

    /// All records of an instance, oldest first
    pub fn records_for(&self, instance_id: &WorkflowInstanceId) -> Vec<AuditRecord> {
        self.records
            .get(instance_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn record_count(&self, instance_id: &WorkflowInstanceId) -> usize {
        self.records.get(instance_id).map(|r| r.len()).unwrap_or(0)
    }

    /// Records that mention a step
    pub fn records_for_step(
        &self,
        instance_id: &WorkflowInstanceId,
        step_id: &StepId,
    ) -> Vec<AuditRecord> {
        self.records_for(instance_id)
            .into_iter()
            .filter(|r| r.event.involves_step(step_id))
            .collect()
    }

    /// Total records across all instances
    pub fn total_records(&self) -> usize {
        self.records.iter().map(|r| r.len()).sum()
    }
}

/// One entry of an instance's audit trail
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the instance's trail, starting at 1
    pub sequence: u64,
    /// What happened
    pub event: AuditEvent,
    /// Human-readable description
    pub description: String,
    /// Who caused it, when a user did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<UserId>,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(event: AuditEvent, description: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            event,
            description: description.into(),
            actor: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor: UserId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn started(graph_id: &WorkflowGraphId, subject: impl std::fmt::Display) -> Self {
        Self::new(
            AuditEvent::WorkflowStarted {
                graph_id: graph_id.clone(),
            },
            format!("Workflow started for subject {}", subject),
        )
    }

    pub fn step_entered(step_id: &StepId) -> Self {
        Self::new(
            AuditEvent::StepEntered {
                step_id: step_id.clone(),
            },
            format!("Step '{}' entered", step_id),
        )
    }

    pub fn switch_selected(switch: &StepId, selected: &StepId) -> Self {
        Self::new(
            AuditEvent::SwitchSelected {
                switch: switch.clone(),
                selected: selected.clone(),
            },
            format!("Switch '{}' selected '{}'", switch, selected),
        )
    }

    pub fn task_created(task_id: &TaskId, step_id: &StepId, validators: Vec<UserId>) -> Self {
        let description = format!(
            "Task {} created at '{}' for {} validator(s)",
            task_id,
            step_id,
            validators.len()
        );
        Self::new(
            AuditEvent::TaskCreated {
                task_id: task_id.clone(),
                step_id: step_id.clone(),
                validators,
            },
            description,
        )
    }

    pub fn task_resolved(task_id: &TaskId, decision: Decision, user: &UserId) -> Self {
        Self::new(
            AuditEvent::TaskResolved {
                task_id: task_id.clone(),
                decision,
            },
            format!("Task {} resolved: {}", task_id, decision),
        )
        .with_actor(user.clone())
    }

    pub fn task_cancelled(task_id: &TaskId) -> Self {
        Self::new(
            AuditEvent::TaskCancelled {
                task_id: task_id.clone(),
            },
            format!("Task {} cancelled", task_id),
        )
    }

    pub fn step_completed(step_id: &StepId) -> Self {
        Self::new(
            AuditEvent::StepCompleted {
                step_id: step_id.clone(),
            },
            format!("Step '{}' completed", step_id),
        )
    }

    pub fn completed() -> Self {
        Self::new(AuditEvent::WorkflowCompleted, "Workflow completed")
    }

    pub fn failed(class: ErrorClass, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            AuditEvent::WorkflowFailed {
                class,
                reason: reason.clone(),
            },
            format!("Workflow failed: {}", reason),
        )
    }

    pub fn reopened(step_id: &StepId, operator: &UserId) -> Self {
        Self::new(
            AuditEvent::WorkflowReopened {
                step_id: step_id.clone(),
            },
            format!("Workflow reopened at '{}'", step_id),
        )
        .with_actor(operator.clone())
    }
}

/// Kinds of audit events
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuditEvent {
    /// An instance was created
    WorkflowStarted { graph_id: WorkflowGraphId },
    /// The engine entered a step
    StepEntered { step_id: StepId },
    /// A switch picked its successor
    SwitchSelected { switch: StepId, selected: StepId },
    /// A task was dispatched
    TaskCreated {
        task_id: TaskId,
        step_id: StepId,
        validators: Vec<UserId>,
    },
    /// A validator resolved a task
    TaskResolved { task_id: TaskId, decision: Decision },
    /// The engine cancelled a pending task
    TaskCancelled { task_id: TaskId },
    /// A step's tasks were accepted and the instance moved on
    StepCompleted { step_id: StepId },
    /// The instance reached a terminal step
    WorkflowCompleted,
    /// The instance failed
    WorkflowFailed { class: ErrorClass, reason: String },
    /// An operator re-routed a failed instance
    WorkflowReopened { step_id: StepId },
}

impl AuditEvent {
    pub fn involves_step(&self, step: &StepId) -> bool {
        match self {
            Self::StepEntered { step_id }
            | Self::StepCompleted { step_id }
            | Self::TaskCreated { step_id, .. }
            | Self::WorkflowReopened { step_id } => step_id == step,
            Self::SwitchSelected { switch, selected } => switch == step || selected == step,
            _ => false,
        }
    }
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkflowStarted { .. } => write!(f, "workflow_started"),
            Self::StepEntered { step_id } => write!(f, "step_entered:{}", step_id),
            Self::SwitchSelected { switch, selected } => {
                write!(f, "switch:{}→{}", switch, selected)
            }
            Self::TaskCreated { task_id, .. } => write!(f, "task_created:{}", task_id),
            Self::TaskResolved { task_id, decision } => {
                write!(f, "task_resolved:{}:{}", task_id, decision)
            }
            Self::TaskCancelled { task_id } => write!(f, "task_cancelled:{}", task_id),
            Self::StepCompleted { step_id } => write!(f, "step_completed:{}", step_id),
            Self::WorkflowCompleted => write!(f, "workflow_completed"),
            Self::WorkflowFailed { .. } => write!(f, "workflow_failed"),
            Self::WorkflowReopened { step_id } => write!(f, "workflow_reopened:{}", step_id),
        }
    }
}
