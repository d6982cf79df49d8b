//! Completed workflows: the final record of a workflow execution
//!
//! When an instance reaches a terminal status (completed or failed),
//! a CompletedWorkflow record is produced from the instance and every
//! task it ever created.

use crate::{
    FailureRecord, InstanceStatus, StepId, SubjectId, Task, TaskStatus, UserId, WorkflowGraphId,
    WorkflowInstance, WorkflowInstanceId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// The completed record of a workflow execution
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletedWorkflow {
    /// The instance ID
    pub instance_id: WorkflowInstanceId,
    /// The graph this was created from
    pub graph_id: WorkflowGraphId,
    /// The subject the workflow was about
    pub subject_id: SubjectId,
    /// Final status (Completed or Failed)
    pub final_status: InstanceStatus,
    /// The step the instance ended on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_step: Option<StepId>,
    /// Why the instance failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    /// Per-step task outcomes, in order of first activation
    pub step_outcomes: Vec<StepOutcome>,
    /// When the workflow started
    pub started_at: DateTime<Utc>,
    /// When the workflow ended
    pub ended_at: DateTime<Utc>,
    /// Total duration in seconds
    pub duration_secs: i64,
    /// Metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl CompletedWorkflow {
    /// Build the archive record from a finished instance and its tasks
    pub fn from_instance(instance: &WorkflowInstance, tasks: &[Task]) -> Self {
        let ended_at = instance.finished_at.unwrap_or(instance.updated_at);
        Self {
            instance_id: instance.id.clone(),
            graph_id: instance.graph_id.clone(),
            subject_id: instance.subject_id.clone(),
            final_status: instance.status,
            final_step: instance.current_step_id.clone(),
            failure: instance.failure.clone(),
            step_outcomes: StepOutcome::collect(tasks),
            started_at: instance.created_at,
            ended_at,
            duration_secs: ended_at
                .signed_duration_since(instance.created_at)
                .num_seconds(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    // ── Query methods ────────────────────────────────────────────────

    /// Whether the workflow completed successfully
    pub fn is_success(&self) -> bool {
        self.final_status == InstanceStatus::Completed
    }

    /// Whether the workflow failed
    pub fn is_failure(&self) -> bool {
        self.final_status == InstanceStatus::Failed
    }

    /// Total tasks created during the run
    pub fn task_count(&self) -> usize {
        self.step_outcomes.iter().map(|o| o.task_count).sum()
    }

    /// Every user who resolved at least one task
    pub fn participants(&self) -> BTreeSet<&UserId> {
        self.step_outcomes
            .iter()
            .flat_map(|o| o.accepted_by.iter().chain(o.rejected_by.iter()))
            .collect()
    }
}

/// What happened to the tasks of one step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// The step
    pub step_id: StepId,
    /// Tasks created for the step, re-dispatches included
    pub task_count: usize,
    /// Validators who accepted
    pub accepted_by: Vec<UserId>,
    /// Validators who rejected
    pub rejected_by: Vec<UserId>,
    /// Tasks the engine cancelled
    pub cancelled: usize,
}

impl StepOutcome {
    fn new(step_id: StepId) -> Self {
        Self {
            step_id,
            task_count: 0,
            accepted_by: Vec::new(),
            rejected_by: Vec::new(),
            cancelled: 0,
        }
    }

    /// Group tasks by step, keeping the order in which steps first appear
    pub fn collect(tasks: &[Task]) -> Vec<StepOutcome> {
        let mut outcomes: Vec<StepOutcome> = Vec::new();
        for task in tasks {
            let idx = match outcomes.iter().position(|o| o.step_id == task.step_id) {
                Some(idx) => idx,
                None => {
                    outcomes.push(StepOutcome::new(task.step_id.clone()));
                    outcomes.len() - 1
                }
            };
            let outcome = &mut outcomes[idx];
            outcome.task_count += 1;
            match (task.status, task.resolved_by.as_ref()) {
                (TaskStatus::Accepted, Some(user)) => outcome.accepted_by.push(user.clone()),
                (TaskStatus::Rejected, Some(user)) => outcome.rejected_by.push(user.clone()),
                (TaskStatus::Cancelled, _) => outcome.cancelled += 1,
                _ => {}
            }
        }
        outcomes
    }

    /// Whether at least one task of the step was accepted
    pub fn succeeded(&self) -> bool {
        !self.accepted_by.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActivationId, Decision, WorkflowError};

    fn make_instance() -> WorkflowInstance {
        WorkflowInstance::new(WorkflowGraphId::new("graph-1"), SubjectId::new("po-42"))
    }

    fn make_task(inst: &WorkflowInstance, step: &str, validators: &[&str]) -> Task {
        Task::new(
            inst.id.clone(),
            StepId::new(step),
            ActivationId::new(format!("act-{step}")),
            inst.subject_id.clone(),
            validators.iter().map(|v| UserId::new(*v)).collect(),
        )
    }

    #[test]
    fn test_completed_workflow() {
        let mut inst = make_instance();
        let mut first = make_task(&inst, "review", &["v1", "v2"]);
        first
            .resolve(&UserId::new("v1"), Decision::Reject, None)
            .unwrap();
        let mut second = make_task(&inst, "review", &["v2"]).superseding(first.id.clone());
        second
            .resolve(&UserId::new("v2"), Decision::Accept, None)
            .unwrap();
        inst.complete(StepId::new("done"));

        let completed = CompletedWorkflow::from_instance(&inst, &[first, second]);
        assert!(completed.is_success());
        assert!(!completed.is_failure());
        assert_eq!(completed.task_count(), 2);
        assert_eq!(completed.final_step, Some(StepId::new("done")));
        assert_eq!(completed.step_outcomes.len(), 1);

        let review = &completed.step_outcomes[0];
        assert!(review.succeeded());
        assert_eq!(review.accepted_by, vec![UserId::new("v2")]);
        assert_eq!(review.rejected_by, vec![UserId::new("v1")]);
        assert_eq!(completed.participants().len(), 2);
    }

    #[test]
    fn test_failed_workflow() {
        let mut inst = make_instance();
        let mut task = make_task(&inst, "review", &["v1"]);
        task.resolve(&UserId::new("v1"), Decision::Reject, None)
            .unwrap();
        let mut dangling = make_task(&inst, "other", &["v9"]);
        dangling.cancel();
        inst.fail(&WorkflowError::RoutingExhausted {
            step: StepId::new("review"),
            attempted: vec![UserId::new("v1")],
        });

        let completed =
            CompletedWorkflow::from_instance(&inst, &[task, dangling]).with_metadata("reason", "exhausted");
        assert!(completed.is_failure());
        assert!(completed.failure.is_some());
        assert_eq!(completed.step_outcomes.len(), 2);
        assert!(!completed.step_outcomes[0].succeeded());
        assert_eq!(completed.step_outcomes[1].cancelled, 1);
        assert!(completed.duration_secs >= 0);
    }
}
