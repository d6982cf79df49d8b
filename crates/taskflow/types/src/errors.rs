//! Error types for the workflow layer

use crate::{StepId, TaskId, TaskStatus, UserId, WorkflowGraphId, WorkflowInstanceId};
use serde::{Deserialize, Serialize};

/// Errors that can occur in workflow operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    // ── Validation: per call, no state change ────────────────────────
    #[error("User '{user}' is not an eligible validator for task {task_id}")]
    NotEligible { task_id: TaskId, user: UserId },

    #[error("Task {task_id} is already resolved ({status:?})")]
    AlreadyResolved { task_id: TaskId, status: TaskStatus },

    // ── Integrity: fatal to the instance ─────────────────────────────
    #[error("Graph integrity violated: {0}")]
    GraphIntegrity(String),

    #[error("Routing policy returned already-attempted validators at step {step}: {overlap:?}")]
    PolicyContract { step: StepId, overlap: Vec<UserId> },

    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Subject not found: {0}")]
    SubjectNotFound(String),

    // ── Routing: fatal, but a business dead-end ──────────────────────
    #[error("No validator left to route step {step} to (attempted: {attempted:?})")]
    RoutingExhausted { step: StepId, attempted: Vec<UserId> },

    /// A fatal error that moved an instance to `Failed`
    #[error("Workflow instance {instance_id} failed: {cause}")]
    InstanceFailed {
        instance_id: WorkflowInstanceId,
        cause: Box<WorkflowError>,
    },

    // ── Definition ───────────────────────────────────────────────────
    #[error("Duplicate step ID: {0}")]
    DuplicateStepId(StepId),

    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    #[error("No start step defined")]
    NoStartStep,

    #[error("No terminal step defined")]
    NoTerminalStep,

    #[error("Disconnected graph: step {0} is unreachable from the start step")]
    DisconnectedGraph(StepId),

    #[error("Unknown switch selector: {0}")]
    UnknownSelector(String),

    #[error("Workflow validation error: {0}")]
    ValidationError(String),

    #[error("Workflow graph parse error: {0}")]
    ParseError(String),

    // ── Lookup ───────────────────────────────────────────────────────
    #[error("Workflow graph not found: {0}")]
    GraphNotFound(WorkflowGraphId),

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(WorkflowInstanceId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Workflow instance {0} cannot be reopened")]
    NotReopenable(WorkflowInstanceId),

    // ── Ambient ──────────────────────────────────────────────────────
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkflowError {
    /// The taxonomy bucket of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotEligible { .. } | Self::AlreadyResolved { .. } => ErrorClass::Validation,
            Self::GraphIntegrity(_)
            | Self::PolicyContract { .. }
            | Self::InvariantViolation(_)
            | Self::SubjectNotFound(_) => ErrorClass::Integrity,
            Self::RoutingExhausted { .. } => ErrorClass::Routing,
            Self::InstanceFailed { cause, .. } => cause.class(),
            Self::DuplicateStepId(_)
            | Self::StepNotFound(_)
            | Self::NoStartStep
            | Self::NoTerminalStep
            | Self::DisconnectedGraph(_)
            | Self::UnknownSelector(_)
            | Self::ValidationError(_)
            | Self::ParseError(_) => ErrorClass::Definition,
            Self::GraphNotFound(_)
            | Self::InstanceNotFound(_)
            | Self::TaskNotFound(_)
            | Self::NotReopenable(_) => ErrorClass::Lookup,
            Self::Storage(_) => ErrorClass::Storage,
            Self::Config(_) => ErrorClass::Config,
        }
    }

    /// Whether this error moves a running instance to `Failed`
    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Integrity | ErrorClass::Routing)
    }

    /// The error that failed the instance, if this is an `InstanceFailed`
    pub fn fatal_cause(&self) -> Option<&WorkflowError> {
        match self {
            Self::InstanceFailed { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// Error taxonomy used for audit and operator triage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Bad input for one call; safe to retry with corrected input
    Validation,
    /// Configuration or contract bug; never auto-retried
    Integrity,
    /// Every eligible validator declined; operators may reopen
    Routing,
    /// Graph rejected at registration
    Definition,
    /// Unknown identifier
    Lookup,
    /// Persistence collaborator failure
    Storage,
    /// Invalid engine configuration
    Config,
}

/// Result type alias for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;
