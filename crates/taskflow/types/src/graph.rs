//! Workflow graphs: the blueprint an instance walks
//!
//! A WorkflowGraph is a directed graph where:
//! - Steps are Action, Switch, Join or Terminal nodes
//! - Each step lists its successors in `next`
//!
//! Graphs are configuration, not runtime state. They are immutable once
//! registered. To modify, register a new version.

use crate::{WorkflowError, WorkflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a workflow graph
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowGraphId(pub String);

impl WorkflowGraphId {
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

impl std::fmt::Display for WorkflowGraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a step within a graph
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user who may act as a validator
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Workflow Graph ───────────────────────────────────────────────────

/// A workflow graph: the blueprint for approval workflows
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowGraph {
    /// Unique identifier
    #[serde(default = "WorkflowGraphId::generate")]
    pub id: WorkflowGraphId,
    /// Human-readable name
    pub name: String,
    /// Description of what this workflow accomplishes
    #[serde(default)]
    pub description: String,
    /// Version for tracking graph evolution
    #[serde(default = "default_version")]
    pub version: u32,
    /// The step executed when an instance starts
    pub start_step: StepId,
    /// The steps of the graph
    #[serde(default)]
    pub steps: Vec<Step>,
    /// When this graph was created
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowGraph {
    /// Create a new, empty workflow graph
    pub fn new(name: impl Into<String>, start_step: impl Into<String>) -> Self {
        Self {
            id: WorkflowGraphId::generate(),
            name: name.into(),
            description: String::new(),
            version: 1,
            start_step: StepId::new(start_step),
            steps: Vec::new(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Parse a graph from its YAML form
    pub fn from_yaml_str(yaml: &str) -> WorkflowResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = WorkflowGraphId::new(id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add a step to the graph
    pub fn add_step(&mut self, step: Step) -> WorkflowResult<()> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(WorkflowError::DuplicateStepId(step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Builder form of [`add_step`](Self::add_step)
    pub fn with_step(mut self, step: Step) -> WorkflowResult<Self> {
        self.add_step(step)?;
        Ok(self)
    }

    /// Get a step by ID
    pub fn get_step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Check whether a step exists
    pub fn contains_step(&self, id: &StepId) -> bool {
        self.get_step(id).is_some()
    }

    /// The designated start step
    pub fn start(&self) -> Option<&Step> {
        self.get_step(&self.start_step)
    }

    /// All terminal steps
    pub fn terminal_steps(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| matches!(s.kind, StepKind::Terminal))
            .collect()
    }

    /// Steps that list `id` as a successor
    pub fn predecessors(&self, id: &StepId) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.next.contains(id)).collect()
    }

    /// Names of every switch selector the graph refers to
    pub fn selector_names(&self) -> BTreeSet<&str> {
        self.steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::Switch { selector } => Some(selector.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Validate the graph for structural correctness
    pub fn validate(&self) -> WorkflowResult<()> {
        if self.steps.is_empty() {
            return Err(WorkflowError::ValidationError(
                "Workflow must have at least one step".into(),
            ));
        }

        let mut seen_ids = HashSet::new();
        for step in &self.steps {
            if !seen_ids.insert(&step.id) {
                return Err(WorkflowError::DuplicateStepId(step.id.clone()));
            }
        }

        let start = self.start().ok_or(WorkflowError::NoStartStep)?;
        if matches!(start.kind, StepKind::Join { .. }) {
            return Err(WorkflowError::ValidationError(format!(
                "Start step '{}' cannot be a join",
                start.id
            )));
        }

        if self.terminal_steps().is_empty() {
            return Err(WorkflowError::NoTerminalStep);
        }

        for step in &self.steps {
            for target in &step.next {
                if !self.contains_step(target) {
                    return Err(WorkflowError::StepNotFound(target.clone()));
                }
            }
            self.validate_step(step)?;
        }

        let reachable = self.reachable_from(&start.id);
        for step in &self.steps {
            if !reachable.contains(&step.id) {
                return Err(WorkflowError::DisconnectedGraph(step.id.clone()));
            }
        }

        Ok(())
    }

    fn validate_step(&self, step: &Step) -> WorkflowResult<()> {
        let invalid = |msg: String| Err(WorkflowError::ValidationError(msg));

        match &step.kind {
            StepKind::Action {
                validators,
                dispatch,
            } => {
                if validators.is_empty() {
                    return invalid(format!("Action step '{}' has no validators", step.id));
                }
                let Some(next) = step.single_next() else {
                    return invalid(format!(
                        "Action step '{}' must have exactly one successor",
                        step.id
                    ));
                };
                let next_is_join = self
                    .get_step(next)
                    .map(|s| matches!(s.kind, StepKind::Join { .. }))
                    .unwrap_or(false);
                match dispatch {
                    Dispatch::Pooled if next_is_join => invalid(format!(
                        "Pooled action '{}' cannot lead into join '{}'",
                        step.id, next
                    )),
                    Dispatch::PerValidator if !next_is_join => invalid(format!(
                        "Parallel action '{}' must lead into a join",
                        step.id
                    )),
                    _ => Ok(()),
                }
            }

            StepKind::Switch { selector } => {
                if selector.is_empty() {
                    return invalid(format!("Switch step '{}' has no selector", step.id));
                }
                if step.next.is_empty() {
                    return invalid(format!("Switch step '{}' has no candidates", step.id));
                }
                for target in &step.next {
                    if let Some(s) = self.get_step(target) {
                        if matches!(s.kind, StepKind::Join { .. }) {
                            return invalid(format!(
                                "Switch step '{}' cannot select join '{}'",
                                step.id, target
                            ));
                        }
                    }
                }
                Ok(())
            }

            StepKind::Join { policy } => {
                if step.single_next().is_none() {
                    return invalid(format!(
                        "Join step '{}' must have exactly one successor",
                        step.id
                    ));
                }
                let predecessors = self.predecessors(&step.id);
                if predecessors.is_empty() {
                    return invalid(format!("Join step '{}' has no parallel action", step.id));
                }
                for pred in predecessors {
                    if !pred.is_parallel_action() {
                        return invalid(format!(
                            "Join step '{}' is preceded by '{}', which is not a parallel action",
                            step.id, pred.id
                        ));
                    }
                    let pool = pred.validators().map(|v| v.len()).unwrap_or(0);
                    if let CompletionPolicy::Quorum(k) = policy {
                        if *k == 0 || *k as usize > pool {
                            return invalid(format!(
                                "Join step '{}' quorum {} is outside 1..={} of '{}'",
                                step.id, k, pool, pred.id
                            ));
                        }
                    }
                }
                Ok(())
            }

            StepKind::Terminal => {
                if !step.next.is_empty() {
                    return invalid(format!("Terminal step '{}' has successors", step.id));
                }
                Ok(())
            }
        }
    }

    /// Find all steps reachable from a given step
    fn reachable_from(&self, start: &StepId) -> HashSet<StepId> {
        let mut visited = HashSet::new();
        let mut queue = vec![start.clone()];

        while let Some(current) = queue.pop() {
            if visited.insert(current.clone()) {
                if let Some(step) = self.get_step(&current) {
                    for target in &step.next {
                        if !visited.contains(target) {
                            queue.push(target.clone());
                        }
                    }
                }
            }
        }

        visited
    }

    /// Total number of steps
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

// ── Step ─────────────────────────────────────────────────────────────

/// A node in the workflow graph
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier within this graph
    pub id: StepId,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// What the step does when the engine enters it
    #[serde(flatten)]
    pub kind: StepKind,
    /// Successor steps; for a switch these are the selectable candidates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<StepId>,
    /// Lifecycle state the subject is moved to when the step is entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_state: Option<String>,
    /// Metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Step {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: StepId::new(id),
            name: name.into(),
            kind,
            next: Vec::new(),
            lifecycle_state: None,
            metadata: HashMap::new(),
        }
    }

    /// An action step whose validators share a single task
    pub fn action<I, U>(id: impl Into<String>, name: impl Into<String>, validators: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<String>,
    {
        Self::new(
            id,
            name,
            StepKind::Action {
                validators: validators.into_iter().map(UserId::new).collect(),
                dispatch: Dispatch::Pooled,
            },
        )
    }

    /// An action step that gives each validator a task of their own
    pub fn parallel_action<I, U>(
        id: impl Into<String>,
        name: impl Into<String>,
        validators: I,
    ) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<String>,
    {
        Self::new(
            id,
            name,
            StepKind::Action {
                validators: validators.into_iter().map(UserId::new).collect(),
                dispatch: Dispatch::PerValidator,
            },
        )
    }

    pub fn switch(
        id: impl Into<String>,
        name: impl Into<String>,
        selector: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            name,
            StepKind::Switch {
                selector: selector.into(),
            },
        )
    }

    pub fn join(id: impl Into<String>, policy: CompletionPolicy) -> Self {
        Self::new(id, "Join", StepKind::Join { policy })
    }

    pub fn terminal(id: impl Into<String>) -> Self {
        Self::new(id, "End", StepKind::Terminal)
    }

    /// Append a successor
    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next.push(StepId::new(next));
        self
    }

    pub fn with_lifecycle_state(mut self, state: impl Into<String>) -> Self {
        self.lifecycle_state = Some(state.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The configured validator pool, for action steps
    pub fn validators(&self) -> Option<&BTreeSet<UserId>> {
        match &self.kind {
            StepKind::Action { validators, .. } => Some(validators),
            _ => None,
        }
    }

    /// Whether this is an action step with per-validator dispatch
    pub fn is_parallel_action(&self) -> bool {
        matches!(
            self.kind,
            StepKind::Action {
                dispatch: Dispatch::PerValidator,
                ..
            }
        )
    }

    /// The successor, when there is exactly one
    pub fn single_next(&self) -> Option<&StepId> {
        match self.next.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

// ── Step Kind ────────────────────────────────────────────────────────

/// The closed set of step kinds
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Creates tasks for validators and waits for their resolution
    Action {
        /// Configured validator pool
        validators: BTreeSet<UserId>,
        /// How routed validators are grouped into tasks
        #[serde(default)]
        dispatch: Dispatch,
    },
    /// Pure branch selection; never creates tasks
    Switch {
        /// Name of the selector registered with the engine
        selector: String,
    },
    /// Waits on the sibling tasks of the preceding parallel action
    Join {
        /// How many siblings must accept
        policy: CompletionPolicy,
    },
    /// Ends the workflow
    Terminal,
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Action { .. } => "action",
            Self::Switch { .. } => "switch",
            Self::Join { .. } => "join",
            Self::Terminal => "terminal",
        }
    }
}

/// How an action step groups its routed validators into tasks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// One task shared by every routed validator; any of them resolves it
    #[default]
    Pooled,
    /// One task per routed validator, evaluated by the successor join
    PerValidator,
}

/// When a join considers its sibling tasks done
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Every sibling must accept
    All,
    /// One acceptance is enough
    Any,
    /// At least k siblings must accept
    Quorum(u32),
}

impl CompletionPolicy {
    /// Number of acceptances needed out of `slots` siblings
    pub fn required(&self, slots: usize) -> usize {
        match self {
            Self::All => slots,
            Self::Any => 1,
            Self::Quorum(k) => *k as usize,
        }
    }

    pub fn is_satisfied(&self, accepted: usize, slots: usize) -> bool {
        accepted >= self.required(slots).max(1)
    }
}
