//! Switch selectors: pure branch selection
//!
//! A switch step names a selector. Selectors are registered with the
//! engine by name and must be deterministic: the same instance and
//! subject state always select the same step. They get read-only views
//! and no engine handle, so they cannot create tasks.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use taskflow_types::{
    Step, StepId, StepKind, WorkflowError, WorkflowGraph, WorkflowInstance, WorkflowResult,
};

/// Selects the successor of a switch step
pub trait SwitchSelector<S>: Send + Sync {
    fn select(&self, instance: &WorkflowInstance, subject: &S) -> StepId;
}

impl<S, F> SwitchSelector<S> for F
where
    F: Fn(&WorkflowInstance, &S) -> StepId + Send + Sync,
{
    fn select(&self, instance: &WorkflowInstance, subject: &S) -> StepId {
        self(instance, subject)
    }
}

/// Selectors by name
pub struct SelectorRegistry<S> {
    selectors: HashMap<String, Arc<dyn SwitchSelector<S>>>,
}

impl<S> SelectorRegistry<S> {
    pub fn new() -> Self {
        Self {
            selectors: HashMap::new(),
        }
    }

    /// Register a selector; a later registration under the same name wins
    pub fn register(&mut self, name: impl Into<String>, selector: Arc<dyn SwitchSelector<S>>) {
        let name = name.into();
        tracing::debug!(selector = %name, "Switch selector registered");
        self.selectors.insert(name, selector);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.selectors.contains_key(name)
    }

    pub fn names(&self) -> BTreeSet<&str> {
        self.selectors.keys().map(String::as_str).collect()
    }

    /// Fail with `UnknownSelector` if the graph refers to an unregistered name
    pub fn check_graph(&self, graph: &WorkflowGraph) -> WorkflowResult<()> {
        match graph.selector_names().into_iter().find(|n| !self.contains(n)) {
            Some(missing) => Err(WorkflowError::UnknownSelector(missing.to_string())),
            None => Ok(()),
        }
    }

    /// Run the selector of `step` and check the answer against the graph.
    ///
    /// The selected step must exist and be one of the switch's declared
    /// successors; anything else is a graph integrity error.
    pub fn select(
        &self,
        graph: &WorkflowGraph,
        step: &Step,
        instance: &WorkflowInstance,
        subject: &S,
    ) -> WorkflowResult<StepId> {
        let StepKind::Switch { selector } = &step.kind else {
            return Err(WorkflowError::InvariantViolation(format!(
                "step '{}' is not a switch",
                step.id
            )));
        };
        let chosen = self
            .selectors
            .get(selector)
            .ok_or_else(|| WorkflowError::UnknownSelector(selector.clone()))?
            .select(instance, subject);

        if !graph.contains_step(&chosen) {
            return Err(WorkflowError::GraphIntegrity(format!(
                "switch '{}' selected unknown step '{}'",
                step.id, chosen
            )));
        }
        if !step.next.contains(&chosen) {
            return Err(WorkflowError::GraphIntegrity(format!(
                "switch '{}' selected '{}', which is not one of its successors",
                step.id, chosen
            )));
        }
        Ok(chosen)
    }
}

impl<S> Clone for SelectorRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            selectors: self.selectors.clone(),
        }
    }
}

impl<S> Default for SelectorRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
