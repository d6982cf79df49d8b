//! Routing policies: who gets the next task of an action step
//!
//! A policy is consulted when an action step activates (with an empty
//! attempted set) and after every rejection. The engine only trusts one
//! thing about the answer: it must not contain an attempted validator.

use std::collections::BTreeSet;
use taskflow_types::{Step, StepId, UserId, WorkflowError, WorkflowResult};

/// Computes the validators of the next task(s) for an action step
pub trait RoutingPolicy<S>: Send + Sync {
    /// Validators to route to, given who already rejected in this activation
    fn next_validators(
        &self,
        step: &Step,
        subject: &S,
        attempted: &BTreeSet<UserId>,
    ) -> BTreeSet<UserId>;

    /// Idempotent compensating action run on every rejection, before
    /// re-dispatch
    fn compensate(&self, _step: &Step, _subject: &S, _rejected_by: &UserId) {}
}

/// Check the routing contract: the routed set is disjoint from `attempted`
pub fn check_disjoint(
    step: &StepId,
    routed: &BTreeSet<UserId>,
    attempted: &BTreeSet<UserId>,
) -> WorkflowResult<()> {
    let overlap: Vec<UserId> = routed.intersection(attempted).cloned().collect();
    if overlap.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::PolicyContract {
            step: step.clone(),
            overlap,
        })
    }
}

// ── Built-in policies ────────────────────────────────────────────────

/// Routes to the configured pool minus everyone who already rejected
#[derive(Clone, Debug, Default)]
pub struct PoolRouting;

impl<S> RoutingPolicy<S> for PoolRouting {
    fn next_validators(
        &self,
        step: &Step,
        _subject: &S,
        attempted: &BTreeSet<UserId>,
    ) -> BTreeSet<UserId> {
        step.validators()
            .map(|pool| pool.difference(attempted).cloned().collect())
            .unwrap_or_default()
    }
}

/// Routes to one validator at a time, in pool order (an escalation chain)
#[derive(Clone, Debug, Default)]
pub struct SequentialRouting;

impl<S> RoutingPolicy<S> for SequentialRouting {
    fn next_validators(
        &self,
        step: &Step,
        _subject: &S,
        attempted: &BTreeSet<UserId>,
    ) -> BTreeSet<UserId> {
        step.validators()
            .and_then(|pool| pool.iter().find(|v| !attempted.contains(*v)))
            .cloned()
            .into_iter()
            .collect()
    }
}
