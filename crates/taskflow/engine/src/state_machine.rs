//! State machine: step dispatch and instance advancement
//!
//! The state machine is the heart of the workflow engine. It runs only
//! inside the engine's guarded instance update, with the instance being
//! advanced passed in by `&mut`. Effects that must wait until that
//! update commits (audit records, subject lifecycle hooks) are collected
//! in [`Effects`] instead of being applied directly.

use crate::audit::AuditRecord;
use crate::routing::{check_disjoint, RoutingPolicy};
use crate::store::WorkflowStore;
use crate::switch::SelectorRegistry;
use std::collections::BTreeSet;
use taskflow_types::*;

/// Effects of one advancement, applied by the engine after commit
#[derive(Debug, Default)]
pub struct Effects {
    /// Audit records, in the order they happened
    pub audit: Vec<AuditRecord>,
    /// Lifecycle states to hand to the subject, in order
    pub lifecycle: Vec<String>,
}

/// Where an advancement stopped
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Advance {
    /// Waiting on the tasks of an action step
    Suspended(StepId),
    /// Reached a terminal step
    Completed(StepId),
}

/// What a task resolution did to its instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// The step completed and the instance now waits at `to`
    Advanced { to: StepId },
    /// The step completed and the instance reached a terminal step
    Completed,
    /// A parallel sibling accepted but the join is not yet satisfied
    AwaitingSiblings { accepted: usize, required: usize },
    /// The task was rejected and replacement tasks were dispatched
    Rerouted { replacements: Vec<TaskId> },
    /// The task's activation is no longer live; nothing moved
    NoEffect,
}

impl From<Advance> for ResolutionOutcome {
    fn from(advance: Advance) -> Self {
        match advance {
            Advance::Suspended(to) => Self::Advanced { to },
            Advance::Completed(_) => Self::Completed,
        }
    }
}

/// Dispatches steps of one graph for one subject
pub struct StateMachine<'a, S> {
    pub graph: &'a WorkflowGraph,
    pub subject: &'a S,
    pub routing: &'a dyn RoutingPolicy<S>,
    pub selectors: &'a SelectorRegistry<S>,
    pub store: &'a dyn WorkflowStore,
    pub max_switch_hops: usize,
}

impl<'a, S> StateMachine<'a, S> {
    /// Enter `step_id` and keep going until the instance suspends or
    /// completes. Switches are evaluated in the same turn and are never
    /// recorded as the current step.
    pub fn enter(
        &self,
        instance: &mut WorkflowInstance,
        step_id: &StepId,
        effects: &mut Effects,
    ) -> WorkflowResult<Advance> {
        let mut current = step_id.clone();
        let mut hops = 0usize;

        loop {
            let step = self.step(&current)?;
            effects.audit.push(AuditRecord::step_entered(&step.id));

            match &step.kind {
                StepKind::Action { .. } => {
                    self.activate(instance, step, effects)?;
                    return Ok(Advance::Suspended(current));
                }

                StepKind::Switch { .. } => {
                    hops += 1;
                    if hops > self.max_switch_hops {
                        return Err(WorkflowError::GraphIntegrity(format!(
                            "more than {} consecutive switch hops (last at '{}')",
                            self.max_switch_hops, step.id
                        )));
                    }

                    let tasks_before = self.store.tasks_for_instance(&instance.id)?.len();
                    let selected = self.selectors.select(self.graph, step, instance, self.subject)?;
                    let tasks_after = self.store.tasks_for_instance(&instance.id)?.len();
                    if tasks_after != tasks_before {
                        return Err(WorkflowError::InvariantViolation(format!(
                            "switch '{}' created tasks during selection",
                            step.id
                        )));
                    }

                    tracing::debug!(
                        instance_id = %instance.id,
                        switch = %step.id,
                        selected = %selected,
                        "Switch selected"
                    );
                    effects
                        .audit
                        .push(AuditRecord::switch_selected(&step.id, &selected));
                    current = selected;
                }

                StepKind::Join { .. } => {
                    return Err(WorkflowError::GraphIntegrity(format!(
                        "join '{}' entered without a parallel action",
                        step.id
                    )));
                }

                StepKind::Terminal => {
                    if let Some(state) = &step.lifecycle_state {
                        effects.lifecycle.push(state.clone());
                    }
                    instance.complete(current.clone());
                    effects.audit.push(AuditRecord::completed());
                    return Ok(Advance::Completed(current));
                }
            }
        }
    }

    /// Activate an action step: open a new activation and dispatch its
    /// first task(s)
    fn activate(
        &self,
        instance: &mut WorkflowInstance,
        step: &Step,
        effects: &mut Effects,
    ) -> WorkflowResult<()> {
        let activation_id = instance.activate_step(step.id.clone(), 1).id.clone();
        if let Some(state) = &step.lifecycle_state {
            effects.lifecycle.push(state.clone());
        }

        let attempted = BTreeSet::new();
        let routed = self.routing.next_validators(step, self.subject, &attempted);
        check_disjoint(&step.id, &routed, &attempted)?;
        if routed.is_empty() {
            return Err(WorkflowError::RoutingExhausted {
                step: step.id.clone(),
                attempted: Vec::new(),
            });
        }

        if step.is_parallel_action() {
            let (join, policy) = self.join_of(step)?;
            let slots = routed.len();
            if policy.required(slots) > slots {
                return Err(WorkflowError::GraphIntegrity(format!(
                    "join '{}' needs {} acceptances but '{}' routed only {}",
                    join.id,
                    policy.required(slots),
                    step.id,
                    slots
                )));
            }
            if let Some(activation) = instance.activation.as_mut() {
                activation.slots = slots;
            }
            for validator in routed {
                self.dispatch(
                    instance,
                    step,
                    &activation_id,
                    BTreeSet::from([validator]),
                    &attempted,
                    None,
                    effects,
                )?;
            }
        } else {
            self.dispatch(
                instance,
                step,
                &activation_id,
                routed,
                &attempted,
                None,
                effects,
            )?;
        }
        Ok(())
    }

    /// Create and store one task of the current activation
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch(
        &self,
        instance: &WorkflowInstance,
        step: &Step,
        activation_id: &ActivationId,
        eligible: BTreeSet<UserId>,
        attempted: &BTreeSet<UserId>,
        supersedes: Option<TaskId>,
        effects: &mut Effects,
    ) -> WorkflowResult<TaskId> {
        let mut task = Task::new(
            instance.id.clone(),
            step.id.clone(),
            activation_id.clone(),
            instance.subject_id.clone(),
            eligible,
        )
        .with_attempted(attempted.clone());
        if let Some(rejected) = supersedes {
            task = task.superseding(rejected);
        }

        let task_id = task.id.clone();
        tracing::debug!(
            instance_id = %instance.id,
            task_id = %task_id,
            step = %step.id,
            validators = task.eligible_validators.len(),
            "Task dispatched"
        );
        effects.audit.push(AuditRecord::task_created(
            &task_id,
            &step.id,
            task.eligible_validators.iter().cloned().collect(),
        ));
        self.store.insert_task(task)?;
        Ok(task_id)
    }

    /// Handle an accepted task of the instance's current activation
    pub fn on_accept(
        &self,
        instance: &mut WorkflowInstance,
        task: &Task,
        effects: &mut Effects,
    ) -> WorkflowResult<ResolutionOutcome> {
        let step = self.step(&task.step_id)?;

        if step.is_parallel_action() {
            let (join, policy) = self.join_of(step)?;
            let (accepted, slots) = self.accepted_siblings(instance, &task.activation_id)?;
            let required = policy.required(slots).max(1);

            if accepted < required {
                tracing::debug!(
                    instance_id = %instance.id,
                    join = %join.id,
                    accepted,
                    required,
                    "Join waiting on siblings"
                );
                return Ok(ResolutionOutcome::AwaitingSiblings { accepted, required });
            }
            self.complete_join(instance, step, join, &task.activation_id, effects)
        } else {
            cancel_pending(self.store, &task.activation_id, effects)?;
            instance.complete_step(&step.id);
            effects.audit.push(AuditRecord::step_completed(&step.id));
            let next = self.successor(step)?;
            Ok(self.enter(instance, next, effects)?.into())
        }
    }

    /// Handle a rejected task of the instance's current activation:
    /// re-dispatch to validators who have not rejected yet
    pub fn on_reject(
        &self,
        instance: &mut WorkflowInstance,
        task: &Task,
        effects: &mut Effects,
    ) -> WorkflowResult<ResolutionOutcome> {
        let step = self.step(&task.step_id)?;

        // Siblings accepted before this rejection reached the instance may
        // already satisfy the join; the rejection then lands on a closed step.
        if step.is_parallel_action() {
            let (join, policy) = self.join_of(step)?;
            let (accepted, slots) = self.accepted_siblings(instance, &task.activation_id)?;
            if policy.is_satisfied(accepted, slots) {
                tracing::debug!(
                    instance_id = %instance.id,
                    join = %join.id,
                    task_id = %task.id,
                    "Rejection arrived after the join was satisfied"
                );
                return self.complete_join(instance, step, join, &task.activation_id, effects);
            }
        }

        let rejected_by = task.resolved_by.as_ref().ok_or_else(|| {
            WorkflowError::InvariantViolation(format!("rejected task {} has no resolver", task.id))
        })?;

        let attempted = {
            let activation = instance.activation.as_mut().ok_or_else(|| {
                WorkflowError::InvariantViolation(format!(
                    "instance {} has no live activation",
                    instance.id
                ))
            })?;
            activation.attempted.extend(task.attempted_validators.iter().cloned());
            activation.record_attempt(rejected_by).clone()
        };

        self.routing.compensate(step, self.subject, rejected_by);
        let mut routed = self.routing.next_validators(step, self.subject, &attempted);
        check_disjoint(&step.id, &routed, &attempted)?;

        if step.is_parallel_action() {
            for sibling in self.store.tasks_for_activation(&task.activation_id)? {
                if matches!(sibling.status, TaskStatus::Pending | TaskStatus::Accepted) {
                    for holder in &sibling.eligible_validators {
                        routed.remove(holder);
                    }
                }
            }
        }

        if routed.is_empty() {
            return Err(WorkflowError::RoutingExhausted {
                step: step.id.clone(),
                attempted: attempted.into_iter().collect(),
            });
        }

        let eligible: BTreeSet<UserId> = if step.is_parallel_action() {
            // one replacement fills the rejected slot
            routed.into_iter().take(1).collect()
        } else {
            routed
        };
        let replacement = self.dispatch(
            instance,
            step,
            &task.activation_id,
            eligible,
            &attempted,
            Some(task.id.clone()),
            effects,
        )?;
        Ok(ResolutionOutcome::Rerouted {
            replacements: vec![replacement],
        })
    }

    /// Accepted tasks of an activation, with its slot count
    fn accepted_siblings(
        &self,
        instance: &WorkflowInstance,
        activation_id: &ActivationId,
    ) -> WorkflowResult<(usize, usize)> {
        let slots = instance.activation.as_ref().map(|a| a.slots).unwrap_or(1);
        let accepted = self
            .store
            .tasks_for_activation(activation_id)?
            .iter()
            .filter(|t| t.status == TaskStatus::Accepted)
            .count();
        Ok((accepted, slots))
    }

    /// Close a parallel action whose join is satisfied and move past the join
    fn complete_join(
        &self,
        instance: &mut WorkflowInstance,
        step: &Step,
        join: &Step,
        activation_id: &ActivationId,
        effects: &mut Effects,
    ) -> WorkflowResult<ResolutionOutcome> {
        cancel_pending(self.store, activation_id, effects)?;
        instance.complete_step(&step.id);
        effects.audit.push(AuditRecord::step_completed(&step.id));
        effects.audit.push(AuditRecord::step_completed(&join.id));
        let next = self.successor(join)?;
        Ok(self.enter(instance, next, effects)?.into())
    }

    // ── Graph helpers ────────────────────────────────────────────────

    fn step(&self, id: &StepId) -> WorkflowResult<&'a Step> {
        self.graph.get_step(id).ok_or_else(|| {
            WorkflowError::GraphIntegrity(format!("step '{}' is not in graph '{}'", id, self.graph.id))
        })
    }

    fn successor(&self, step: &Step) -> WorkflowResult<&'a StepId> {
        let next = step.single_next().ok_or_else(|| {
            WorkflowError::GraphIntegrity(format!("step '{}' has no single successor", step.id))
        })?;
        Ok(&self.step(next)?.id)
    }

    /// The join a parallel action leads into, with its policy
    fn join_of(&self, step: &Step) -> WorkflowResult<(&'a Step, CompletionPolicy)> {
        let next = self.successor(step)?;
        let join = self.step(next)?;
        match &join.kind {
            StepKind::Join { policy } => Ok((join, *policy)),
            _ => Err(WorkflowError::GraphIntegrity(format!(
                "parallel action '{}' does not lead into a join",
                step.id
            ))),
        }
    }
}

/// Cancel every pending task of an activation
pub fn cancel_pending(
    store: &dyn WorkflowStore,
    activation_id: &ActivationId,
    effects: &mut Effects,
) -> WorkflowResult<()> {
    for task in store.tasks_for_activation(activation_id)? {
        if task.is_pending() {
            cancel_task(store, &task.id, effects)?;
        }
    }
    Ok(())
}

fn cancel_task(store: &dyn WorkflowStore, task_id: &TaskId, effects: &mut Effects) -> WorkflowResult<()> {
    let mut cancelled = false;
    store.update_task(task_id, &mut |t| {
        cancelled = t.cancel();
        Ok(())
    })?;
    if cancelled {
        effects.audit.push(AuditRecord::task_cancelled(task_id));
    }
    Ok(())
}

/// Move an instance to `Failed`, cancelling all of its pending tasks
pub fn fail_instance(
    store: &dyn WorkflowStore,
    instance: &mut WorkflowInstance,
    error: &WorkflowError,
    effects: &mut Effects,
) -> WorkflowResult<()> {
    for task in store.tasks_for_instance(&instance.id)? {
        if task.is_pending() {
            cancel_task(store, &task.id, effects)?;
        }
    }
    instance.fail(error);
    effects
        .audit
        .push(AuditRecord::failed(error.class(), error.to_string()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{PoolRouting, SequentialRouting};
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    struct Doc {
        route: &'static str,
    }

    fn make_graph() -> WorkflowGraph {
        WorkflowGraph::new("Review", "route")
            .with_step(Step::switch("route", "Route", "pick").then("review").then("board"))
            .unwrap()
            .with_step(
                Step::action("review", "Review", ["v1", "v2"])
                    .with_lifecycle_state("in_review")
                    .then("done"),
            )
            .unwrap()
            .with_step(Step::parallel_action("board", "Board", ["b1", "b2", "b3"]).then("vote"))
            .unwrap()
            .with_step(Step::join("vote", CompletionPolicy::Quorum(2)).then("done"))
            .unwrap()
            .with_step(Step::terminal("done").with_lifecycle_state("approved"))
            .unwrap()
    }

    fn make_selectors() -> SelectorRegistry<Doc> {
        let mut selectors = SelectorRegistry::new();
        selectors.register(
            "pick",
            Arc::new(|_: &WorkflowInstance, doc: &Doc| StepId::new(doc.route)),
        );
        selectors
    }

    fn make_instance(store: &InMemoryStore, graph: &WorkflowGraph) -> WorkflowInstance {
        let inst = WorkflowInstance::new(graph.id.clone(), SubjectId::new("doc-1"));
        store.insert_instance(inst.clone()).unwrap();
        inst
    }

    fn machine<'a>(
        graph: &'a WorkflowGraph,
        doc: &'a Doc,
        routing: &'a dyn RoutingPolicy<Doc>,
        selectors: &'a SelectorRegistry<Doc>,
        store: &'a InMemoryStore,
    ) -> StateMachine<'a, Doc> {
        StateMachine {
            graph,
            subject: doc,
            routing,
            selectors,
            store,
            max_switch_hops: 8,
        }
    }

    fn resolve(store: &InMemoryStore, task: &Task, user: &str, decision: Decision) -> Task {
        store
            .update_task(&task.id, &mut |t| t.resolve(&UserId::new(user), decision, None))
            .unwrap()
    }

    fn only_validator(task: &Task) -> String {
        task.eligible_validators.first().unwrap().0.clone()
    }

    #[test]
    fn test_enter_through_switch_to_pooled_action() {
        let graph = make_graph();
        let store = InMemoryStore::new();
        let selectors = make_selectors();
        let doc = Doc { route: "review" };
        let sm = machine(&graph, &doc, &PoolRouting, &selectors, &store);
        let mut inst = make_instance(&store, &graph);
        let mut effects = Effects::default();

        let advance = sm.enter(&mut inst, &StepId::new("route"), &mut effects).unwrap();
        assert_eq!(advance, Advance::Suspended(StepId::new("review")));
        assert_eq!(inst.current_step_id, Some(StepId::new("review")));
        assert_eq!(effects.lifecycle, vec!["in_review".to_string()]);

        let tasks = store.tasks_for_instance(&inst.id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].eligible_validators.len(), 2);
    }

    #[test]
    fn test_parallel_action_dispatches_per_validator() {
        let graph = make_graph();
        let store = InMemoryStore::new();
        let selectors = make_selectors();
        let doc = Doc { route: "board" };
        let sm = machine(&graph, &doc, &PoolRouting, &selectors, &store);
        let mut inst = make_instance(&store, &graph);
        let mut effects = Effects::default();

        sm.enter(&mut inst, &StepId::new("route"), &mut effects).unwrap();
        let tasks = store.tasks_for_instance(&inst.id).unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.eligible_validators.len() == 1));
        assert_eq!(inst.activation.as_ref().unwrap().slots, 3);
    }

    #[test]
    fn test_quorum_join() {
        let graph = make_graph();
        let store = InMemoryStore::new();
        let selectors = make_selectors();
        let doc = Doc { route: "board" };
        let sm = machine(&graph, &doc, &PoolRouting, &selectors, &store);
        let mut inst = make_instance(&store, &graph);
        let mut effects = Effects::default();
        sm.enter(&mut inst, &StepId::new("route"), &mut effects).unwrap();
        let tasks = store.tasks_for_instance(&inst.id).unwrap();

        let first = resolve(&store, &tasks[0], &only_validator(&tasks[0]), Decision::Accept);
        let outcome = sm.on_accept(&mut inst, &first, &mut effects).unwrap();
        assert_eq!(
            outcome,
            ResolutionOutcome::AwaitingSiblings {
                accepted: 1,
                required: 2
            }
        );

        let second = resolve(&store, &tasks[1], &only_validator(&tasks[1]), Decision::Accept);
        let outcome = sm.on_accept(&mut inst, &second, &mut effects).unwrap();
        assert_eq!(outcome, ResolutionOutcome::Completed);
        assert_eq!(inst.status, InstanceStatus::Completed);

        let third = store.load_task(&tasks[2].id).unwrap();
        assert_eq!(third.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_reject_reroutes_then_exhausts() {
        let graph = make_graph();
        let store = InMemoryStore::new();
        let selectors = make_selectors();
        let doc = Doc { route: "review" };
        let sm = machine(&graph, &doc, &SequentialRouting, &selectors, &store);
        let mut inst = make_instance(&store, &graph);
        let mut effects = Effects::default();
        sm.enter(&mut inst, &StepId::new("route"), &mut effects).unwrap();

        let first = store.tasks_for_instance(&inst.id).unwrap().remove(0);
        assert_eq!(first.eligible_validators, BTreeSet::from([UserId::new("v1")]));
        let first = resolve(&store, &first, "v1", Decision::Reject);

        let outcome = sm.on_reject(&mut inst, &first, &mut effects).unwrap();
        let ResolutionOutcome::Rerouted { replacements } = outcome else {
            panic!("expected a replacement task");
        };
        let second = store.load_task(&replacements[0]).unwrap();
        assert_eq!(second.eligible_validators, BTreeSet::from([UserId::new("v2")]));
        assert_eq!(second.attempted_validators, BTreeSet::from([UserId::new("v1")]));
        assert_eq!(second.supersedes, Some(first.id.clone()));

        let second = resolve(&store, &second, "v2", Decision::Reject);
        let result = sm.on_reject(&mut inst, &second, &mut effects);
        assert!(matches!(result, Err(WorkflowError::RoutingExhausted { .. })));
    }

    #[test]
    fn test_reject_after_satisfied_join_advances() {
        let graph = WorkflowGraph::new("Any board", "board")
            .with_step(Step::parallel_action("board", "Board", ["b1", "b2"]).then("vote"))
            .unwrap()
            .with_step(Step::join("vote", CompletionPolicy::Any).then("done"))
            .unwrap()
            .with_step(Step::terminal("done"))
            .unwrap();
        let store = InMemoryStore::new();
        let selectors = SelectorRegistry::new();
        let doc = Doc { route: "" };
        let sm = machine(&graph, &doc, &PoolRouting, &selectors, &store);
        let mut inst = make_instance(&store, &graph);
        let mut effects = Effects::default();
        sm.enter(&mut inst, &StepId::new("board"), &mut effects).unwrap();

        let tasks = store.tasks_for_instance(&inst.id).unwrap();
        let b1 = tasks.iter().find(|t| t.is_eligible(&UserId::new("b1"))).unwrap();
        let b2 = tasks.iter().find(|t| t.is_eligible(&UserId::new("b2"))).unwrap();

        // both transitions commit before either reaches the instance
        resolve(&store, b2, "b2", Decision::Accept);
        let rejected = resolve(&store, b1, "b1", Decision::Reject);

        let outcome = sm.on_reject(&mut inst, &rejected, &mut effects).unwrap();
        assert_eq!(outcome, ResolutionOutcome::Completed);
        assert_eq!(inst.status, InstanceStatus::Completed);
        assert_eq!(inst.completed_steps, vec![StepId::new("board")]);
        assert_eq!(store.tasks_for_instance(&inst.id).unwrap().len(), 2);
    }

    #[test]
    fn test_switch_hop_limit() {
        let graph = WorkflowGraph::new("Loop", "a")
            .with_step(Step::switch("a", "A", "to_b").then("b").then("done"))
            .unwrap()
            .with_step(Step::switch("b", "B", "to_a").then("a"))
            .unwrap()
            .with_step(Step::terminal("done"))
            .unwrap();
        let mut selectors = SelectorRegistry::new();
        selectors.register("to_b", Arc::new(|_: &WorkflowInstance, _: &Doc| StepId::new("b")));
        selectors.register("to_a", Arc::new(|_: &WorkflowInstance, _: &Doc| StepId::new("a")));
        let store = InMemoryStore::new();
        let doc = Doc { route: "" };
        let sm = machine(&graph, &doc, &PoolRouting, &selectors, &store);
        let mut inst = make_instance(&store, &graph);

        let result = sm.enter(&mut inst, &StepId::new("a"), &mut Effects::default());
        assert!(matches!(result, Err(WorkflowError::GraphIntegrity(msg)) if msg.contains("switch hops")));
        assert!(inst.current_step_id.is_none());
    }

    #[test]
    fn test_fail_instance_cancels_pending() {
        let graph = make_graph();
        let store = InMemoryStore::new();
        let selectors = make_selectors();
        let doc = Doc { route: "board" };
        let sm = machine(&graph, &doc, &PoolRouting, &selectors, &store);
        let mut inst = make_instance(&store, &graph);
        let mut effects = Effects::default();
        sm.enter(&mut inst, &StepId::new("route"), &mut effects).unwrap();

        let error = WorkflowError::GraphIntegrity("test".into());
        fail_instance(&store, &mut inst, &error, &mut effects).unwrap();

        assert_eq!(inst.status, InstanceStatus::Failed);
        assert_eq!(inst.failure_class(), Some(ErrorClass::Integrity));
        assert!(store
            .tasks_for_instance(&inst.id)
            .unwrap()
            .iter()
            .all(|t| t.status == TaskStatus::Cancelled));
    }
}
