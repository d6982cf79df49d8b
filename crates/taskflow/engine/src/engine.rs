//! Workflow engine: the public entry points of the runtime
//!
//! The engine creates instances, resolves tasks and advances instances
//! through their graphs. Every method takes `&self`; share the engine
//! across threads with an `Arc`.
//!
//! A resolution runs in two guarded steps. First the task leaves
//! `Pending` under its own guard, so concurrent resolutions of one task
//! have exactly one winner. Then the instance is advanced under the
//! instance guard, so concurrent siblings of a join advance it at most
//! once. The task guard is always released before the instance guard is
//! taken.

use crate::audit::{AuditRecord, AuditTrail};
use crate::config::EngineConfig;
use crate::graph_registry::GraphRegistry;
use crate::routing::{PoolRouting, RoutingPolicy};
use crate::state_machine::{fail_instance, Effects, ResolutionOutcome, StateMachine};
use crate::store::{InMemoryStore, WorkflowStore};
use crate::subject::{SubjectRepository, WorkflowSubject};
use crate::switch::{SelectorRegistry, SwitchSelector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};
use taskflow_types::*;

// ── Resolution ───────────────────────────────────────────────────────

/// Who is resolving a task, passed explicitly with every resolution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionContext {
    /// The acting user
    pub user: UserId,
    /// Comment recorded on the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ResolutionContext {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: UserId::new(user),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Result of a successful resolution
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub task_id: TaskId,
    pub instance_id: WorkflowInstanceId,
    /// The subject to navigate to after the resolution
    pub subject_id: SubjectId,
    pub decision: Decision,
    pub outcome: ResolutionOutcome,
}

// ── Engine ───────────────────────────────────────────────────────────

/// The approval workflow engine
pub struct WorkflowEngine<S> {
    config: EngineConfig,
    graphs: RwLock<GraphRegistry>,
    selectors: RwLock<Arc<SelectorRegistry<S>>>,
    subjects: Arc<dyn SubjectRepository<S>>,
    routing: Arc<dyn RoutingPolicy<S>>,
    store: Arc<dyn WorkflowStore>,
    audit: AuditTrail,
    archive: Mutex<Vec<CompletedWorkflow>>,
}

impl<S: WorkflowSubject + 'static> WorkflowEngine<S> {
    /// Create an engine with an in-memory store and pool routing
    pub fn new(subjects: Arc<dyn SubjectRepository<S>>) -> Self {
        Self {
            config: EngineConfig::default(),
            graphs: RwLock::new(GraphRegistry::new()),
            selectors: RwLock::new(Arc::new(SelectorRegistry::new())),
            subjects,
            routing: Arc::new(PoolRouting),
            store: Arc::new(InMemoryStore::new()),
            audit: AuditTrail::new(),
            archive: Mutex::new(Vec::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_routing(mut self, routing: Arc<dyn RoutingPolicy<S>>) -> Self {
        self.routing = routing;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Graphs & selectors ───────────────────────────────────────────

    /// Register a switch selector under `name`
    pub fn register_selector(
        &self,
        name: impl Into<String>,
        selector: impl SwitchSelector<S> + 'static,
    ) -> WorkflowResult<()> {
        let mut guard = self
            .selectors
            .write()
            .map_err(|_| WorkflowError::Storage("selector registry lock poisoned".into()))?;
        let mut updated = (**guard).clone();
        updated.register(name, Arc::new(selector));
        *guard = Arc::new(updated);
        Ok(())
    }

    /// Validate and register a graph. Every selector it names must
    /// already be registered.
    pub fn register_graph(&self, graph: WorkflowGraph) -> WorkflowResult<WorkflowGraphId> {
        self.selectors()?.check_graph(&graph)?;
        self.graphs
            .write()
            .map_err(|_| WorkflowError::Storage("graph registry lock poisoned".into()))?
            .register(graph)
    }

    /// Parse a graph from YAML and register it
    pub fn register_graph_yaml(&self, yaml: &str) -> WorkflowResult<WorkflowGraphId> {
        self.register_graph(WorkflowGraph::from_yaml_str(yaml)?)
    }

    pub fn graph(&self, id: &WorkflowGraphId) -> WorkflowResult<Arc<WorkflowGraph>> {
        self.graph_registry()?.get(id)
    }

    /// The most recently registered version of a graph
    pub fn latest_graph(&self, name: &str) -> WorkflowResult<Option<Arc<WorkflowGraph>>> {
        Ok(self.graph_registry()?.get_latest_by_name(name))
    }

    // ── Workflow operations ──────────────────────────────────────────

    /// Start a workflow for `subject_id` and run it up to its first
    /// suspension point.
    ///
    /// If the run fails fatally the instance is kept as `Failed` and
    /// `InstanceFailed` carries its id.
    pub fn start_workflow(
        &self,
        subject_id: &SubjectId,
        graph_id: &WorkflowGraphId,
    ) -> WorkflowResult<WorkflowInstanceId> {
        let graph = self.graph(graph_id)?;
        let subject = self
            .subjects
            .lookup(subject_id)
            .ok_or_else(|| WorkflowError::SubjectNotFound(subject_id.to_string()))?;

        let instance = WorkflowInstance::new(graph.id.clone(), subject_id.clone());
        let instance_id = instance.id.clone();
        self.store.insert_instance(instance)?;
        self.record(&instance_id, AuditRecord::started(&graph.id, subject_id));
        tracing::info!(
            instance_id = %instance_id,
            graph_id = %graph.id,
            subject_id = %subject_id,
            "Workflow started"
        );

        let selectors = self.selectors()?;
        let machine = self.machine(&graph, subject.as_ref(), &selectors);
        let mut effects = Effects::default();
        let mut fatal = None;

        let committed = self.store.update_instance(&instance_id, &mut |inst| {
            match machine.enter(inst, &graph.start_step, &mut effects) {
                Ok(_) => Ok(()),
                Err(e) if e.is_fatal() => {
                    fail_instance(self.store.as_ref(), inst, &e, &mut effects)?;
                    fatal = Some(e);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })?;

        self.finish(&committed, subject.as_ref(), effects)?;
        match fatal {
            Some(cause) => Err(WorkflowError::InstanceFailed {
                instance_id,
                cause: Box::new(cause),
            }),
            None => Ok(instance_id),
        }
    }

    /// Accept or reject a task. This is the only entry point that moves
    /// tasks and instances forward.
    pub fn resolve_task(
        &self,
        task_id: &TaskId,
        ctx: &ResolutionContext,
        decision: Decision,
    ) -> WorkflowResult<Resolution> {
        let task = self
            .store
            .update_task(task_id, &mut |t| {
                t.resolve(&ctx.user, decision, ctx.comment.clone())
            })
            .map_err(|e| {
                tracing::warn!(task_id = %task_id, user = %ctx.user, error = %e, "Resolution refused");
                e
            })?;
        self.record(
            &task.instance_id,
            AuditRecord::task_resolved(&task.id, decision, &ctx.user),
        );
        tracing::debug!(
            task_id = %task.id,
            instance_id = %task.instance_id,
            user = %ctx.user,
            decision = %decision,
            "Task resolved"
        );

        let instance = self.store.load_instance(&task.instance_id)?;
        let graph = self.graph(&instance.graph_id)?;
        let Some(subject) = self.subjects.lookup(&instance.subject_id) else {
            let cause = WorkflowError::SubjectNotFound(instance.subject_id.to_string());
            return Err(self.fail(&instance.id, cause)?);
        };

        match decision {
            Decision::Accept => subject.accept_task(&task.id, &ctx.user),
            Decision::Reject => subject.reject_task(&task.id, &ctx.user),
        }

        let selectors = self.selectors()?;
        let machine = self.machine(&graph, subject.as_ref(), &selectors);
        let mut effects = Effects::default();
        let mut outcome = ResolutionOutcome::NoEffect;
        let mut fatal = None;

        let committed = self.store.update_instance(&instance.id, &mut |inst| {
            if !inst.is_current_activation(&task.activation_id) {
                return Ok(());
            }
            let result = match decision {
                Decision::Accept => machine.on_accept(inst, &task, &mut effects),
                Decision::Reject => machine.on_reject(inst, &task, &mut effects),
            };
            match result {
                Ok(o) => {
                    outcome = o;
                    Ok(())
                }
                Err(e) if e.is_fatal() => {
                    fail_instance(self.store.as_ref(), inst, &e, &mut effects)?;
                    fatal = Some(e);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })?;

        if outcome == ResolutionOutcome::NoEffect && fatal.is_none() {
            tracing::warn!(
                task_id = %task.id,
                instance_id = %instance.id,
                "Resolution arrived after its activation closed"
            );
        }
        self.finish(&committed, subject.as_ref(), effects)?;

        if let Some(cause) = fatal {
            return Err(WorkflowError::InstanceFailed {
                instance_id: instance.id,
                cause: Box::new(cause),
            });
        }
        Ok(Resolution {
            task_id: task.id,
            instance_id: instance.id,
            subject_id: instance.subject_id,
            decision,
            outcome,
        })
    }

    /// Re-route an instance that failed because no validator was left.
    ///
    /// A new activation of the failed step is dispatched to `validators`.
    /// Instances that completed or failed for any other reason are not
    /// reopenable.
    pub fn reopen(
        &self,
        instance_id: &WorkflowInstanceId,
        validators: BTreeSet<UserId>,
        operator: &UserId,
    ) -> WorkflowResult<Vec<TaskId>> {
        if validators.is_empty() {
            return Err(WorkflowError::ValidationError(
                "reopen needs at least one validator".into(),
            ));
        }
        let instance = self.store.load_instance(instance_id)?;
        let graph = self.graph(&instance.graph_id)?;
        let subject = self
            .subjects
            .lookup(&instance.subject_id)
            .ok_or_else(|| WorkflowError::SubjectNotFound(instance.subject_id.to_string()))?;

        let selectors = self.selectors()?;
        let machine = self.machine(&graph, subject.as_ref(), &selectors);
        let mut effects = Effects::default();
        let mut created = Vec::new();

        let committed = self.store.update_instance(instance_id, &mut |inst| {
            if inst.failure_class() != Some(ErrorClass::Routing) {
                return Err(WorkflowError::NotReopenable(inst.id.clone()));
            }
            let step = inst
                .current_step_id
                .as_ref()
                .and_then(|id| graph.get_step(id))
                .filter(|s| s.validators().is_some())
                .ok_or_else(|| WorkflowError::NotReopenable(inst.id.clone()))?;

            let slots = if step.is_parallel_action() {
                validators.len()
            } else {
                1
            };
            let join_policy = step
                .single_next()
                .and_then(|next| graph.get_step(next))
                .and_then(|join| match join.kind {
                    StepKind::Join { policy } => Some(policy),
                    _ => None,
                });
            if let Some(policy) = join_policy.filter(|_| step.is_parallel_action()) {
                if policy.required(slots) > slots {
                    return Err(WorkflowError::ValidationError(format!(
                        "join after '{}' needs {} acceptances, only {} validators given",
                        step.id,
                        policy.required(slots),
                        slots
                    )));
                }
            }

            inst.reopen();
            let activation_id = inst.activate_step(step.id.clone(), slots).id.clone();
            effects
                .audit
                .push(AuditRecord::reopened(&step.id, operator));
            if let Some(state) = &step.lifecycle_state {
                effects.lifecycle.push(state.clone());
            }

            let groups: Vec<BTreeSet<UserId>> = if step.is_parallel_action() {
                validators.iter().map(|v| BTreeSet::from([v.clone()])).collect()
            } else {
                vec![validators.clone()]
            };
            created.clear();
            for eligible in groups {
                created.push(machine.dispatch(
                    inst,
                    step,
                    &activation_id,
                    eligible,
                    &BTreeSet::new(),
                    None,
                    &mut effects,
                )?);
            }
            Ok(())
        })?;

        tracing::info!(
            instance_id = %instance_id,
            operator = %operator,
            tasks = created.len(),
            "Workflow reopened"
        );
        self.finish(&committed, subject.as_ref(), effects)?;
        Ok(created)
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Read-only snapshot of an instance and all of its tasks
    pub fn get_instance_state(
        &self,
        instance_id: &WorkflowInstanceId,
    ) -> WorkflowResult<InstanceSnapshot> {
        Ok(InstanceSnapshot {
            instance: self.store.load_instance(instance_id)?,
            tasks: self.store.tasks_for_instance(instance_id)?,
        })
    }

    pub fn get_task(&self, task_id: &TaskId) -> WorkflowResult<Task> {
        self.store.load_task(task_id)
    }

    /// The user's inbox: pending tasks they may resolve
    pub fn pending_tasks_for(&self, user: &UserId) -> WorkflowResult<Vec<Task>> {
        self.store.pending_tasks_for(user)
    }

    /// Ordered audit trail of an instance
    pub fn audit_trail(&self, instance_id: &WorkflowInstanceId) -> WorkflowResult<Vec<AuditRecord>> {
        self.store.load_instance(instance_id)?;
        Ok(self.audit.records_for(instance_id))
    }

    /// Archive records of instances that reached a terminal status
    pub fn completed_workflows(&self) -> WorkflowResult<Vec<CompletedWorkflow>> {
        Ok(self
            .archive
            .lock()
            .map_err(|_| WorkflowError::Storage("archive lock poisoned".into()))?
            .clone())
    }

    // ── Internals ────────────────────────────────────────────────────

    fn graph_registry(&self) -> WorkflowResult<std::sync::RwLockReadGuard<'_, GraphRegistry>> {
        self.graphs
            .read()
            .map_err(|_| WorkflowError::Storage("graph registry lock poisoned".into()))
    }

    fn selectors(&self) -> WorkflowResult<Arc<SelectorRegistry<S>>> {
        self.selectors
            .read()
            .map(|guard| (*guard).clone())
            .map_err(|_| WorkflowError::Storage("selector registry lock poisoned".into()))
    }

    fn machine<'a>(
        &'a self,
        graph: &'a WorkflowGraph,
        subject: &'a S,
        selectors: &'a SelectorRegistry<S>,
    ) -> StateMachine<'a, S> {
        StateMachine {
            graph,
            subject,
            routing: self.routing.as_ref(),
            selectors,
            store: self.store.as_ref(),
            max_switch_hops: self.config.max_switch_hops,
        }
    }

    /// Fail an instance outside of an advancement; returns the error to
    /// surface to the caller
    fn fail(
        &self,
        instance_id: &WorkflowInstanceId,
        cause: WorkflowError,
    ) -> WorkflowResult<WorkflowError> {
        let mut effects = Effects::default();
        let committed = self.store.update_instance(instance_id, &mut |inst| {
            if inst.is_terminal() {
                return Ok(());
            }
            fail_instance(self.store.as_ref(), inst, &cause, &mut effects)
        })?;
        self.finish_without_subject(&committed, effects)?;
        Ok(WorkflowError::InstanceFailed {
            instance_id: instance_id.clone(),
            cause: Box::new(cause),
        })
    }

    /// Apply the effects of a committed advancement
    fn finish(
        &self,
        instance: &WorkflowInstance,
        subject: &S,
        effects: Effects,
    ) -> WorkflowResult<()> {
        for state in &effects.lifecycle {
            tracing::debug!(instance_id = %instance.id, state = %state, "Subject lifecycle change");
            subject.change_state(state);
        }
        self.finish_without_subject(instance, effects)
    }

    fn finish_without_subject(
        &self,
        instance: &WorkflowInstance,
        effects: Effects,
    ) -> WorkflowResult<()> {
        let reached_terminal = effects.audit.iter().any(|r| {
            matches!(
                r.event,
                crate::audit::AuditEvent::WorkflowCompleted
                    | crate::audit::AuditEvent::WorkflowFailed { .. }
            )
        });
        if self.config.audit {
            self.audit.append(&instance.id, effects.audit);
        }
        if !reached_terminal {
            return Ok(());
        }

        match instance.status {
            InstanceStatus::Completed => tracing::info!(
                instance_id = %instance.id,
                step = ?instance.current_step_id,
                "Workflow completed"
            ),
            _ => tracing::error!(
                instance_id = %instance.id,
                class = ?instance.failure_class(),
                reason = instance.failure.as_ref().map(|f| f.message.as_str()).unwrap_or(""),
                "Workflow failed"
            ),
        }

        if self.config.archive_terminal {
            let tasks = self.store.tasks_for_instance(&instance.id)?;
            let record = CompletedWorkflow::from_instance(instance, &tasks);
            self.archive
                .lock()
                .map_err(|_| WorkflowError::Storage("archive lock poisoned".into()))?
                .push(record);
        }
        Ok(())
    }

    fn record(&self, instance_id: &WorkflowInstanceId, record: AuditRecord) {
        if self.config.audit {
            self.audit.record(instance_id, record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::InMemorySubjects;

    struct Memo;

    impl WorkflowSubject for Memo {
        fn accept_task(&self, _task_id: &TaskId, _user: &UserId) {}
        fn reject_task(&self, _task_id: &TaskId, _user: &UserId) {}
    }

    fn make_engine() -> WorkflowEngine<Memo> {
        let subjects = Arc::new(InMemorySubjects::new());
        subjects.insert(SubjectId::new("memo-1"), Memo);
        WorkflowEngine::<Memo>::new(subjects)
    }

    fn make_graph() -> WorkflowGraph {
        WorkflowGraph::new("Memo sign-off", "review")
            .with_step(Step::action("review", "Review", ["v1"]).then("done"))
            .unwrap()
            .with_step(Step::terminal("done"))
            .unwrap()
    }

    #[test]
    fn test_register_graph_requires_selectors() {
        let engine = make_engine();
        let graph = WorkflowGraph::new("Branching", "route")
            .with_step(Step::switch("route", "Route", "by_size").then("done"))
            .unwrap()
            .with_step(Step::terminal("done"))
            .unwrap();

        let result = engine.register_graph(graph.clone());
        assert_eq!(result, Err(WorkflowError::UnknownSelector("by_size".into())));

        engine
            .register_selector("by_size", |_: &WorkflowInstance, _: &Memo| StepId::new("done"))
            .unwrap();
        assert!(engine.register_graph(graph).is_ok());
    }

    #[test]
    fn test_start_unknown_subject() {
        let engine = make_engine();
        let graph_id = engine.register_graph(make_graph()).unwrap();

        let result = engine.start_workflow(&SubjectId::new("memo-404"), &graph_id);
        assert!(matches!(result, Err(WorkflowError::SubjectNotFound(_))));
    }

    #[test]
    fn test_start_unknown_graph() {
        let engine = make_engine();
        let result = engine.start_workflow(&SubjectId::new("memo-1"), &WorkflowGraphId::new("nope"));
        assert!(matches!(result, Err(WorkflowError::GraphNotFound(_))));
    }

    #[test]
    fn test_resolve_unknown_task() {
        let engine = make_engine();
        let result = engine.resolve_task(
            &TaskId::new("nope"),
            &ResolutionContext::new("v1"),
            Decision::Accept,
        );
        assert!(matches!(result, Err(WorkflowError::TaskNotFound(_))));
    }

    #[test]
    fn test_comment_recorded() {
        let engine = make_engine();
        let graph_id = engine.register_graph(make_graph()).unwrap();
        let instance_id = engine
            .start_workflow(&SubjectId::new("memo-1"), &graph_id)
            .unwrap();
        let task = engine.pending_tasks_for(&UserId::new("v1")).unwrap().remove(0);

        let resolution = engine
            .resolve_task(
                &task.id,
                &ResolutionContext::new("v1").with_comment("looks fine"),
                Decision::Accept,
            )
            .unwrap();
        assert_eq!(resolution.subject_id, SubjectId::new("memo-1"));
        assert_eq!(resolution.instance_id, instance_id);

        let stored = engine.get_task(&task.id).unwrap();
        assert_eq!(stored.comment.as_deref(), Some("looks fine"));
        assert_eq!(stored.resolved_by, Some(UserId::new("v1")));
    }

    #[test]
    fn test_reopen_completed_instance() {
        let engine = make_engine();
        let graph_id = engine.register_graph(make_graph()).unwrap();
        let instance_id = engine
            .start_workflow(&SubjectId::new("memo-1"), &graph_id)
            .unwrap();
        let task = engine.pending_tasks_for(&UserId::new("v1")).unwrap().remove(0);
        engine
            .resolve_task(&task.id, &ResolutionContext::new("v1"), Decision::Accept)
            .unwrap();

        let result = engine.reopen(
            &instance_id,
            BTreeSet::from([UserId::new("v2")]),
            &UserId::new("ops"),
        );
        assert!(matches!(result, Err(WorkflowError::NotReopenable(_))));
    }

    #[test]
    fn test_audit_disabled() {
        let engine = make_engine().with_config(EngineConfig::default().with_audit(false));
        let graph_id = engine.register_graph(make_graph()).unwrap();
        let instance_id = engine
            .start_workflow(&SubjectId::new("memo-1"), &graph_id)
            .unwrap();

        assert!(engine.audit_trail(&instance_id).unwrap().is_empty());
        assert!(matches!(
            engine.audit_trail(&WorkflowInstanceId::new("nope")),
            Err(WorkflowError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn test_latest_graph() {
        let engine = make_engine();
        engine.register_graph(make_graph()).unwrap();
        let v2 = engine.register_graph(make_graph().with_version(2)).unwrap();

        let latest = engine.latest_graph("Memo sign-off").unwrap().unwrap();
        assert_eq!(latest.id, v2);
        assert!(engine.latest_graph("Unknown").unwrap().is_none());
    }
}
