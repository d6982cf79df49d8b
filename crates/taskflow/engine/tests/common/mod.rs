//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use taskflow_engine::*;
use taskflow_types::*;

/// A purchase order that records every hook the engine calls on it
#[derive(Debug, Default)]
pub struct PurchaseOrder {
    pub amount: u64,
    pub events: Mutex<Vec<String>>,
}

impl PurchaseOrder {
    pub fn new(amount: u64) -> Self {
        Self {
            amount,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn log(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl WorkflowSubject for PurchaseOrder {
    fn accept_task(&self, _task_id: &TaskId, user: &UserId) {
        self.log(format!("accept:{}", user));
    }

    fn reject_task(&self, _task_id: &TaskId, user: &UserId) {
        self.log(format!("reject:{}", user));
    }

    fn change_state(&self, state: &str) {
        self.log(format!("state:{}", state));
    }
}

/// An engine with one registered subject, `po-1`
pub struct Harness {
    pub engine: WorkflowEngine<PurchaseOrder>,
    pub subjects: Arc<InMemorySubjects<PurchaseOrder>>,
    pub order: Arc<PurchaseOrder>,
}

impl Harness {
    pub fn new(amount: u64) -> Self {
        Self::with_engine(amount, |engine| engine)
    }

    pub fn with_engine(
        amount: u64,
        configure: impl FnOnce(WorkflowEngine<PurchaseOrder>) -> WorkflowEngine<PurchaseOrder>,
    ) -> Self {
        let subjects = Arc::new(InMemorySubjects::new());
        let order = subjects.insert(subject_id(), PurchaseOrder::new(amount));
        let engine = configure(WorkflowEngine::<PurchaseOrder>::new(subjects.clone()));
        engine
            .register_selector("amount", |_: &WorkflowInstance, po: &PurchaseOrder| {
                if po.amount > 10_000 {
                    StepId::new("board")
                } else {
                    StepId::new("manager")
                }
            })
            .unwrap();
        Self {
            engine,
            subjects,
            order,
        }
    }

    pub fn start(&self, graph: WorkflowGraph) -> WorkflowResult<WorkflowInstanceId> {
        let graph_id = self.engine.register_graph(graph)?;
        self.engine.start_workflow(&subject_id(), &graph_id)
    }

    pub fn resolve(&self, task_id: &TaskId, user: &str, decision: Decision) -> WorkflowResult<Resolution> {
        self.engine
            .resolve_task(task_id, &ResolutionContext::new(user), decision)
    }

    /// The single pending task of an instance
    pub fn pending_task(&self, instance_id: &WorkflowInstanceId) -> Task {
        let pending = self.pending_tasks(instance_id);
        assert_eq!(pending.len(), 1, "expected exactly one pending task");
        pending.into_iter().next().unwrap()
    }

    pub fn pending_tasks(&self, instance_id: &WorkflowInstanceId) -> Vec<Task> {
        self.engine
            .get_instance_state(instance_id)
            .unwrap()
            .pending_tasks()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn status(&self, instance_id: &WorkflowInstanceId) -> InstanceStatus {
        self.engine.get_instance_state(instance_id).unwrap().status()
    }
}

pub fn subject_id() -> SubjectId {
    SubjectId::new("po-1")
}

pub fn users(ids: &[&str]) -> std::collections::BTreeSet<UserId> {
    ids.iter().map(|id| UserId::new(*id)).collect()
}

/// `review` (pooled) then `done`
pub fn single_review(validators: &[&str]) -> WorkflowGraph {
    WorkflowGraph::new("Single review", "review")
        .with_step(
            Step::action("review", "Review", validators.iter().copied())
                .with_lifecycle_state("in_review")
                .then("done"),
        )
        .unwrap()
        .with_step(Step::terminal("done").with_lifecycle_state("approved"))
        .unwrap()
}

/// `sign` (per validator) into a join with `policy`, then `done`
pub fn parallel_sign(validators: &[&str], policy: CompletionPolicy) -> WorkflowGraph {
    WorkflowGraph::new("Parallel sign-off", "sign")
        .with_step(Step::parallel_action("sign", "Sign", validators.iter().copied()).then("signed"))
        .unwrap()
        .with_step(Step::join("signed", policy).then("done"))
        .unwrap()
        .with_step(Step::terminal("done"))
        .unwrap()
}

/// `route` switches on amount to `manager` (pooled) or `board` (quorum 2 of 3)
pub fn purchase_approval() -> WorkflowGraph {
    WorkflowGraph::new("Purchase approval", "route")
        .with_step(
            Step::switch("route", "Route by amount", "amount")
                .then("manager")
                .then("board"),
        )
        .unwrap()
        .with_step(Step::action("manager", "Manager", ["mia", "max"]).then("done"))
        .unwrap()
        .with_step(Step::parallel_action("board", "Board", ["b1", "b2", "b3"]).then("board_vote"))
        .unwrap()
        .with_step(Step::join("board_vote", CompletionPolicy::Quorum(2)).then("done"))
        .unwrap()
        .with_step(Step::terminal("done").with_lifecycle_state("approved"))
        .unwrap()
}
