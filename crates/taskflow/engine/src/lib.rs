//! Taskflow Workflow Engine
//!
//! The runtime that walks subjects through approval graphs. It creates
//! tasks for validators, re-routes work when a validator rejects, waits
//! on parallel siblings at joins and records every step in an audit
//! trail. It never performs the business work itself: subjects react to
//! accept/reject hooks, and routing decisions come from a
//! [`RoutingPolicy`].
//!
//! # Architecture
//!
//! ```text
//! WorkflowEngine
//!   ├── GraphRegistry       (validated, immutable graphs)
//!   ├── SelectorRegistry    (named switch selectors)
//!   ├── StateMachine        (per-kind step dispatch)
//!   ├── RoutingPolicy       (who gets the next task)
//!   ├── WorkflowStore       (guarded instance/task records)
//!   └── AuditTrail          (ordered per-instance records)
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use taskflow_engine::*;
//! use taskflow_types::*;
//!
//! struct Invoice;
//!
//! impl WorkflowSubject for Invoice {
//!     fn accept_task(&self, _task: &TaskId, _user: &UserId) {}
//!     fn reject_task(&self, _task: &TaskId, _user: &UserId) {}
//! }
//!
//! let subjects = Arc::new(InMemorySubjects::new());
//! subjects.insert(SubjectId::new("inv-1"), Invoice);
//! let engine = WorkflowEngine::<Invoice>::new(subjects);
//!
//! let graph = WorkflowGraph::new("Invoice approval", "review")
//!     .with_step(Step::action("review", "Review", ["alice", "bob"]).then("done"))?
//!     .with_step(Step::terminal("done"))?;
//! let graph_id = engine.register_graph(graph)?;
//!
//! let instance_id = engine.start_workflow(&SubjectId::new("inv-1"), &graph_id)?;
//! let task = engine.pending_tasks_for(&UserId::new("alice"))?.remove(0);
//!
//! let resolution = engine.resolve_task(&task.id, &ResolutionContext::new("alice"), Decision::Accept)?;
//! assert_eq!(resolution.outcome, ResolutionOutcome::Completed);
//! assert_eq!(
//!     engine.get_instance_state(&instance_id)?.status(),
//!     InstanceStatus::Completed
//! );
//! # Ok::<(), WorkflowError>(())
//! ```

#![deny(unsafe_code)]

pub mod audit;
pub mod config;
pub mod engine;
pub mod graph_registry;
pub mod routing;
pub mod state_machine;
pub mod store;
pub mod subject;
pub mod switch;
pub mod telemetry;

pub use audit::{AuditEvent, AuditRecord, AuditTrail};
pub use config::EngineConfig;
pub use engine::{Resolution, ResolutionContext, WorkflowEngine};
pub use graph_registry::GraphRegistry;
pub use routing::{PoolRouting, RoutingPolicy, SequentialRouting};
pub use state_machine::ResolutionOutcome;
pub use store::{InMemoryStore, WorkflowStore};
pub use subject::{InMemorySubjects, SubjectRepository, WorkflowSubject};
pub use switch::{SelectorRegistry, SwitchSelector};
pub use telemetry::init_tracing;
