//! Workflow Domain Types for taskflow
//!
//! A taskflow workflow is a graph of **approval steps** walked by a
//! single business object (the *subject*). Action steps hand work to
//! human validators as tasks; the subject only moves on once the tasks
//! of its current step are accepted.
//!
//! # Key Concepts
//!
//! - **WorkflowGraph**: The immutable blueprint. Steps are Action,
//!   Switch, Join or Terminal nodes, linked by their `next` lists.
//! - **Task**: A unit of human decision work bound to one step activation,
//!   one subject and a set of eligible validators. Write-once: a task is
//!   resolved exactly once and rejected tasks are superseded, never reused.
//! - **WorkflowInstance**: One running execution of a graph for a subject,
//!   with at most one active step at a time.
//! - **CompletedWorkflow**: The archive record produced when an instance
//!   reaches a terminal status.
//!
//! # Design Principles
//!
//! 1. Rejection re-routes, it does not abort. Only an exhausted validator
//!    pool or a broken graph fails an instance.
//! 2. Every resolution is a guarded transition out of `Pending`.
//! 3. Steps are a closed set of kinds dispatched explicitly.

#![deny(unsafe_code)]

mod completion;
mod errors;
mod graph;
mod instance;
mod task;

pub use completion::*;
pub use errors::*;
pub use graph::*;
pub use instance::*;
pub use task::*;
