//! Council Workflow Engine
//!
//! Drives one council workflow from submission to close. The engine owns
//! the task graph and every decision made on it; executors and voters are
//! reached only through the dispatches it hands out.
//!
//! # Architecture
//!
//! The [`WorkflowEngine`] composes specialized components:
//!
//! - [`Journal`] — Sequences audit events and applies them to the state
//! - [`WorkflowState`] — Graph, crises and validation records, rebuilt by replay
//! - [`DelegationEngine`] — Authority-checked, cycle-free sub-task creation
//! - [`Scheduler`] — Readiness, FIFO admission, retry with backoff
//! - [`ValidationGate`] — Verdicts, self-validation refusal, phase ordering
//! - [`CrisisManager`] — Crisis cases, quorum votes and Overseer overrides
//!
//! # Example
//!
//! ```rust
//! use council_engine::WorkflowEngine;
//! use council_types::*;
//! use chrono::Utc;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(RoleRegistry::load(RegistryConfig::standard()).unwrap());
//! let mut engine = WorkflowEngine::submit(
//!     WorkflowId::new("wf-1"),
//!     serde_json::json!({"goal": "summarise the report"}),
//!     registry,
//!     CouncilPolicy::default(),
//!     Utc::now(),
//! )
//! .unwrap();
//!
//! // The root task is handed out for execution
//! let dispatches = engine.tick(Utc::now(), 4).unwrap();
//! let invocation = match &dispatches[0] {
//!     Dispatch::Execute(invocation) => invocation.clone(),
//!     Dispatch::Deliberate(_) => unreachable!(),
//! };
//! assert_eq!(invocation.phase, Phase::Propose);
//!
//! // A plan with no sub-tasks is countersigned and the workflow completes
//! engine
//!     .complete(
//!         &invocation.task_id,
//!         invocation.attempt,
//!         ExecutionOutcome::Succeeded(ExecutionOutput::new(serde_json::json!("nothing to do"))),
//!         Utc::now(),
//!     )
//!     .unwrap();
//! assert_eq!(engine.summary().status, WorkflowStatus::Completed);
//! ```

#![deny(unsafe_code)]

pub mod crisis;
pub mod delegation;
pub mod gate;
pub mod graph;
pub mod journal;
pub mod orchestrator;
pub mod scheduler;
pub mod state;
pub mod vote;

// Re-export main types
pub use crisis::{CrisisManager, CrisisPath, CrisisTrigger, VoteResolution};
pub use delegation::{DelegationEngine, ScreenedBatch};
pub use gate::{GateOutcome, ValidationGate};
pub use graph::TaskGraph;
pub use journal::{EventDraft, Journal};
pub use orchestrator::WorkflowEngine;
pub use scheduler::{RetryDecision, Scheduler};
pub use state::{ReplayError, WorkflowState};
pub use vote::resolve_vote;
