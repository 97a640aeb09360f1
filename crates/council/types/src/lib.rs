//! Council Domain Types
//!
//! A council workflow takes one unit of work, decomposes it into phased
//! sub-tasks, routes each sub-task to a role-bound executor, and refuses to
//! treat any result as final until a validating role has accepted it.
//! Disagreements that cannot be settled locally become crisis cases.
//!
//! # Key Concepts
//!
//! - **Role**: A named participant with an ordered authority level and the
//!   `(target role, phase)` pairs it may delegate to. Roles are data.
//! - **Task**: A phased unit of work owned by one role, with dependency edges
//!   to the tasks it waits on.
//! - **ValidationRecord**: The verdict of a validating role on a task. The
//!   highest-sequence record for a task is the active one.
//! - **CrisisCase**: An escalation (deadlock, authority violation, repeated
//!   validation failure, no confidence) resolved by vote or by the Overseer.
//! - **AuditEvent**: One entry in the append-only workflow log. Workflow
//!   state is rebuilt by applying these in sequence.
//! - **CouncilPolicy**: Budgets, timeouts and voting rules.
//!
//! # Design Principles
//!
//! 1. Authority is checked on every delegation and every verdict.
//! 2. No task is accepted without a validation record from another role.
//! 3. Every state change is an audit event first.
//! 4. Escalation is explicit and bounded.

#![deny(unsafe_code)]

mod crisis;
mod delegation;
mod errors;
mod event;
mod ids;
mod invocation;
mod policy;
mod role;
mod task;
mod validation;
mod workflow;

pub use crisis::*;
pub use delegation::*;
pub use errors::*;
pub use event::*;
pub use ids::*;
pub use invocation::*;
pub use policy::*;
pub use role::*;
pub use task::*;
pub use validation::*;
pub use workflow::*;
