//! Council Runtime
//!
//! Runs council workflows on Tokio: one orchestrator loop owning every
//! [`council_engine::WorkflowEngine`], worker units calling a
//! [`ReasoningProvider`], and a persistence task writing the hash-chained
//! audit trail and periodic snapshots.
//!
//! # Architecture
//!
//! - [`CouncilRuntime`] / [`CouncilHandle`] — Loop construction and the control API
//! - [`ReasoningProvider`] — The opaque capability executors and voters call
//! - [`ScriptedProvider`] — Canned answers per role and phase
//! - [`AuditSink`] — Append-only, hash-chained event storage
//! - [`SnapshotStore`] — Latest state per workflow
//! - [`recover`] — Snapshot plus audit tail back into engines
//!
//! # Example
//!
//! ```rust,no_run
//! use council_runtime::{CouncilRuntime, ScriptedProvider};
//! use council_types::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> CouncilResult<()> {
//! let registry = Arc::new(RoleRegistry::load(RegistryConfig::standard())?);
//! let handle = CouncilRuntime::new(registry, CouncilPolicy::default(), Arc::new(ScriptedProvider::new()))
//!     .start();
//!
//! let id = handle.submit_workflow(serde_json::json!({"goal": "summarise"})).await?;
//! let summary = handle.wait_for_completion(&id).await?;
//! assert_eq!(summary.status, WorkflowStatus::Completed);
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod audit;
pub mod error;
pub mod provider;
pub mod recovery;
pub mod runtime;
pub mod script;
pub mod store;
pub mod worker;

pub use audit::{verify_chain, AuditRecord, AuditSink, ChainVerification, FileAuditSink, MemoryAuditSink};
pub use error::{StoreError, StoreResult};
pub use provider::{InvocationContext, ProviderError, ProviderResult, ReasoningProvider};
pub use recovery::{rebuild, recover};
pub use runtime::{CouncilHandle, CouncilRuntime};
pub use script::{RecordedCall, RoleStep, Script, ScriptStep, ScriptedProvider};
pub use store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
