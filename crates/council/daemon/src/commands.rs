//! Operations behind the councild subcommands

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use council_engine::{WorkflowEngine, WorkflowState};
use council_runtime::audit::read_records;
use council_runtime::recovery::recover;
use council_runtime::{
    verify_chain, AuditSink, ChainVerification, CouncilRuntime, FileAuditSink, FileSnapshotStore,
    MemoryAuditSink, MemorySnapshotStore, Script, ScriptedProvider, SnapshotStore,
};
use council_types::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Outcome of `councild run`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub summary: WorkflowSummary,
    /// Set when the workflow closed on an unresolved crisis
    #[serde(default)]
    pub error: Option<String>,
    pub audit_entries: u64,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.summary.status == WorkflowStatus::Completed
    }
}

/// A workflow reconstructed from persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayedWorkflow {
    pub summary: WorkflowSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<WorkflowState>,
}

/// Load a script file (JSON)
pub async fn load_script(path: &Path) -> DaemonResult<Script> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

/// Parse a payload argument: inline JSON, or `@path` to read it from a file
pub async fn parse_payload(arg: &str) -> DaemonResult<serde_json::Value> {
    let raw = match arg.strip_prefix('@') {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => arg.to_string(),
    };
    serde_json::from_str(&raw).map_err(|e| DaemonError::Input(format!("payload is not JSON: {}", e)))
}

/// Validated role table
pub fn roles(config: &DaemonConfig) -> DaemonResult<Vec<Role>> {
    let registry = RoleRegistry::load(config.roles.clone())?;
    Ok(registry.roles().cloned().collect())
}

/// Submit one workflow, answer every invocation from `script`, and wait for
/// it to close
pub async fn run_workflow(
    config: &DaemonConfig,
    payload: serde_json::Value,
    script: Script,
) -> DaemonResult<RunReport> {
    let registry = Arc::new(RoleRegistry::load(config.roles.clone())?);

    let sink: Arc<dyn AuditSink> = match &config.persistence.audit_path {
        Some(path) => Arc::new(FileAuditSink::open(path).await?),
        None => Arc::new(MemoryAuditSink::new()),
    };
    let store: Arc<dyn SnapshotStore> = match &config.persistence.snapshot_dir {
        Some(dir) => Arc::new(FileSnapshotStore::open(dir).await?),
        None => Arc::new(MemorySnapshotStore::new()),
    };

    let handle = CouncilRuntime::new(
        registry,
        config.policy.clone(),
        Arc::new(ScriptedProvider::from_script(script)),
    )
    .with_audit_sink(sink.clone())
    .with_snapshot_store(store)
    .with_snapshot_interval(config.persistence.snapshot_interval_ticks)
    .with_archive_limit(config.persistence.archive_limit)
    .start();

    let id = handle.submit_workflow(payload).await?;
    tracing::info!(workflow_id = %id, "Workflow submitted");

    let outcome = handle.wait_for_completion(&id).await;
    let report = match outcome {
        Ok(summary) => RunReport {
            summary,
            error: None,
            audit_entries: 0,
        },
        Err(err @ CouncilError::CrisisUnresolved { .. }) => RunReport {
            summary: handle.get_status(&id).await?,
            error: Some(err.to_string()),
            audit_entries: 0,
        },
        Err(err) => {
            let _ = handle.shutdown().await;
            return Err(err.into());
        }
    };

    handle.shutdown().await?;
    let audit_entries = sink.entry_count().await?;

    tracing::info!(
        workflow_id = %id,
        status = %report.summary.status,
        audit_entries,
        "Workflow closed"
    );
    Ok(RunReport {
        audit_entries,
        ..report
    })
}

/// Rebuild workflows from an audit file and optional snapshot directory
pub async fn replay(
    config: &DaemonConfig,
    audit: &Path,
    snapshots: Option<&Path>,
    workflow: Option<&WorkflowId>,
    full: bool,
) -> DaemonResult<Vec<ReplayedWorkflow>> {
    if !tokio::fs::try_exists(audit).await? {
        return Err(DaemonError::Input(format!(
            "audit file {} does not exist",
            audit.display()
        )));
    }

    let registry = Arc::new(RoleRegistry::load(config.roles.clone())?);
    let sink = FileAuditSink::open(audit).await?;
    let engines = match snapshots {
        Some(dir) => {
            let store = FileSnapshotStore::open(dir).await?;
            recover(&sink, &store, registry, &config.policy).await?
        }
        None => recover(&sink, &MemorySnapshotStore::new(), registry, &config.policy).await?,
    };

    let replayed: Vec<ReplayedWorkflow> = engines
        .into_iter()
        .filter(|engine| workflow.map_or(true, |id| engine.id() == id))
        .map(|engine| describe(&engine, full))
        .collect();

    if let Some(id) = workflow {
        if replayed.is_empty() {
            return Err(CouncilError::WorkflowNotFound(id.clone()).into());
        }
    }
    Ok(replayed)
}

fn describe(engine: &WorkflowEngine, full: bool) -> ReplayedWorkflow {
    ReplayedWorkflow {
        summary: engine.summary(),
        state: full.then(|| engine.snapshot()),
    }
}

/// Check the hash chain of an audit file
pub async fn verify_audit(path: &Path) -> DaemonResult<ChainVerification> {
    let records = read_records(path).await?;
    Ok(verify_chain(&records)?)
}
