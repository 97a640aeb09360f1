//! Rebuild workflows after a restart
//!
//! Each workflow is reconstructed from its latest snapshot (if any) plus
//! the audit events recorded after it. The audit chain is verified first.

use crate::audit::{ensure_intact, AuditRecord, AuditSink};
use crate::error::{StoreError, StoreResult};
use crate::store::SnapshotStore;
use council_engine::{WorkflowEngine, WorkflowState};
use council_types::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Audit events grouped by workflow, in order of first appearance
pub fn group_events(records: &[AuditRecord]) -> Vec<(WorkflowId, Vec<AuditEvent>)> {
    let mut order: Vec<WorkflowId> = Vec::new();
    let mut grouped: BTreeMap<WorkflowId, Vec<AuditEvent>> = BTreeMap::new();
    for record in records {
        let id = &record.event.workflow_id;
        if !grouped.contains_key(id) {
            order.push(id.clone());
        }
        grouped.entry(id.clone()).or_default().push(record.event.clone());
    }
    order
        .into_iter()
        .map(|id| {
            let events = grouped.remove(&id).unwrap_or_default();
            (id, events)
        })
        .collect()
}

/// Reconstruct one workflow
pub fn rebuild(
    id: &WorkflowId,
    snapshot: Option<WorkflowState>,
    events: &[AuditEvent],
) -> StoreResult<WorkflowState> {
    WorkflowState::replay(snapshot, events).map_err(|source| StoreError::Replay {
        workflow: id.clone(),
        source,
    })
}

/// Reconstruct every workflow known to the audit trail or the snapshot
/// store, ready to hand to the runtime
pub async fn recover(
    audit: &dyn AuditSink,
    snapshots: &dyn SnapshotStore,
    registry: Arc<RoleRegistry>,
    policy: &CouncilPolicy,
) -> StoreResult<Vec<WorkflowEngine>> {
    let records = audit.read_all().await?;
    ensure_intact(&records)?;

    let mut grouped = group_events(&records);
    for id in snapshots.list().await? {
        if !grouped.iter().any(|(known, _)| *known == id) {
            grouped.push((id, Vec::new()));
        }
    }

    let mut engines = Vec::with_capacity(grouped.len());
    for (id, events) in grouped {
        let snapshot = snapshots.load(&id).await?;
        let state = rebuild(&id, snapshot, &events)?;
        tracing::info!(
            workflow_id = %id,
            status = %state.status,
            sequence = state.last_sequence,
            replayed = events.len(),
            "Workflow recovered"
        );
        engines.push(WorkflowEngine::restore(state, registry.clone(), policy.clone()));
    }
    Ok(engines)
}
