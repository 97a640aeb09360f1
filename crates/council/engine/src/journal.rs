//! Journal: the write path for workflow state
//!
//! Components never touch `WorkflowState` directly. They describe a change
//! as an [`EventDraft`]; the journal stamps it with the next sequence
//! number, applies it, and queues it for the audit sink.

use crate::{ReplayError, WorkflowState};
use chrono::{DateTime, Utc};
use council_types::*;

/// An audit event before it is sequenced
#[derive(Clone, Debug)]
pub struct EventDraft {
    kind: EventKind,
    timestamp: DateTime<Utc>,
    role: Option<RoleId>,
    task_id: Option<TaskId>,
    crisis_id: Option<CrisisId>,
    detail: String,
}

impl EventDraft {
    pub fn new(kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            timestamp,
            role: None,
            task_id: None,
            crisis_id: None,
            detail: String::new(),
        }
    }

    pub fn task(mut self, id: &TaskId) -> Self {
        self.task_id = Some(id.clone());
        self
    }

    pub fn role(mut self, role: &RoleId) -> Self {
        self.role = Some(role.clone());
        self
    }

    pub fn maybe_role(mut self, role: Option<&RoleId>) -> Self {
        self.role = role.cloned();
        self
    }

    pub fn crisis(mut self, id: &CrisisId) -> Self {
        self.crisis_id = Some(id.clone());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Owns a workflow's state and its unsent events
#[derive(Clone, Debug)]
pub struct Journal {
    state: WorkflowState,
    outbox: Vec<AuditEvent>,
}

impl Journal {
    /// Start a workflow with its root task
    pub fn open(
        id: WorkflowId,
        root: Task,
        actor: Option<&RoleId>,
        at: DateTime<Utc>,
    ) -> CouncilResult<Self> {
        let event = AuditEvent {
            sequence: 1,
            workflow_id: id,
            timestamp: at,
            role: actor.cloned(),
            task_id: Some(root.id.clone()),
            crisis_id: None,
            detail: format!("workflow submitted with root {}", root.id),
            kind: EventKind::WorkflowSubmitted { root },
        };
        let state = WorkflowState::genesis(&event)?;
        tracing::trace!(
            workflow_id = %event.workflow_id,
            sequence = event.sequence,
            kind = event.kind.name(),
            "Audit event recorded"
        );
        Ok(Self {
            state,
            outbox: vec![event],
        })
    }

    /// Resume from a reconstructed state
    pub fn from_state(state: WorkflowState) -> Self {
        Self {
            state,
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Sequence, apply and queue one event
    pub fn record(&mut self, draft: EventDraft) -> CouncilResult<u64> {
        let event = AuditEvent {
            sequence: self.state.last_sequence + 1,
            workflow_id: self.state.id.clone(),
            timestamp: draft.timestamp,
            role: draft.role,
            task_id: draft.task_id,
            crisis_id: draft.crisis_id,
            detail: draft.detail,
            kind: draft.kind,
        };
        self.state.apply(&event).map_err(|err: ReplayError| {
            tracing::error!(
                workflow_id = %event.workflow_id,
                kind = event.kind.name(),
                error = %err,
                "Event rejected by workflow state"
            );
            CouncilError::from(err)
        })?;
        tracing::trace!(
            workflow_id = %event.workflow_id,
            sequence = event.sequence,
            kind = event.kind.name(),
            "Audit event recorded"
        );
        let sequence = event.sequence;
        self.outbox.push(event);
        Ok(sequence)
    }

    /// Record a status change after checking it against the current status
    pub fn transition(
        &mut self,
        task_id: &TaskId,
        to: TaskStatus,
        reason: Option<String>,
        role: Option<&RoleId>,
        at: DateTime<Utc>,
    ) -> CouncilResult<()> {
        let from = self
            .state
            .task(task_id)
            .map(|t| t.status)
            .ok_or_else(|| CouncilError::TaskNotFound(task_id.clone()))?;
        if !from.can_transition_to(to) {
            return Err(CouncilError::InvalidTransition {
                task: task_id.clone(),
                from,
                to,
            });
        }
        let detail = match &reason {
            Some(reason) => format!("{} -> {} ({})", from, to, reason),
            None => format!("{} -> {}", from, to),
        };
        self.record(
            EventDraft::new(EventKind::TaskStatusChanged { from, to, reason }, at)
                .task(task_id)
                .maybe_role(role)
                .detail(detail),
        )?;
        Ok(())
    }

    /// Record a fault entry (allowed even after the workflow closes)
    pub fn fault(
        &mut self,
        error: impl Into<String>,
        task_id: Option<&TaskId>,
        role: Option<&RoleId>,
        at: DateTime<Utc>,
    ) -> CouncilResult<()> {
        let error = error.into();
        tracing::warn!(
            workflow_id = %self.state.id,
            task_id = ?task_id,
            error = %error,
            "Workflow fault"
        );
        let mut draft = EventDraft::new(EventKind::Fault { error: error.clone() }, at)
            .maybe_role(role)
            .detail(error);
        if let Some(task_id) = task_id {
            draft = draft.task(task_id);
        }
        self.record(draft)?;
        Ok(())
    }

    /// Take the events recorded since the last drain
    pub fn drain(&mut self) -> Vec<AuditEvent> {
        std::mem::take(&mut self.outbox)
    }

    pub fn pending_events(&self) -> &[AuditEvent] {
        &self.outbox
    }
}
