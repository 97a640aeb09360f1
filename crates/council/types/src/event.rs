//! Audit events
//!
//! Every change to a workflow is first written as an `AuditEvent` and then
//! applied to the in-memory state. Replaying the events of a workflow in
//! sequence order rebuilds its state exactly.

use crate::{
    CrisisCase, CrisisId, CrisisResolution, CrisisStatus, OverrideAction, RoleId, Task, TaskId,
    TaskStatus, ValidationRecord, Vote, VoteOutcome, VoteTally, WorkflowId, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One entry in a workflow's append-only log
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Position in the workflow log, starting at 1
    pub sequence: u64,
    pub workflow_id: WorkflowId,
    pub timestamp: DateTime<Utc>,
    /// Acting role, if any (system actions have none)
    #[serde(default)]
    pub role: Option<RoleId>,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub crisis_id: Option<CrisisId>,
    #[serde(default)]
    pub detail: String,
    pub kind: EventKind,
}

/// What happened. Task- and crisis-scoped kinds apply to the event's
/// `task_id` / `crisis_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_kind", rename_all = "snake_case")]
pub enum EventKind {
    WorkflowSubmitted {
        root: Task,
    },
    TaskDelegated {
        task: Task,
    },
    TaskStatusChanged {
        from: TaskStatus,
        to: TaskStatus,
        #[serde(default)]
        reason: Option<String>,
    },
    TaskStarted {
        attempt: u32,
        deadline: DateTime<Utc>,
    },
    TaskCompleted {
        result: serde_json::Value,
    },
    TaskRetryScheduled {
        attempts: u32,
        not_before: DateTime<Utc>,
        error: String,
    },
    DependencyAdded {
        on: TaskId,
    },
    DependencyRewired {
        from: TaskId,
        to: TaskId,
    },
    ReviewRetargeted {
        to: TaskId,
    },
    TaskRetired {
        #[serde(default)]
        superseded_by: Option<TaskId>,
    },
    OwnerReassigned {
        from: RoleId,
        to: RoleId,
    },
    ValidationRecorded {
        record: ValidationRecord,
    },
    DelegationRefused {
        error: String,
        /// Counts as an authority strike against the acting role
        authority: bool,
    },
    CrisisOpened {
        case: CrisisCase,
    },
    VotingStarted {
        eligible: BTreeSet<RoleId>,
        deadline: DateTime<Utc>,
    },
    VoteCast {
        vote: Vote,
    },
    VoteClosed {
        tally: VoteTally,
        outcome: VoteOutcome,
    },
    OverrideReviewOpened {
        #[serde(default)]
        review_task: Option<TaskId>,
    },
    OverrideApplied {
        action: OverrideAction,
        justification: String,
    },
    CrisisResolved {
        resolution: CrisisResolution,
        status: CrisisStatus,
    },
    RoleExcluded {
        role: RoleId,
        replacement: RoleId,
    },
    Fault {
        error: String,
    },
    /// Normal close: every task is already terminal
    WorkflowClosed {
        status: WorkflowStatus,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Early close: sweeps every non-terminal task to `Rejected` and
    /// withdraws open crises
    WorkflowTerminated {
        status: WorkflowStatus,
        reason: String,
        #[serde(default)]
        crisis: Option<CrisisId>,
    },
}

impl EventKind {
    /// Stable name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::WorkflowSubmitted { .. } => "workflow_submitted",
            EventKind::TaskDelegated { .. } => "task_delegated",
            EventKind::TaskStatusChanged { .. } => "task_status_changed",
            EventKind::TaskStarted { .. } => "task_started",
            EventKind::TaskCompleted { .. } => "task_completed",
            EventKind::TaskRetryScheduled { .. } => "task_retry_scheduled",
            EventKind::DependencyAdded { .. } => "dependency_added",
            EventKind::DependencyRewired { .. } => "dependency_rewired",
            EventKind::ReviewRetargeted { .. } => "review_retargeted",
            EventKind::TaskRetired { .. } => "task_retired",
            EventKind::OwnerReassigned { .. } => "owner_reassigned",
            EventKind::ValidationRecorded { .. } => "validation_recorded",
            EventKind::DelegationRefused { .. } => "delegation_refused",
            EventKind::CrisisOpened { .. } => "crisis_opened",
            EventKind::VotingStarted { .. } => "voting_started",
            EventKind::VoteCast { .. } => "vote_cast",
            EventKind::VoteClosed { .. } => "vote_closed",
            EventKind::OverrideReviewOpened { .. } => "override_review_opened",
            EventKind::OverrideApplied { .. } => "override_applied",
            EventKind::CrisisResolved { .. } => "crisis_resolved",
            EventKind::RoleExcluded { .. } => "role_excluded",
            EventKind::Fault { .. } => "fault",
            EventKind::WorkflowClosed { .. } => "workflow_closed",
            EventKind::WorkflowTerminated { .. } => "workflow_terminated",
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            EventKind::Fault { .. } | EventKind::DelegationRefused { .. }
        )
    }
}
