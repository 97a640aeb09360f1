//! Workflow state and event application
//!
//! `WorkflowState` is the whole persisted state of one workflow: its task
//! graph, crisis cases, validation records and bookkeeping counters.
//! `apply` is the only way it changes, so a snapshot plus the events that
//! follow it always reconstruct the same state.

use crate::TaskGraph;
use chrono::{DateTime, Utc};
use council_types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Errors raised while applying events
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("No events to replay")]
    Empty,

    #[error("Event {0} does not start a workflow")]
    NotGenesis(u64),

    #[error("Event {0} submits a workflow that already exists")]
    UnexpectedGenesis(u64),

    #[error("Event {found} out of order: expected sequence {expected}")]
    OutOfOrder { expected: u64, found: u64 },

    #[error("Event belongs to workflow {found}, not {expected}")]
    ForeignEvent {
        expected: WorkflowId,
        found: WorkflowId,
    },

    #[error("Event {sequence} is missing its {field}")]
    MissingField {
        sequence: u64,
        field: &'static str,
    },

    #[error("Event {sequence} references unknown task {task}")]
    UnknownTask { sequence: u64, task: TaskId },

    #[error("Event {sequence} creates task {task}, which already exists")]
    DuplicateTask { sequence: u64, task: TaskId },

    #[error("Event {sequence} references unknown crisis {crisis}")]
    UnknownCrisis { sequence: u64, crisis: CrisisId },

    #[error("Event {sequence}: task {task} cannot move from {from} to {to}")]
    IllegalTransition {
        sequence: u64,
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Event {sequence}: task {task} accepted without a passing record from another role")]
    UnvalidatedAcceptance { sequence: u64, task: TaskId },

    #[error("Event {sequence}: crisis {crisis} cannot move from {from:?} to {to:?}")]
    IllegalCrisisTransition {
        sequence: u64,
        crisis: CrisisId,
        from: CrisisStatus,
        to: CrisisStatus,
    },

    #[error("Event {0} changes a closed workflow")]
    WorkflowClosed(u64),
}

impl From<ReplayError> for CouncilError {
    fn from(err: ReplayError) -> Self {
        CouncilError::Replay(err.to_string())
    }
}

/// Complete state of one workflow
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: WorkflowId,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub closing_reason: Option<String>,
    /// Set when the workflow failed because a crisis could not be resolved
    #[serde(default)]
    pub unresolved_crisis: Option<CrisisId>,
    pub root: TaskId,
    pub graph: TaskGraph,
    #[serde(default)]
    pub crises: BTreeMap<CrisisId, CrisisCase>,
    #[serde(default)]
    pub validations: BTreeMap<TaskId, Vec<ValidationRecord>>,
    #[serde(default)]
    pub excluded_roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub authority_strikes: BTreeMap<RoleId, u32>,
    /// Sequence of the last applied event
    pub last_sequence: u64,
    pub next_task_seq: u64,
    pub next_crisis_seq: u64,
    pub next_validation_seq: u64,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Build the initial state from a `WorkflowSubmitted` event
    pub fn genesis(event: &AuditEvent) -> Result<Self, ReplayError> {
        let root = match &event.kind {
            EventKind::WorkflowSubmitted { root } if event.sequence == 1 => root.clone(),
            _ => return Err(ReplayError::NotGenesis(event.sequence)),
        };

        let mut graph = TaskGraph::new();
        let root_id = root.id.clone();
        let next_task_seq = root.created_seq + 1;
        graph.insert(root);

        Ok(Self {
            id: event.workflow_id.clone(),
            status: WorkflowStatus::Active,
            closing_reason: None,
            unresolved_crisis: None,
            root: root_id,
            graph,
            crises: BTreeMap::new(),
            validations: BTreeMap::new(),
            excluded_roles: BTreeSet::new(),
            authority_strikes: BTreeMap::new(),
            last_sequence: event.sequence,
            next_task_seq,
            next_crisis_seq: 1,
            next_validation_seq: 1,
            submitted_at: event.timestamp,
            updated_at: event.timestamp,
        })
    }

    /// Rebuild a workflow from an optional snapshot and its events.
    ///
    /// Events already covered by the snapshot are skipped.
    pub fn replay<'a>(
        snapshot: Option<WorkflowState>,
        events: impl IntoIterator<Item = &'a AuditEvent>,
    ) -> Result<Self, ReplayError> {
        let mut events = events.into_iter();
        let mut state = match snapshot {
            Some(state) => state,
            None => {
                let first = events.next().ok_or(ReplayError::Empty)?;
                Self::genesis(first)?
            }
        };

        for event in events {
            if event.workflow_id != state.id || event.sequence <= state.last_sequence {
                continue;
            }
            state.apply(event)?;
        }
        Ok(state)
    }

    // ── Event Application ────────────────────────────────────────────

    /// Apply one event. The state is unchanged if this returns an error.
    pub fn apply(&mut self, event: &AuditEvent) -> Result<(), ReplayError> {
        if event.workflow_id != self.id {
            return Err(ReplayError::ForeignEvent {
                expected: self.id.clone(),
                found: event.workflow_id.clone(),
            });
        }
        let expected = self.last_sequence + 1;
        if event.sequence != expected {
            return Err(ReplayError::OutOfOrder {
                expected,
                found: event.sequence,
            });
        }
        if self.status.is_closed() && !matches!(event.kind, EventKind::Fault { .. }) {
            return Err(ReplayError::WorkflowClosed(event.sequence));
        }

        let seq = event.sequence;
        let at = event.timestamp;

        match &event.kind {
            EventKind::WorkflowSubmitted { .. } => {
                return Err(ReplayError::UnexpectedGenesis(seq));
            }

            EventKind::TaskDelegated { task } => {
                if self.graph.contains(&task.id) {
                    return Err(ReplayError::DuplicateTask {
                        sequence: seq,
                        task: task.id.clone(),
                    });
                }
                self.next_task_seq = self.next_task_seq.max(task.created_seq + 1);
                self.graph.insert(task.clone());
            }

            EventKind::TaskStatusChanged { from, to, reason } => {
                let task_id = task_of(event)?;
                self.transition(seq, &task_id, Some(*from), *to, reason.clone(), at)?;
            }

            EventKind::TaskStarted { attempt, deadline } => {
                let task_id = task_of(event)?;
                self.transition(seq, &task_id, Some(TaskStatus::Ready), TaskStatus::Running, None, at)?;
                let task = self.task_mut(seq, &task_id)?;
                task.attempts = *attempt;
                task.deadline = Some(*deadline);
                task.not_before = None;
            }

            EventKind::TaskCompleted { result } => {
                let task_id = task_of(event)?;
                self.transition(
                    seq,
                    &task_id,
                    Some(TaskStatus::Running),
                    TaskStatus::AwaitingValidation,
                    None,
                    at,
                )?;
                let task = self.task_mut(seq, &task_id)?;
                task.result = Some(result.clone());
                task.deadline = None;
            }

            EventKind::TaskRetryScheduled {
                attempts,
                not_before,
                error,
            } => {
                let task_id = task_of(event)?;
                self.transition(
                    seq,
                    &task_id,
                    Some(TaskStatus::Running),
                    TaskStatus::Pending,
                    Some(error.clone()),
                    at,
                )?;
                let task = self.task_mut(seq, &task_id)?;
                task.attempts = *attempts;
                task.not_before = Some(*not_before);
                task.deadline = None;
            }

            EventKind::DependencyAdded { on } => {
                let task_id = task_of(event)?;
                self.require_task(seq, on)?;
                self.task_mut(seq, &task_id)?.dependencies.insert(on.clone());
            }

            EventKind::DependencyRewired { from, to } => {
                let task_id = task_of(event)?;
                self.require_task(seq, to)?;
                let task = self.task_mut(seq, &task_id)?;
                task.dependencies.remove(from);
                task.dependencies.insert(to.clone());
            }

            EventKind::ReviewRetargeted { to } => {
                let task_id = task_of(event)?;
                self.require_task(seq, to)?;
                self.task_mut(seq, &task_id)?.reviews = Some(to.clone());
            }

            EventKind::TaskRetired { superseded_by } => {
                let task_id = task_of(event)?;
                let task = self.task_mut(seq, &task_id)?;
                task.retired = true;
                task.superseded_by = superseded_by.clone();
                task.updated_at = at;
            }

            EventKind::OwnerReassigned { to, .. } => {
                let task_id = task_of(event)?;
                let task = self.task_mut(seq, &task_id)?;
                task.owner = to.clone();
                task.updated_at = at;
            }

            EventKind::ValidationRecorded { record } => {
                self.require_task(seq, &record.task_id)?;
                self.next_validation_seq = self.next_validation_seq.max(record.sequence + 1);
                self.validations
                    .entry(record.task_id.clone())
                    .or_default()
                    .push(record.clone());
            }

            EventKind::DelegationRefused { authority, .. } => {
                if *authority {
                    let role = event.role.clone().ok_or(ReplayError::MissingField {
                        sequence: seq,
                        field: "role",
                    })?;
                    *self.authority_strikes.entry(role).or_insert(0) += 1;
                }
            }

            EventKind::CrisisOpened { case } => {
                self.require_task(seq, &case.task_id)?;
                self.next_crisis_seq = self.next_crisis_seq.max(crisis_ordinal(&case.id) + 1);
                self.crises.insert(case.id.clone(), case.clone());
            }

            EventKind::VotingStarted { eligible, deadline } => {
                let case = self.crisis_mut(seq, event)?;
                move_crisis(seq, case, CrisisStatus::Voting)?;
                case.eligible_voters = eligible.clone();
                case.vote_deadline = Some(*deadline);
            }

            EventKind::VoteCast { vote } => {
                let case = self.crisis_mut(seq, event)?;
                if case.status != CrisisStatus::Voting {
                    return Err(ReplayError::IllegalCrisisTransition {
                        sequence: seq,
                        crisis: case.id.clone(),
                        from: case.status,
                        to: CrisisStatus::Voting,
                    });
                }
                case.ballots.push(vote.clone());
            }

            EventKind::VoteClosed { tally, outcome } => {
                let case = self.crisis_mut(seq, event)?;
                case.tally = Some(*tally);
                case.outcome = Some(*outcome);
            }

            EventKind::OverrideReviewOpened { review_task } => {
                if let Some(task) = review_task {
                    self.require_task(seq, task)?;
                }
                let case = self.crisis_mut(seq, event)?;
                move_crisis(seq, case, CrisisStatus::OverrideReview)?;
                case.review_task = review_task.clone();
            }

            EventKind::OverrideApplied { .. } => {}

            EventKind::CrisisResolved { resolution, status } => {
                let case = self.crisis_mut(seq, event)?;
                move_crisis(seq, case, *status)?;
                case.resolution = Some(resolution.clone());
                case.closed_at = Some(at);
            }

            EventKind::RoleExcluded { role, .. } => {
                self.excluded_roles.insert(role.clone());
            }

            EventKind::Fault { .. } => {}

            EventKind::WorkflowClosed { status, reason } => {
                self.status = *status;
                self.closing_reason = reason.clone();
            }

            EventKind::WorkflowTerminated {
                status,
                reason,
                crisis,
            } => {
                let sweep = status.sweep_reason();
                for task in self.graph.tasks_mut() {
                    if !task.status.is_terminal() {
                        task.status = TaskStatus::Rejected;
                        task.status_reason = Some(sweep.to_string());
                        task.deadline = None;
                        task.updated_at = at;
                    }
                }
                for case in self.crises.values_mut() {
                    if case.is_open() {
                        case.status = CrisisStatus::Resolved;
                        case.resolution = Some(CrisisResolution::Withdrawn {
                            reason: sweep.to_string(),
                        });
                        case.closed_at = Some(at);
                    }
                }
                self.status = *status;
                self.closing_reason = Some(reason.clone());
                self.unresolved_crisis = crisis.clone();
            }
        }

        self.last_sequence = seq;
        self.updated_at = at;
        Ok(())
    }

    fn transition(
        &mut self,
        seq: u64,
        task_id: &TaskId,
        expected_from: Option<TaskStatus>,
        to: TaskStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), ReplayError> {
        let validated = to != TaskStatus::Accepted || self.has_passing_record(task_id);
        let task = self.task_mut(seq, task_id)?;
        let from = task.status;
        if expected_from.is_some_and(|expected| expected != from) || !from.can_transition_to(to) {
            return Err(ReplayError::IllegalTransition {
                sequence: seq,
                task: task_id.clone(),
                from,
                to,
            });
        }
        if !validated {
            return Err(ReplayError::UnvalidatedAcceptance {
                sequence: seq,
                task: task_id.clone(),
            });
        }
        task.status = to;
        task.status_reason = reason;
        task.updated_at = at;
        Ok(())
    }

    fn task_mut(&mut self, seq: u64, id: &TaskId) -> Result<&mut Task, ReplayError> {
        self.graph.get_mut(id).ok_or_else(|| ReplayError::UnknownTask {
            sequence: seq,
            task: id.clone(),
        })
    }

    fn require_task(&self, seq: u64, id: &TaskId) -> Result<(), ReplayError> {
        if self.graph.contains(id) {
            Ok(())
        } else {
            Err(ReplayError::UnknownTask {
                sequence: seq,
                task: id.clone(),
            })
        }
    }

    fn crisis_mut(&mut self, seq: u64, event: &AuditEvent) -> Result<&mut CrisisCase, ReplayError> {
        let id = event.crisis_id.as_ref().ok_or(ReplayError::MissingField {
            sequence: seq,
            field: "crisis_id",
        })?;
        self.crises
            .get_mut(id)
            .ok_or_else(|| ReplayError::UnknownCrisis {
                sequence: seq,
                crisis: id.clone(),
            })
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.graph.get(id)
    }

    pub fn crisis(&self, id: &CrisisId) -> Option<&CrisisCase> {
        self.crises.get(id)
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    /// The highest-sequence record for a task
    pub fn active_validation(&self, task: &TaskId) -> Option<&ValidationRecord> {
        self.validations
            .get(task)
            .and_then(|records| records.iter().max_by_key(|r| r.sequence))
    }

    pub fn validation_history(&self, task: &TaskId) -> &[ValidationRecord] {
        self.validations
            .get(task)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_passing_record(&self, task: &TaskId) -> bool {
        let owner = match self.graph.get(task) {
            Some(t) => &t.owner,
            None => return false,
        };
        self.active_validation(task)
            .is_some_and(|r| r.is_pass() && r.validating_role != *owner)
    }

    pub fn open_crises(&self) -> Vec<&CrisisCase> {
        self.crises.values().filter(|c| c.is_open()).collect()
    }

    /// Most recent closed case on a task, for `supersedes` links
    pub fn latest_closed_crisis_for(&self, task: &TaskId) -> Option<CrisisId> {
        self.crises
            .values()
            .filter(|c| c.task_id == *task && !c.is_open())
            .max_by_key(|c| crisis_ordinal(&c.id))
            .map(|c| c.id.clone())
    }

    /// The open case an override review task (or a corrective copy of it)
    /// is deciding
    pub fn crisis_for_review(&self, review_task: &TaskId) -> Option<&CrisisCase> {
        let mut current = self.graph.get(review_task);
        while let Some(task) = current {
            if let Some(case) = self
                .crises
                .values()
                .find(|c| c.is_open() && c.review_task.as_ref() == Some(&task.id))
            {
                return Some(case);
            }
            current = task.supersedes.as_ref().and_then(|s| self.graph.get(s));
        }
        None
    }

    pub fn strikes(&self, role: &RoleId) -> u32 {
        self.authority_strikes.get(role).copied().unwrap_or(0)
    }

    /// Count of tasks per status, for status displays
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for task in self.graph.tasks() {
            *counts.entry(task.status.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

fn task_of(event: &AuditEvent) -> Result<TaskId, ReplayError> {
    event.task_id.clone().ok_or(ReplayError::MissingField {
        sequence: event.sequence,
        field: "task_id",
    })
}

fn move_crisis(seq: u64, case: &mut CrisisCase, to: CrisisStatus) -> Result<(), ReplayError> {
    use CrisisStatus::*;
    let allowed = matches!(
        (case.status, to),
        (Open, Voting)
            | (Open, OverrideReview)
            | (Open, Resolved)
            | (Voting, OverrideReview)
            | (Voting, Resolved)
            | (OverrideReview, Overridden)
            | (OverrideReview, Resolved)
    );
    if !allowed {
        return Err(ReplayError::IllegalCrisisTransition {
            sequence: seq,
            crisis: case.id.clone(),
            from: case.status,
            to,
        });
    }
    case.status = to;
    Ok(())
}

fn crisis_ordinal(id: &CrisisId) -> u64 {
    id.0.rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}
