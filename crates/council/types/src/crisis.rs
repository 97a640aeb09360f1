//! Crisis cases, motions, ballots and overrides
//!
//! A crisis case moves `open -> voting -> resolved` or
//! `open -> override_review -> overridden`. A failed vote either hands the
//! case to the Overseer or resolves it as `motion_failed`, depending on
//! policy. Closed cases never reopen; a later case on the same task links
//! back through `supersedes`.

use crate::{CrisisId, RoleId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrisisKind {
    Deadlock,
    AuthorityViolation,
    RepeatedValidationFailure,
    NoConfidence,
}

impl fmt::Display for CrisisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrisisKind::Deadlock => "deadlock",
            CrisisKind::AuthorityViolation => "authority_violation",
            CrisisKind::RepeatedValidationFailure => "repeated_validation_failure",
            CrisisKind::NoConfidence => "no_confidence",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Minor => "minor",
            Severity::Major => "major",
            Severity::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrisisStatus {
    Open,
    Voting,
    OverrideReview,
    Resolved,
    Overridden,
}

impl CrisisStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CrisisStatus::Resolved | CrisisStatus::Overridden)
    }
}

/// Whether the failure that led here was a judgement or an infrastructure
/// fault (timeouts, provider errors)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    Substantive,
    Infrastructure,
}

/// What a passing vote does
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "motion", rename_all = "snake_case")]
pub enum Motion {
    /// Give the task a fresh corrective copy
    RetryTask { task: TaskId },
    /// Bar a role from the workflow and hand its open work to `replacement`
    ExcludeRole { role: RoleId, replacement: RoleId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ballot {
    Support,
    Oppose,
    Abstain,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub crisis_id: CrisisId,
    pub role: RoleId,
    pub ballot: Ballot,
    pub timestamp: DateTime<Utc>,
}

/// Counted ballots. Once the vote is closed, missing ballots are included
/// in `oppose`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub eligible: u32,
    pub support: u32,
    pub oppose: u32,
    pub abstain: u32,
    pub missing: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    Pending,
    Passed,
    Failed,
}

/// Reserve actions available to the Overseer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    ForceAccept,
    ForceReject,
    Reassign { role: RoleId },
    AbortWorkflow,
}

impl fmt::Display for OverrideAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverrideAction::ForceAccept => write!(f, "force_accept"),
            OverrideAction::ForceReject => write!(f, "force_reject"),
            OverrideAction::Reassign { role } => write!(f, "reassign to {}", role),
            OverrideAction::AbortWorkflow => write!(f, "abort_workflow"),
        }
    }
}

/// The result an `OverseeReview` task returns
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideDecision {
    pub action: OverrideAction,
    pub justification: String,
}

impl OverrideDecision {
    pub fn new(action: OverrideAction, justification: impl Into<String>) -> Self {
        Self {
            action,
            justification: justification.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum CrisisResolution {
    AutoRetried,
    MotionCarried,
    MotionFailed,
    Overridden { action: OverrideAction },
    Unresolved { reason: String },
    Withdrawn { reason: String },
}

/// An escalation on one task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrisisCase {
    pub id: CrisisId,
    pub task_id: TaskId,
    pub kind: CrisisKind,
    pub severity: Severity,
    pub origin: FailureOrigin,
    #[serde(default)]
    pub disputed_role: Option<RoleId>,
    #[serde(default)]
    pub motion: Option<Motion>,
    pub status: CrisisStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub eligible_voters: BTreeSet<RoleId>,
    #[serde(default)]
    pub ballots: Vec<Vote>,
    #[serde(default)]
    pub vote_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tally: Option<VoteTally>,
    #[serde(default)]
    pub outcome: Option<VoteOutcome>,
    /// The `OverseeReview` task deciding this case
    #[serde(default)]
    pub review_task: Option<TaskId>,
    #[serde(default)]
    pub resolution: Option<CrisisResolution>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub supersedes: Option<CrisisId>,
    #[serde(default)]
    pub detail: String,
}

impl CrisisCase {
    pub fn new(
        id: CrisisId,
        task_id: TaskId,
        kind: CrisisKind,
        severity: Severity,
        origin: FailureOrigin,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id,
            kind,
            severity,
            origin,
            disputed_role: None,
            motion: None,
            status: CrisisStatus::Open,
            opened_at,
            eligible_voters: BTreeSet::new(),
            ballots: Vec::new(),
            vote_deadline: None,
            tally: None,
            outcome: None,
            review_task: None,
            resolution: None,
            closed_at: None,
            supersedes: None,
            detail: String::new(),
        }
    }

    pub fn with_disputed_role(mut self, role: Option<RoleId>) -> Self {
        self.disputed_role = role;
        self
    }

    pub fn with_motion(mut self, motion: Option<Motion>) -> Self {
        self.motion = motion;
        self
    }

    pub fn with_supersedes(mut self, previous: Option<CrisisId>) -> Self {
        self.supersedes = previous;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn ballot_of(&self, role: &RoleId) -> Option<Ballot> {
        self.ballots
            .iter()
            .find(|v| v.role == *role)
            .map(|v| v.ballot)
    }
}
