//! Tasks: phased units of work in a workflow graph

use crate::{AuthorityLevel, RoleId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The phase a task belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Planning: decompose work into further tasks
    Propose,
    /// Produce a result
    Implement,
    /// Judge another task's result
    Validate,
    /// Overseer decision on a crisis case
    OverseeReview,
}

impl Phase {
    /// Lowest authority a role needs to own a task in this phase
    pub fn minimum_authority(self) -> AuthorityLevel {
        match self {
            Phase::Propose => AuthorityLevel::Propose,
            Phase::Implement => AuthorityLevel::Implement,
            Phase::Validate => AuthorityLevel::Validate,
            Phase::OverseeReview => AuthorityLevel::Oversee,
        }
    }

    /// Review phases may point at a subject task
    pub fn is_review(self) -> bool {
        matches!(self, Phase::Validate | Phase::OverseeReview)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Propose => "propose",
            Phase::Implement => "implement",
            Phase::Validate => "validate",
            Phase::OverseeReview => "oversee_review",
        };
        write!(f, "{}", name)
    }
}

/// Task lifecycle status
///
/// ```text
/// Pending -> Ready -> Running -> AwaitingValidation -> Accepted
///                        |              |
///                        v              v
///                     Pending        Rejected / Escalated
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    AwaitingValidation,
    Accepted,
    Rejected,
    Escalated,
}

impl TaskStatus {
    /// Accepted and Rejected never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Accepted | TaskStatus::Rejected)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Rejected)
                | (Ready, Running)
                | (Ready, Pending)
                | (Ready, Rejected)
                | (Running, AwaitingValidation)
                | (Running, Pending)
                | (Running, Escalated)
                | (Running, Rejected)
                | (AwaitingValidation, Accepted)
                | (AwaitingValidation, Rejected)
                | (AwaitingValidation, Escalated)
                | (Escalated, Pending)
                | (Escalated, Accepted)
                | (Escalated, Rejected)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingValidation => "awaiting_validation",
            TaskStatus::Accepted => "accepted",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Escalated => "escalated",
        };
        write!(f, "{}", name)
    }
}

/// A node in the workflow graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub phase: Phase,
    pub owner: RoleId,
    /// Tasks that must be accepted before this one may run
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// For review tasks: the task whose result is being judged
    #[serde(default)]
    pub reviews: Option<TaskId>,
    pub status: TaskStatus,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Execution attempts started for this task
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Retry backoff: not runnable before this instant
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    /// Number of corrective copies preceding this task
    #[serde(default)]
    pub correction_round: u32,
    #[serde(default)]
    pub supersedes: Option<TaskId>,
    #[serde(default)]
    pub superseded_by: Option<TaskId>,
    /// Retired tasks were replaced by a corrective copy
    #[serde(default)]
    pub retired: bool,
    /// Validation feedback carried into corrective copies
    #[serde(default)]
    pub feedback: Vec<String>,
    #[serde(default)]
    pub status_reason: Option<String>,
    /// Creation order within the workflow (FIFO admission key)
    pub created_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: TaskId,
        created_seq: u64,
        phase: Phase,
        owner: RoleId,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            parent: None,
            phase,
            owner,
            dependencies: BTreeSet::new(),
            reviews: None,
            status: TaskStatus::Pending,
            payload,
            result: None,
            attempts: 0,
            deadline: None,
            not_before: None,
            correction_round: 0,
            supersedes: None,
            superseded_by: None,
            retired: false,
            feedback: Vec::new(),
            status_reason: None,
            created_seq,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_dependency(mut self, dependency: TaskId) -> Self {
        self.dependencies.insert(dependency);
        self
    }

    pub fn with_reviews(mut self, subject: TaskId) -> Self {
        self.reviews = Some(subject);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Still part of the live graph (not closed and not replaced)
    pub fn is_live(&self) -> bool {
        !self.retired && !self.status.is_terminal()
    }

    /// Escalated or rejected and not yet replaced by a corrective copy
    pub fn is_retryable(&self) -> bool {
        !self.retired && matches!(self.status, TaskStatus::Escalated | TaskStatus::Rejected)
    }
}
