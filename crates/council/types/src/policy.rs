//! Council policy: budgets, timeouts and voting rules

use crate::{CrisisKind, RoleId, Severity};
use serde::{Deserialize, Serialize};

/// All tunables of a workflow engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilPolicy {
    /// Role that owns the root task of every workflow
    #[serde(default = "default_entry_role")]
    pub entry_role: RoleId,

    #[serde(default)]
    pub scheduler: SchedulerPolicy,

    #[serde(default)]
    pub validation: ValidationPolicy,

    #[serde(default)]
    pub crisis: CrisisPolicy,
}

impl Default for CouncilPolicy {
    fn default() -> Self {
        Self {
            entry_role: default_entry_role(),
            scheduler: SchedulerPolicy::default(),
            validation: ValidationPolicy::default(),
            crisis: CrisisPolicy::default(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerPolicy {
    /// Maximum tasks running at once (N)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Deadline for one execution attempt
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Attempts before an infrastructure crisis opens
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Orchestrator tick period
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            task_timeout_ms: default_task_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl SchedulerPolicy {
    /// `base * 2^attempt`, capped
    pub fn backoff(&self, attempt: u32) -> chrono::Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_cap_ms)
            .min(i64::MAX as u64);
        chrono::Duration::milliseconds(ms as i64)
    }

    pub fn task_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.task_timeout_ms.min(i64::MAX as u64) as i64)
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Validation gate configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationPolicy {
    /// Corrective copies allowed per task before a crisis opens
    #[serde(default = "default_max_corrections")]
    pub max_corrections: u32,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_corrections: default_max_corrections(),
        }
    }
}

/// How a tied or near-tied vote is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MajorityRule {
    /// The motion fails only when opposing ballots are a strict majority
    #[default]
    Strict,
    /// The motion fails when opposing ballots are at least half
    AtLeastHalf,
}

/// Severity assigned to each crisis kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityPolicy {
    #[serde(default = "default_critical")]
    pub deadlock: Severity,

    #[serde(default = "default_major")]
    pub authority_violation: Severity,

    #[serde(default = "default_major")]
    pub repeated_validation_failure: Severity,

    #[serde(default = "default_major")]
    pub no_confidence: Severity,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            deadlock: Severity::Critical,
            authority_violation: Severity::Major,
            repeated_validation_failure: Severity::Major,
            no_confidence: Severity::Major,
        }
    }
}

/// Crisis manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisPolicy {
    #[serde(default = "default_vote_timeout_ms")]
    pub vote_timeout_ms: u64,

    #[serde(default)]
    pub majority: MajorityRule,

    /// Cases at or above this severity skip the vote
    #[serde(default = "default_critical")]
    pub override_threshold: Severity,

    /// Hand a failed vote to the Overseer instead of closing the case
    /// as `motion_failed`
    #[serde(default)]
    pub override_on_vote_failure: bool,

    /// Refused delegations before an authority violation case opens
    #[serde(default = "default_authority_strike_limit")]
    pub authority_strike_limit: u32,

    #[serde(default)]
    pub severity: SeverityPolicy,
}

impl Default for CrisisPolicy {
    fn default() -> Self {
        Self {
            vote_timeout_ms: default_vote_timeout_ms(),
            majority: MajorityRule::Strict,
            override_threshold: Severity::Critical,
            override_on_vote_failure: false,
            authority_strike_limit: default_authority_strike_limit(),
            severity: SeverityPolicy::default(),
        }
    }
}

impl CrisisPolicy {
    pub fn severity_for(&self, kind: CrisisKind) -> Severity {
        match kind {
            CrisisKind::Deadlock => self.severity.deadlock,
            CrisisKind::AuthorityViolation => self.severity.authority_violation,
            CrisisKind::RepeatedValidationFailure => self.severity.repeated_validation_failure,
            CrisisKind::NoConfidence => self.severity.no_confidence,
        }
    }

    pub fn vote_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.vote_timeout_ms.min(i64::MAX as u64) as i64)
    }
}

// Default value helpers
fn default_entry_role() -> RoleId {
    RoleId::new("planner")
}

fn default_max_concurrency() -> usize {
    8
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_tick_interval_ms() -> u64 {
    250
}

fn default_max_corrections() -> u32 {
    2
}

fn default_vote_timeout_ms() -> u64 {
    120_000
}

fn default_authority_strike_limit() -> u32 {
    2
}

fn default_critical() -> Severity {
    Severity::Critical
}

fn default_major() -> Severity {
    Severity::Major
}
