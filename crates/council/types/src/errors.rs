//! Error types for the council layer

use crate::{CrisisId, CrisisStatus, RegistryError, RoleId, TaskId, TaskStatus, WorkflowId};

/// Errors that can occur in council operations
#[derive(Clone, Debug, thiserror::Error)]
pub enum CouncilError {
    #[error("Authority error: {role} may not {action}")]
    Authority { role: RoleId, action: String },

    #[error("Delegation would create a cycle: {0:?}")]
    Cycle(Vec<TaskId>),

    #[error("Task {task} timed out after {attempts} attempt(s)")]
    Timeout { task: TaskId, attempts: u32 },

    #[error("Validation failed for {task}: {}", .reasons.join("; "))]
    ValidationFailure { task: TaskId, reasons: Vec<String> },

    #[error("Crisis {crisis} unresolved: {reason}")]
    CrisisUnresolved { crisis: CrisisId, reason: String },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Workflow {0} is closed")]
    WorkflowClosed(WorkflowId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Invalid delegation: {0}")]
    InvalidDelegation(String),

    #[error("Phase ordering violated: {0} has no accepted validate-phase descendant")]
    PhaseOrdering(TaskId),

    #[error("Role {role} may not validate its own task {task}")]
    SelfValidation { task: TaskId, role: RoleId },

    #[error("Crisis not found: {0}")]
    CrisisNotFound(CrisisId),

    #[error("Crisis {0} is closed")]
    CrisisClosed(CrisisId),

    #[error("Crisis {crisis} is {status:?}")]
    CrisisState { crisis: CrisisId, status: CrisisStatus },

    #[error("Role {role} is not eligible to vote on {crisis}")]
    NotEligible { crisis: CrisisId, role: RoleId },

    #[error("Role {role} already voted on {crisis}")]
    DuplicateBallot { crisis: CrisisId, role: RoleId },

    #[error("Invalid override: {0}")]
    InvalidOverride(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Replay error: {0}")]
    Replay(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Runtime unavailable: {0}")]
    Unavailable(String),
}

impl CouncilError {
    pub fn authority(role: &RoleId, action: impl Into<String>) -> Self {
        CouncilError::Authority {
            role: role.clone(),
            action: action.into(),
        }
    }

    pub fn is_authority(&self) -> bool {
        matches!(self, CouncilError::Authority { .. })
    }
}

/// Result type for council operations
pub type CouncilResult<T> = Result<T, CouncilError>;
