//! Work handed from the engine to worker units, and what comes back

use crate::{CrisisCase, ExecutionOutput, Phase, RoleId, Task, TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Read-only view of the task a reviewer judges
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubjectView {
    pub task_id: TaskId,
    pub phase: Phase,
    pub owner: RoleId,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
}

impl From<&Task> for SubjectView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            phase: task.phase,
            owner: task.owner.clone(),
            payload: task.payload.clone(),
            result: task.result.clone(),
        }
    }
}

/// Everything an executor may look at besides the payload
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub parent: Option<TaskId>,
    /// Reasons from earlier rejected attempts
    #[serde(default)]
    pub feedback: Vec<String>,
    #[serde(default)]
    pub subject: Option<SubjectView>,
    /// Results of accepted dependencies
    #[serde(default)]
    pub inputs: BTreeMap<TaskId, serde_json::Value>,
    /// For override reviews: the case being decided
    #[serde(default)]
    pub crisis: Option<CrisisCase>,
}

/// One execution attempt of one task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
    pub attempt: u32,
    pub role: RoleId,
    pub phase: Phase,
    pub payload: serde_json::Value,
    pub context: TaskContext,
    pub deadline: DateTime<Utc>,
}

/// Ask one eligible role for its ballot on a crisis case
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BallotRequest {
    pub workflow_id: WorkflowId,
    pub role: RoleId,
    pub case: CrisisCase,
    pub deadline: DateTime<Utc>,
}

/// Work the engine wants a worker unit to perform
#[derive(Clone, Debug, PartialEq)]
pub enum Dispatch {
    Execute(TaskInvocation),
    Deliberate(BallotRequest),
}

/// Why an execution attempt produced no output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionFailure {
    Timeout,
    Provider(String),
    Cancelled,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionFailure::Timeout => write!(f, "deadline exceeded"),
            ExecutionFailure::Provider(msg) => write!(f, "provider error: {}", msg),
            ExecutionFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded(ExecutionOutput),
    Failed(ExecutionFailure),
}
