//! Delegation requests and executor output

use crate::{Phase, RoleId, TaskId};
use serde::{Deserialize, Serialize};

/// Reference to a task from inside a delegation batch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyRef {
    /// Another request in the same batch, by index
    Sibling(usize),
    /// A task that already exists
    Task(TaskId),
}

/// Ask for a new sub-task under the requesting task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub target_role: RoleId,
    pub phase: Phase,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Tasks the new task waits on
    #[serde(default)]
    pub depends_on: Vec<DependencyRef>,
    /// Waiting tasks that must also wait on the new task
    #[serde(default)]
    pub required_by: Vec<DependencyRef>,
    /// Review phases only: the task whose result is judged
    #[serde(default)]
    pub reviews: Option<DependencyRef>,
}

impl DelegationRequest {
    pub fn new(target_role: impl Into<String>, phase: Phase) -> Self {
        Self {
            target_role: RoleId::new(target_role),
            phase,
            payload: serde_json::Value::Null,
            depends_on: Vec::new(),
            required_by: Vec::new(),
            reviews: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn depends_on(mut self, dependency: DependencyRef) -> Self {
        self.depends_on.push(dependency);
        self
    }

    pub fn required_by(mut self, waiting: DependencyRef) -> Self {
        self.required_by.push(waiting);
        self
    }

    pub fn reviewing(mut self, subject: DependencyRef) -> Self {
        self.reviews = Some(subject);
        self
    }
}

/// What an executor returns for a task: its result plus any sub-tasks it
/// wants created
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub delegations: Vec<DelegationRequest>,
}

impl ExecutionOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            delegations: Vec::new(),
        }
    }

    pub fn with_delegation(mut self, request: DelegationRequest) -> Self {
        self.delegations.push(request);
        self
    }
}
