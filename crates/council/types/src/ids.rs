//! Identifiers
//!
//! Workflow ids are random. Task and crisis ids are allocated from
//! per-workflow counters so that replaying the same events always yields the
//! same ids.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a workflow
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a task within its workflow
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id for the `seq`-th task created in a workflow
    pub fn sequential(seq: u64) -> Self {
        Self(format!("task-{:04}", seq))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a crisis case within its workflow
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CrisisId(pub String);

impl CrisisId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn sequential(seq: u64) -> Self {
        Self(format!("crisis-{:03}", seq))
    }
}

impl fmt::Display for CrisisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a role in the registry
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleId(pub String);

impl RoleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids_sort_by_creation() {
        let ids: Vec<TaskId> = (1..=12).map(TaskId::sequential).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(TaskId::sequential(7).to_string(), "task-0007");
        assert_eq!(CrisisId::sequential(2).to_string(), "crisis-002");
    }

    #[test]
    fn test_workflow_ids_are_unique() {
        assert_ne!(WorkflowId::generate(), WorkflowId::generate());
    }
}
