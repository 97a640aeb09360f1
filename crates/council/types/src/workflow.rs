//! Workflow lifecycle status

use crate::{CrisisId, TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    /// Every task terminal and every live task accepted
    Completed,
    Failed,
    Cancelled,
    /// Ended by an Overseer override
    Aborted,
}

impl WorkflowStatus {
    pub fn is_closed(self) -> bool {
        !matches!(self, WorkflowStatus::Active)
    }

    /// Reason stamped on tasks swept up when the workflow closes early
    pub fn sweep_reason(self) -> &'static str {
        match self {
            WorkflowStatus::Cancelled => "workflow_cancelled",
            WorkflowStatus::Aborted => "workflow_aborted",
            WorkflowStatus::Failed => "workflow_failed",
            WorkflowStatus::Active | WorkflowStatus::Completed => "workflow_closed",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Active => "active",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// Point-in-time view of a workflow for status queries
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub closing_reason: Option<String>,
    pub root: TaskId,
    /// Result of the root task (or its latest corrective copy) once it has one
    #[serde(default)]
    pub root_result: Option<serde_json::Value>,
    /// Task count per status name
    pub tasks: BTreeMap<String, usize>,
    #[serde(default)]
    pub open_crises: Vec<CrisisId>,
    #[serde(default)]
    pub unresolved_crisis: Option<CrisisId>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
