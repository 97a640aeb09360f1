//! Validation records and verdict reports

use crate::{RoleId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason prefix for failures caused by the gate itself rather than the
/// validating role's judgement
pub const GATE_ERROR: &str = "gate_error";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Fail => write!(f, "fail"),
        }
    }
}

/// One verdict on one task. Records for a task are totally ordered by
/// `sequence`; the highest is the active one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub sequence: u64,
    pub task_id: TaskId,
    pub validating_role: RoleId,
    pub verdict: Verdict,
    #[serde(default)]
    pub reasons: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationRecord {
    pub fn is_pass(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    pub fn is_gate_error(&self) -> bool {
        self.reasons.iter().any(|r| r.starts_with(GATE_ERROR))
    }
}

/// What a `Validate` task returns as its result
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictReport {
    pub verdict: Verdict,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl VerdictReport {
    pub fn pass() -> Self {
        Self {
            verdict: Verdict::Pass,
            reasons: Vec::new(),
        }
    }

    pub fn fail(reasons: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            verdict: Verdict::Fail,
            reasons: reasons.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a reviewer's result payload
    pub fn from_result(result: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(result)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "verdict": self.verdict, "reasons": self.reasons })
    }
}
