//! The reasoning capability executors call into
//!
//! How a role produces its output is outside the council. A provider is
//! handed a role, a phase and a payload and answers with an output (plus
//! any sub-tasks it wants delegated) or an error. Ballots on crisis cases
//! are solicited through the same provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use council_types::{
    Ballot, CrisisCase, ExecutionFailure, ExecutionOutput, Phase, RoleId, TaskContext,
    TaskInvocation, TaskId, WorkflowId,
};
use tokio::sync::watch;

/// Errors a provider may report
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider timed out")]
    Timeout,

    #[error("Provider failed: {0}")]
    Failed(String),

    #[error("Invocation cancelled")]
    Cancelled,
}

pub type ProviderResult<T> = Result<T, ProviderError>;

impl From<ProviderError> for ExecutionFailure {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout => ExecutionFailure::Timeout,
            ProviderError::Failed(msg) => ExecutionFailure::Provider(msg),
            ProviderError::Cancelled => ExecutionFailure::Cancelled,
        }
    }
}

/// What an invocation may know about the task it serves
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
    pub task: TaskContext,
    cancel: watch::Receiver<bool>,
}

impl InvocationContext {
    pub fn new(invocation: &TaskInvocation, cancel: watch::Receiver<bool>) -> Self {
        Self {
            workflow_id: invocation.workflow_id.clone(),
            task_id: invocation.task_id.clone(),
            attempt: invocation.attempt,
            deadline: invocation.deadline,
            task: invocation.context.clone(),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the attempt has been cancelled. Never resolves if the
    /// orchestrator dropped the signal without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        loop {
            let cancelled = *rx.borrow_and_update();
            if cancelled {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Opaque reasoning capability used by worker units
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    /// Run one task body
    async fn invoke(
        &self,
        role: &RoleId,
        phase: Phase,
        payload: &serde_json::Value,
        ctx: &InvocationContext,
    ) -> ProviderResult<ExecutionOutput>;

    /// Ask `role` for its ballot on a crisis case
    async fn deliberate(&self, role: &RoleId, case: &CrisisCase) -> ProviderResult<Ballot>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation() -> TaskInvocation {
        TaskInvocation {
            workflow_id: WorkflowId::new("wf"),
            task_id: TaskId::sequential(1),
            attempt: 2,
            role: RoleId::new("planner"),
            phase: Phase::Propose,
            payload: json!(null),
            context: TaskContext::default(),
            deadline: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_cancel_signal_reaches_context() {
        let (tx, rx) = watch::channel(false);
        let ctx = InvocationContext::new(&invocation(), rx);
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.attempt, 2);

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), ctx.cancelled())
            .await
            .unwrap();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_provider_errors_map_to_failures() {
        assert_eq!(ExecutionFailure::from(ProviderError::Timeout), ExecutionFailure::Timeout);
        assert_eq!(
            ExecutionFailure::from(ProviderError::Failed("quota".into())),
            ExecutionFailure::Provider("quota".into())
        );
    }
}
