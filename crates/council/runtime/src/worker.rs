//! Worker units
//!
//! Each dispatch runs in its own spawned task and reports back through the
//! completion queue. Workers never touch workflow state.

use crate::provider::{InvocationContext, ProviderError, ReasoningProvider};
use chrono::{DateTime, Utc};
use council_types::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// What a worker reports when it finishes
#[derive(Debug, Clone)]
pub enum Completion {
    Task {
        workflow_id: WorkflowId,
        task_id: TaskId,
        attempt: u32,
        outcome: ExecutionOutcome,
    },
    Ballot {
        workflow_id: WorkflowId,
        crisis_id: CrisisId,
        role: RoleId,
        ballot: Ballot,
    },
}

fn remaining(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Run one execution attempt, bounded by its deadline and the cancel signal
pub async fn execute(
    provider: Arc<dyn ReasoningProvider>,
    invocation: TaskInvocation,
    cancel: watch::Receiver<bool>,
) -> ExecutionOutcome {
    let ctx = InvocationContext::new(&invocation, cancel);
    let budget = remaining(invocation.deadline);

    let result = tokio::select! {
        _ = ctx.cancelled() => Err(ProviderError::Cancelled),
        res = tokio::time::timeout(
            budget,
            provider.invoke(&invocation.role, invocation.phase, &invocation.payload, &ctx),
        ) => res.unwrap_or(Err(ProviderError::Timeout)),
    };

    match result {
        Ok(output) => ExecutionOutcome::Succeeded(output),
        Err(err) => {
            tracing::debug!(
                workflow_id = %invocation.workflow_id,
                task_id = %invocation.task_id,
                attempt = invocation.attempt,
                error = %err,
                "Execution attempt failed"
            );
            ExecutionOutcome::Failed(err.into())
        }
    }
}

/// Spawn an execution attempt that reports into `completions`
pub fn spawn_execution(
    provider: Arc<dyn ReasoningProvider>,
    invocation: TaskInvocation,
    cancel: watch::Receiver<bool>,
    completions: mpsc::UnboundedSender<Completion>,
) {
    tokio::spawn(async move {
        let workflow_id = invocation.workflow_id.clone();
        let task_id = invocation.task_id.clone();
        let attempt = invocation.attempt;
        let outcome = execute(provider, invocation, cancel).await;
        // The orchestrator may already be gone during shutdown
        let _ = completions.send(Completion::Task {
            workflow_id,
            task_id,
            attempt,
            outcome,
        });
    });
}

/// Spawn a ballot solicitation. No ballot is reported if the provider
/// fails or the vote deadline passes first; the vote closes without it.
pub fn spawn_deliberation(
    provider: Arc<dyn ReasoningProvider>,
    request: BallotRequest,
    completions: mpsc::UnboundedSender<Completion>,
) {
    tokio::spawn(async move {
        let budget = remaining(request.deadline);
        match tokio::time::timeout(budget, provider.deliberate(&request.role, &request.case)).await {
            Ok(Ok(ballot)) => {
                let _ = completions.send(Completion::Ballot {
                    workflow_id: request.workflow_id,
                    crisis_id: request.case.id,
                    role: request.role,
                    ballot,
                });
            }
            Ok(Err(err)) => tracing::warn!(
                workflow_id = %request.workflow_id,
                crisis_id = %request.case.id,
                role = %request.role,
                error = %err,
                "Ballot solicitation failed"
            ),
            Err(_) => tracing::warn!(
                workflow_id = %request.workflow_id,
                crisis_id = %request.case.id,
                role = %request.role,
                "Ballot solicitation timed out"
            ),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{ScriptStep, ScriptedProvider};
    use serde_json::json;

    fn invocation(timeout: chrono::Duration) -> TaskInvocation {
        TaskInvocation {
            workflow_id: WorkflowId::new("wf"),
            task_id: TaskId::sequential(2),
            attempt: 1,
            role: RoleId::new("implementer"),
            phase: Phase::Implement,
            payload: json!({"draft": true}),
            context: TaskContext::default(),
            deadline: Utc::now() + timeout,
        }
    }

    #[tokio::test]
    async fn test_execute_returns_output() {
        let provider = Arc::new(ScriptedProvider::new().on(
            "implementer",
            Phase::Implement,
            ScriptStep::output(ExecutionOutput::new(json!("body"))),
        ));
        let (_tx, rx) = watch::channel(false);
        let outcome = execute(provider, invocation(chrono::Duration::seconds(5)), rx).await;
        assert_eq!(outcome, ExecutionOutcome::Succeeded(ExecutionOutput::new(json!("body"))));
    }

    #[tokio::test]
    async fn test_execute_times_out_at_deadline() {
        let provider = Arc::new(ScriptedProvider::new().on(
            "implementer",
            Phase::Implement,
            ScriptStep::default().after(Duration::from_secs(10)),
        ));
        let (_tx, rx) = watch::channel(false);
        let outcome = execute(provider, invocation(chrono::Duration::milliseconds(50)), rx).await;
        assert_eq!(outcome, ExecutionOutcome::Failed(ExecutionFailure::Timeout));
    }

    #[tokio::test]
    async fn test_execute_reports_provider_error() {
        let provider = Arc::new(ScriptedProvider::new().on(
            "implementer",
            Phase::Implement,
            ScriptStep::error("model unavailable"),
        ));
        let (_tx, rx) = watch::channel(false);
        let outcome = execute(provider, invocation(chrono::Duration::seconds(5)), rx).await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Failed(ExecutionFailure::Provider("model unavailable".into()))
        );
    }

    #[tokio::test]
    async fn test_spawned_execution_reports_cancellation() {
        let provider = Arc::new(ScriptedProvider::new().on(
            "implementer",
            Phase::Implement,
            ScriptStep::default().after(Duration::from_secs(10)),
        ));
        let (tx, rx) = watch::channel(false);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        spawn_execution(provider, invocation(chrono::Duration::seconds(30)), rx, done_tx);
        tx.send(true).unwrap();

        match done_rx.recv().await.unwrap() {
            Completion::Task { outcome, attempt, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(outcome, ExecutionOutcome::Failed(ExecutionFailure::Cancelled));
            }
            other => panic!("unexpected completion {:?}", other),
        }
    }
}
