//! Scripted provider
//!
//! Replays canned outputs per `(role, phase)` in order. Used by the daemon's
//! `run` command and by tests. When a role's script runs out the provider
//! falls back to a neutral answer for the phase.

use crate::provider::{InvocationContext, ProviderError, ProviderResult, ReasoningProvider};
use async_trait::async_trait;
use council_types::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

/// One canned answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptStep {
    /// Simulated work time before answering
    #[serde(default)]
    pub delay_ms: u64,

    #[serde(default)]
    pub result: serde_json::Value,

    #[serde(default)]
    pub delegations: Vec<DelegationRequest>,

    /// Answer with a provider error instead of a result
    #[serde(default)]
    pub error: Option<String>,
}

impl ScriptStep {
    pub fn output(output: ExecutionOutput) -> Self {
        Self {
            result: output.result,
            delegations: output.delegations,
            ..Default::default()
        }
    }

    pub fn verdict(report: VerdictReport) -> Self {
        Self::output(ExecutionOutput::new(report.to_value()))
    }

    pub fn decision(decision: &OverrideDecision) -> Self {
        Self::output(ExecutionOutput::new(
            serde_json::to_value(decision).unwrap_or_default(),
        ))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
        self
    }
}

/// A step bound to the role and phase that consumes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleStep {
    pub role: RoleId,
    pub phase: Phase,
    #[serde(flatten)]
    pub step: ScriptStep,
}

/// File form of a script
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub steps: Vec<RoleStep>,

    /// Ballot each role casts on every crisis
    #[serde(default)]
    pub ballots: BTreeMap<RoleId, Ballot>,
}

/// A call the provider answered, for inspection in tests
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub role: RoleId,
    pub phase: Phase,
    pub task_id: TaskId,
    pub attempt: u32,
}

pub struct ScriptedProvider {
    steps: Mutex<HashMap<(RoleId, Phase), VecDeque<ScriptStep>>>,
    ballots: BTreeMap<RoleId, Ballot>,
    default_ballot: Ballot,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(HashMap::new()),
            ballots: BTreeMap::new(),
            default_ballot: Ballot::Support,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn from_script(script: Script) -> Self {
        let provider = Self {
            ballots: script.ballots,
            ..Self::new()
        };
        for entry in script.steps {
            provider.push(entry.role, entry.phase, entry.step);
        }
        provider
    }

    /// Queue `step` as the next answer for `role` in `phase`
    pub fn on(self, role: impl Into<String>, phase: Phase, step: ScriptStep) -> Self {
        self.push(RoleId::new(role), phase, step);
        self
    }

    pub fn ballot(mut self, role: impl Into<String>, ballot: Ballot) -> Self {
        self.ballots.insert(RoleId::new(role), ballot);
        self
    }

    pub fn with_default_ballot(mut self, ballot: Ballot) -> Self {
        self.default_ballot = ballot;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    fn push(&self, role: RoleId, phase: Phase, step: ScriptStep) {
        self.steps
            .lock()
            .entry((role, phase))
            .or_default()
            .push_back(step);
    }

    fn next_step(&self, role: &RoleId, phase: Phase) -> Option<ScriptStep> {
        self.steps
            .lock()
            .get_mut(&(role.clone(), phase))
            .and_then(|queue| queue.pop_front())
    }

    /// Answer for a phase whose script is exhausted
    fn fallback(phase: Phase) -> ScriptStep {
        match phase {
            Phase::Validate => ScriptStep::verdict(VerdictReport::pass()),
            Phase::OverseeReview => ScriptStep::error("no override decision scripted"),
            Phase::Propose | Phase::Implement => ScriptStep::default(),
        }
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReasoningProvider for ScriptedProvider {
    async fn invoke(
        &self,
        role: &RoleId,
        phase: Phase,
        _payload: &serde_json::Value,
        ctx: &InvocationContext,
    ) -> ProviderResult<ExecutionOutput> {
        self.calls.lock().push(RecordedCall {
            role: role.clone(),
            phase,
            task_id: ctx.task_id.clone(),
            attempt: ctx.attempt,
        });
        let step = self
            .next_step(role, phase)
            .unwrap_or_else(|| Self::fallback(phase));

        if step.delay_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(step.delay_ms)) => {}
                _ = ctx.cancelled() => return Err(ProviderError::Cancelled),
            }
        }
        if let Some(error) = step.error {
            return Err(ProviderError::Failed(error));
        }
        Ok(ExecutionOutput {
            result: step.result,
            delegations: step.delegations,
        })
    }

    async fn deliberate(&self, role: &RoleId, _case: &CrisisCase) -> ProviderResult<Ballot> {
        Ok(self.ballots.get(role).copied().unwrap_or(self.default_ballot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::watch;

    fn ctx(cancel: watch::Receiver<bool>) -> InvocationContext {
        let invocation = TaskInvocation {
            workflow_id: WorkflowId::new("wf"),
            task_id: TaskId::sequential(3),
            attempt: 1,
            role: RoleId::new("implementer"),
            phase: Phase::Implement,
            payload: json!(null),
            context: TaskContext::default(),
            deadline: Utc::now(),
        };
        InvocationContext::new(&invocation, cancel)
    }

    #[tokio::test]
    async fn test_steps_replay_in_order_then_fall_back() {
        let provider = ScriptedProvider::new()
            .on("implementer", Phase::Implement, ScriptStep::output(ExecutionOutput::new(json!("first"))))
            .on("implementer", Phase::Implement, ScriptStep::error("quota exceeded"));
        let (_tx, rx) = watch::channel(false);
        let role = RoleId::new("implementer");

        let first = provider.invoke(&role, Phase::Implement, &json!(null), &ctx(rx.clone())).await.unwrap();
        assert_eq!(first.result, json!("first"));
        let second = provider.invoke(&role, Phase::Implement, &json!(null), &ctx(rx.clone())).await;
        assert_eq!(second, Err(ProviderError::Failed("quota exceeded".into())));
        let third = provider.invoke(&role, Phase::Implement, &json!(null), &ctx(rx)).await.unwrap();
        assert_eq!(third.result, serde_json::Value::Null);
        assert_eq!(provider.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_fallback_validator_passes() {
        let provider = ScriptedProvider::new();
        let (_tx, rx) = watch::channel(false);
        let output = provider
            .invoke(&RoleId::new("validator"), Phase::Validate, &json!(null), &ctx(rx))
            .await
            .unwrap();
        assert_eq!(VerdictReport::from_result(&output.result).unwrap().verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_delay_is_cancellable() {
        let provider = ScriptedProvider::new().on(
            "implementer",
            Phase::Implement,
            ScriptStep::default().after(Duration::from_secs(30)),
        );
        let (tx, rx) = watch::channel(false);
        let context = ctx(rx);
        let role = RoleId::new("implementer");
        let payload = json!(null);
        let call = provider.invoke(&role, Phase::Implement, &payload, &context);
        tx.send(true).unwrap();
        assert_eq!(call.await, Err(ProviderError::Cancelled));
    }

    #[test]
    fn test_script_file_parses() {
        let script: Script = serde_json::from_value(json!({
            "steps": [
                {"role": "planner", "phase": "propose", "result": "plan",
                 "delegations": [{"target_role": "implementer", "phase": "implement"}]},
                {"role": "validator", "phase": "validate", "delay_ms": 20,
                 "result": {"verdict": "fail", "reasons": ["thin"]}}
            ],
            "ballots": {"overseer": "oppose"}
        }))
        .unwrap();
        assert_eq!(script.steps.len(), 2);
        assert_eq!(script.steps[0].step.delegations.len(), 1);
        assert_eq!(script.steps[1].step.delay_ms, 20);
        assert_eq!(script.ballots.get(&RoleId::new("overseer")), Some(&Ballot::Oppose));
    }
}
