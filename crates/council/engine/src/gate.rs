//! Validation gate
//!
//! A task leaves `AwaitingValidation` only through here. The gate records
//! each verdict before acting on it, refuses self-validation, and holds
//! implementations back until a validate-phase task below them has been
//! accepted.

use crate::{EventDraft, Journal};
use chrono::{DateTime, Utc};
use council_types::*;
use std::sync::Arc;

/// Where a verdict sent its task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    Accepted,
    /// Correction budget remains; a corrective copy should follow
    Rejected,
    /// Correction budget spent; a crisis should follow
    Escalated,
}

#[derive(Clone, Debug)]
pub struct ValidationGate {
    registry: Arc<RoleRegistry>,
    policy: ValidationPolicy,
}

impl ValidationGate {
    pub fn new(registry: Arc<RoleRegistry>, policy: ValidationPolicy) -> Self {
        Self { registry, policy }
    }

    /// Record a verdict on `task_id` and move the task accordingly
    pub fn validate(
        &self,
        journal: &mut Journal,
        task_id: &TaskId,
        role: &RoleId,
        verdict: Verdict,
        reasons: Vec<String>,
        at: DateTime<Utc>,
    ) -> CouncilResult<(ValidationRecord, GateOutcome)> {
        let state = journal.state();
        let task = state
            .task(task_id)
            .ok_or_else(|| CouncilError::TaskNotFound(task_id.clone()))?;
        if task.status != TaskStatus::AwaitingValidation {
            return Err(CouncilError::InvalidTransition {
                task: task_id.clone(),
                from: task.status,
                to: match verdict {
                    Verdict::Pass => TaskStatus::Accepted,
                    Verdict::Fail => TaskStatus::Rejected,
                },
            });
        }
        if task.owner == *role {
            let err = CouncilError::SelfValidation {
                task: task_id.clone(),
                role: role.clone(),
            };
            self.record_refusal(journal, task_id, role, &err, at)?;
            return Err(err);
        }
        if !self
            .registry
            .authority_of(role)
            .is_some_and(|a| a.can_validate())
        {
            let err = CouncilError::authority(role, format!("validate {}", task_id));
            self.record_refusal(journal, task_id, role, &err, at)?;
            return Err(err);
        }

        let phase_ordering_holds = task.phase != Phase::Implement
            || state.graph.has_accepted_descendant(task_id, Phase::Validate);
        let correction_round = task.correction_round;

        let (verdict, reasons) = if verdict == Verdict::Pass && !phase_ordering_holds {
            (
                Verdict::Fail,
                vec![format!(
                    "{}: phase ordering, {} has no accepted validate-phase descendant",
                    GATE_ERROR, task_id
                )],
            )
        } else {
            (verdict, reasons)
        };

        let record = ValidationRecord {
            sequence: state.next_validation_seq,
            task_id: task_id.clone(),
            validating_role: role.clone(),
            verdict,
            reasons,
            timestamp: at,
        };
        journal.record(
            EventDraft::new(
                EventKind::ValidationRecorded {
                    record: record.clone(),
                },
                at,
            )
            .task(task_id)
            .role(role)
            .detail(format!("{} judged {}: {}", role, task_id, verdict)),
        )?;

        let outcome = match verdict {
            Verdict::Pass => {
                journal.transition(task_id, TaskStatus::Accepted, None, Some(role), at)?;
                GateOutcome::Accepted
            }
            Verdict::Fail if correction_round < self.policy.max_corrections => {
                journal.transition(
                    task_id,
                    TaskStatus::Rejected,
                    Some(record.reasons.join("; ")),
                    Some(role),
                    at,
                )?;
                GateOutcome::Rejected
            }
            Verdict::Fail => {
                journal.transition(
                    task_id,
                    TaskStatus::Escalated,
                    Some(format!("correction budget spent: {}", record.reasons.join("; "))),
                    Some(role),
                    at,
                )?;
                GateOutcome::Escalated
            }
        };

        tracing::info!(
            task_id = %task_id,
            role = %role,
            verdict = %verdict,
            outcome = ?outcome,
            "Validation recorded"
        );
        Ok((record, outcome))
    }

    /// A refused verdict still lands in the validation history as a failing
    /// record in the refused role's name. The task does not move.
    fn record_refusal(
        &self,
        journal: &mut Journal,
        task_id: &TaskId,
        role: &RoleId,
        err: &CouncilError,
        at: DateTime<Utc>,
    ) -> CouncilResult<()> {
        let record = ValidationRecord {
            sequence: journal.state().next_validation_seq,
            task_id: task_id.clone(),
            validating_role: role.clone(),
            verdict: Verdict::Fail,
            reasons: vec![format!("{}: refused: {}", GATE_ERROR, err)],
            timestamp: at,
        };
        journal.record(
            EventDraft::new(EventKind::ValidationRecorded { record }, at)
                .task(task_id)
                .role(role)
                .detail(format!("verdict by {} on {} refused: {}", role, task_id, err)),
        )?;
        tracing::warn!(task_id = %task_id, role = %role, error = %err, "Verdict refused");
        Ok(())
    }

    /// Overseer override: accept a task that is awaiting validation or
    /// escalated
    pub fn force_accept(
        &self,
        journal: &mut Journal,
        task_id: &TaskId,
        overseer: &RoleId,
        justification: &str,
        at: DateTime<Utc>,
    ) -> CouncilResult<ValidationRecord> {
        let record = ValidationRecord {
            sequence: journal.state().next_validation_seq,
            task_id: task_id.clone(),
            validating_role: overseer.clone(),
            verdict: Verdict::Pass,
            reasons: vec![format!("override: {}", justification)],
            timestamp: at,
        };
        journal.record(
            EventDraft::new(
                EventKind::ValidationRecorded {
                    record: record.clone(),
                },
                at,
            )
            .task(task_id)
            .role(overseer)
            .detail(format!("{} force-accepted {}", overseer, task_id)),
        )?;
        journal.transition(
            task_id,
            TaskStatus::Accepted,
            Some("override".into()),
            Some(overseer),
            at,
        )?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate(max_corrections: u32) -> ValidationGate {
        ValidationGate::new(
            Arc::new(RoleRegistry::load(RegistryConfig::standard()).unwrap()),
            ValidationPolicy { max_corrections },
        )
    }

    /// One task of `phase` owned by `owner`, already awaiting validation
    fn awaiting(phase: Phase, owner: &str) -> Journal {
        let now = Utc::now();
        let id = TaskId::sequential(1);
        let root = Task::new(id.clone(), 1, phase, RoleId::new(owner), json!(null), now);
        let mut journal = Journal::open(WorkflowId::new("wf"), root, None, now).unwrap();
        journal.transition(&id, TaskStatus::Ready, None, None, now).unwrap();
        journal
            .record(EventDraft::new(EventKind::TaskStarted { attempt: 1, deadline: now }, now).task(&id))
            .unwrap();
        journal
            .record(EventDraft::new(EventKind::TaskCompleted { result: json!("out") }, now).task(&id))
            .unwrap();
        journal
    }

    #[test]
    fn test_pass_accepts_propose_task() {
        let mut journal = awaiting(Phase::Propose, "planner");
        let (record, outcome) = gate(2)
            .validate(&mut journal, &TaskId::sequential(1), &RoleId::new("validator"), Verdict::Pass, vec![], Utc::now())
            .unwrap();
        assert_eq!(outcome, GateOutcome::Accepted);
        assert_eq!(record.sequence, 1);
        assert_eq!(journal.state().task(&TaskId::sequential(1)).unwrap().status, TaskStatus::Accepted);
    }

    #[test]
    fn test_self_validation_refused_and_logged() {
        let mut journal = awaiting(Phase::Propose, "validator");
        let err = gate(2)
            .validate(&mut journal, &TaskId::sequential(1), &RoleId::new("validator"), Verdict::Pass, vec![], Utc::now())
            .unwrap_err();
        assert!(matches!(err, CouncilError::SelfValidation { .. }));

        let state = journal.state();
        let record = state.active_validation(&TaskId::sequential(1)).unwrap();
        assert_eq!(record.validating_role, RoleId::new("validator"));
        assert_eq!(record.verdict, Verdict::Fail);
        assert!(record.is_gate_error());
        assert!(record.reasons[0].contains("refused"));
        assert!(!state.has_passing_record(&TaskId::sequential(1)));
        assert_eq!(state.task(&TaskId::sequential(1)).unwrap().status, TaskStatus::AwaitingValidation);
    }

    #[test]
    fn test_low_authority_validator_refused() {
        let mut journal = awaiting(Phase::Propose, "planner");
        let err = gate(2)
            .validate(&mut journal, &TaskId::sequential(1), &RoleId::new("implementer"), Verdict::Pass, vec![], Utc::now())
            .unwrap_err();
        assert!(err.is_authority());

        let records = &journal.state().validations[&TaskId::sequential(1)];
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].validating_role, RoleId::new("implementer"));
        assert!(records[0].is_gate_error());
        assert_eq!(
            journal.state().task(&TaskId::sequential(1)).unwrap().status,
            TaskStatus::AwaitingValidation
        );

        // A proper verdict afterwards still goes through
        let (_, outcome) = gate(2)
            .validate(&mut journal, &TaskId::sequential(1), &RoleId::new("validator"), Verdict::Pass, vec![], Utc::now())
            .unwrap();
        assert_eq!(outcome, GateOutcome::Accepted);
    }

    #[test]
    fn test_implementation_without_accepted_review_fails() {
        let mut journal = awaiting(Phase::Implement, "implementer");
        let (record, outcome) = gate(2)
            .validate(&mut journal, &TaskId::sequential(1), &RoleId::new("validator"), Verdict::Pass, vec![], Utc::now())
            .unwrap();
        assert_eq!(record.verdict, Verdict::Fail);
        assert!(record.is_gate_error());
        assert_eq!(outcome, GateOutcome::Rejected);
    }

    #[test]
    fn test_fail_without_budget_escalates() {
        let mut journal = awaiting(Phase::Propose, "planner");
        let (_, outcome) = gate(0)
            .validate(
                &mut journal,
                &TaskId::sequential(1),
                &RoleId::new("validator"),
                Verdict::Fail,
                vec!["incomplete".into()],
                Utc::now(),
            )
            .unwrap();
        assert_eq!(outcome, GateOutcome::Escalated);
        assert_eq!(journal.state().task(&TaskId::sequential(1)).unwrap().status, TaskStatus::Escalated);
    }

    #[test]
    fn test_force_accept_records_override() {
        let mut journal = awaiting(Phase::Propose, "planner");
        let record = gate(2)
            .force_accept(&mut journal, &TaskId::sequential(1), &RoleId::new("overseer"), "good enough", Utc::now())
            .unwrap();
        assert_eq!(record.reasons, vec!["override: good enough".to_string()]);
        assert!(journal.state().has_passing_record(&TaskId::sequential(1)));
    }
}
