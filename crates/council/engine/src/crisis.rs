//! Crisis manager
//!
//! Opens cases, runs votes and checks Overseer overrides. It records the
//! crisis lifecycle in the journal but leaves the consequences (retrying a
//! task, excluding a role, executing an override) to the orchestrator.
//!
//! # Routing
//!
//! ```text
//! minor deadlock, nothing to retry -> override review
//! minor                            -> auto retry of the triggering task
//! severity >= threshold            -> override review
//! no motion or no eligible vote    -> override review
//! otherwise                        -> vote
//! ```
//!
//! Minor cases never vote. When the triggering task is not retryable the
//! auto retry only closes the case; a deadlock would be detected again on
//! the next tick, so it goes to the Overseer instead.
//!
//! A failed vote resolves the case as `motion_failed` unless
//! `override_on_vote_failure` hands it to the Overseer.

use crate::{resolve_vote, EventDraft, Journal, WorkflowState};
use chrono::{DateTime, Utc};
use council_types::*;
use std::sync::Arc;

/// What should open a case
#[derive(Clone, Debug)]
pub struct CrisisTrigger {
    pub kind: CrisisKind,
    pub task_id: TaskId,
    pub disputed_role: Option<RoleId>,
    pub origin: FailureOrigin,
    pub detail: String,
}

impl CrisisTrigger {
    pub fn new(kind: CrisisKind, task_id: TaskId, origin: FailureOrigin) -> Self {
        Self {
            kind,
            task_id,
            disputed_role: None,
            origin,
            detail: String::new(),
        }
    }

    pub fn against(mut self, role: RoleId) -> Self {
        self.disputed_role = Some(role);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// How a newly opened case proceeds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrisisPath {
    AutoRetry,
    Voting,
    OverrideReview,
}

/// Result of counting ballots
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteResolution {
    /// Ballots still outstanding
    Pending,
    /// The motion carried; apply it
    Carried,
    /// The motion failed and the Overseer decides
    OverrideReview,
    /// The motion failed; the case closes without applying it
    Failed,
}

impl VoteResolution {
    pub fn outcome(self) -> VoteOutcome {
        match self {
            VoteResolution::Pending => VoteOutcome::Pending,
            VoteResolution::Carried => VoteOutcome::Passed,
            VoteResolution::OverrideReview | VoteResolution::Failed => VoteOutcome::Failed,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CrisisManager {
    registry: Arc<RoleRegistry>,
    policy: CrisisPolicy,
}

impl CrisisManager {
    pub fn new(registry: Arc<RoleRegistry>, policy: CrisisPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> &CrisisPolicy {
        &self.policy
    }

    // ── Opening ──────────────────────────────────────────────────────

    pub fn open(
        &self,
        journal: &mut Journal,
        trigger: CrisisTrigger,
        at: DateTime<Utc>,
    ) -> CouncilResult<(CrisisId, CrisisPath)> {
        let state = journal.state();
        if !state.graph.contains(&trigger.task_id) {
            return Err(CouncilError::TaskNotFound(trigger.task_id.clone()));
        }
        let id = CrisisId::sequential(state.next_crisis_seq);
        let severity = self.policy.severity_for(trigger.kind);
        let eligible = self
            .registry
            .voters(trigger.disputed_role.as_ref(), &state.excluded_roles);
        let supersedes = state.latest_closed_crisis_for(&trigger.task_id);

        let (motion, path) = if severity == Severity::Minor {
            let retryable = state.task(&trigger.task_id).is_some_and(Task::is_retryable);
            let motion = retryable.then(|| Motion::RetryTask {
                task: trigger.task_id.clone(),
            });
            let path = if motion.is_none() && trigger.kind == CrisisKind::Deadlock {
                CrisisPath::OverrideReview
            } else {
                CrisisPath::AutoRetry
            };
            (motion, path)
        } else {
            let motion = self.motion_for(&trigger, state);
            let path = match &motion {
                _ if severity >= self.policy.override_threshold => CrisisPath::OverrideReview,
                None => CrisisPath::OverrideReview,
                Some(_) if eligible.is_empty() => CrisisPath::OverrideReview,
                Some(_) => CrisisPath::Voting,
            };
            (motion, path)
        };

        let case = CrisisCase::new(
            id.clone(),
            trigger.task_id.clone(),
            trigger.kind,
            severity,
            trigger.origin,
            at,
        )
        .with_disputed_role(trigger.disputed_role.clone())
        .with_motion(motion)
        .with_supersedes(supersedes)
        .with_detail(trigger.detail.clone());

        journal.record(
            EventDraft::new(EventKind::CrisisOpened { case }, at)
                .task(&trigger.task_id)
                .maybe_role(trigger.disputed_role.as_ref())
                .crisis(&id)
                .detail(format!(
                    "{} crisis ({}) on {}: {}",
                    trigger.kind, severity, trigger.task_id, trigger.detail
                )),
        )?;

        if path == CrisisPath::Voting {
            let deadline = at + self.policy.vote_timeout();
            let detail = format!("{} eligible voter(s)", eligible.len());
            journal.record(
                EventDraft::new(EventKind::VotingStarted { eligible, deadline }, at)
                    .crisis(&id)
                    .detail(detail),
            )?;
        }

        tracing::warn!(
            crisis_id = %id,
            kind = %trigger.kind,
            severity = %severity,
            task_id = %trigger.task_id,
            path = ?path,
            "Crisis opened"
        );
        Ok((id, path))
    }

    fn motion_for(&self, trigger: &CrisisTrigger, state: &WorkflowState) -> Option<Motion> {
        match trigger.kind {
            CrisisKind::RepeatedValidationFailure => Some(Motion::RetryTask {
                task: trigger.task_id.clone(),
            }),
            CrisisKind::AuthorityViolation | CrisisKind::NoConfidence => {
                let role = trigger.disputed_role.as_ref()?;
                let replacement = self.registry.alternate_for(role, &state.excluded_roles)?;
                Some(Motion::ExcludeRole {
                    role: role.clone(),
                    replacement,
                })
            }
            CrisisKind::Deadlock => None,
        }
    }

    // ── Voting ───────────────────────────────────────────────────────

    /// Record one ballot; closes the vote once every eligible role voted
    pub fn cast_vote(
        &self,
        journal: &mut Journal,
        crisis_id: &CrisisId,
        role: &RoleId,
        ballot: Ballot,
        at: DateTime<Utc>,
    ) -> CouncilResult<VoteResolution> {
        let case = journal
            .state()
            .crisis(crisis_id)
            .ok_or_else(|| CouncilError::CrisisNotFound(crisis_id.clone()))?;
        if !case.is_open() {
            return Err(CouncilError::CrisisClosed(crisis_id.clone()));
        }
        if case.status != CrisisStatus::Voting {
            return Err(CouncilError::CrisisState {
                crisis: crisis_id.clone(),
                status: case.status,
            });
        }
        if !case.eligible_voters.contains(role) {
            return Err(CouncilError::NotEligible {
                crisis: crisis_id.clone(),
                role: role.clone(),
            });
        }
        if case.ballot_of(role).is_some() {
            return Err(CouncilError::DuplicateBallot {
                crisis: crisis_id.clone(),
                role: role.clone(),
            });
        }

        let vote = Vote {
            crisis_id: crisis_id.clone(),
            role: role.clone(),
            ballot,
            timestamp: at,
        };
        journal.record(
            EventDraft::new(EventKind::VoteCast { vote }, at)
                .crisis(crisis_id)
                .role(role)
                .detail(format!("{} voted {:?}", role, ballot)),
        )?;
        tracing::debug!(crisis_id = %crisis_id, role = %role, ballot = ?ballot, "Ballot recorded");

        let all_voted = journal.state().crisis(crisis_id).is_some_and(|c| {
            c.eligible_voters
                .iter()
                .all(|r| c.ballot_of(r).is_some())
        });
        if all_voted {
            self.close_vote(journal, crisis_id, at)
        } else {
            Ok(VoteResolution::Pending)
        }
    }

    /// Count ballots (missing ones oppose) and record the outcome
    pub fn close_vote(
        &self,
        journal: &mut Journal,
        crisis_id: &CrisisId,
        at: DateTime<Utc>,
    ) -> CouncilResult<VoteResolution> {
        let case = journal
            .state()
            .crisis(crisis_id)
            .ok_or_else(|| CouncilError::CrisisNotFound(crisis_id.clone()))?;
        if case.status != CrisisStatus::Voting {
            return Err(CouncilError::CrisisState {
                crisis: crisis_id.clone(),
                status: case.status,
            });
        }
        let (tally, outcome) =
            resolve_vote(&case.eligible_voters, &case.ballots, self.policy.majority, true);

        journal.record(
            EventDraft::new(EventKind::VoteClosed { tally, outcome }, at)
                .crisis(crisis_id)
                .detail(format!(
                    "support {} oppose {} abstain {} missing {}: {:?}",
                    tally.support, tally.oppose, tally.abstain, tally.missing, outcome
                )),
        )?;
        tracing::info!(
            crisis_id = %crisis_id,
            support = tally.support,
            oppose = tally.oppose,
            abstain = tally.abstain,
            missing = tally.missing,
            outcome = ?outcome,
            "Vote closed"
        );

        Ok(match outcome {
            VoteOutcome::Passed => VoteResolution::Carried,
            _ if self.policy.override_on_vote_failure => VoteResolution::OverrideReview,
            _ => VoteResolution::Failed,
        })
    }

    /// Votes whose deadline has passed
    pub fn expired_votes(&self, state: &WorkflowState, now: DateTime<Utc>) -> Vec<CrisisId> {
        state
            .crises
            .values()
            .filter(|c| c.status == CrisisStatus::Voting)
            .filter(|c| c.vote_deadline.is_some_and(|d| d <= now))
            .map(|c| c.id.clone())
            .collect()
    }

    // ── Override Review ──────────────────────────────────────────────

    pub fn enter_override_review(
        &self,
        journal: &mut Journal,
        crisis_id: &CrisisId,
        review_task: Option<TaskId>,
        at: DateTime<Utc>,
    ) -> CouncilResult<()> {
        let detail = match &review_task {
            Some(task) => format!("override review by {} in {}", self.registry.overseer(), task),
            None => format!("override review by {}", self.registry.overseer()),
        };
        let mut draft = EventDraft::new(EventKind::OverrideReviewOpened { review_task: review_task.clone() }, at)
            .crisis(crisis_id)
            .role(self.registry.overseer())
            .detail(detail);
        if let Some(task) = &review_task {
            draft = draft.task(task);
        }
        journal.record(draft)?;
        Ok(())
    }

    /// Validate an Overseer decision against the current state
    pub fn check_override(
        &self,
        state: &WorkflowState,
        crisis_id: &CrisisId,
        decision: &OverrideDecision,
        acting_role: &RoleId,
    ) -> CouncilResult<()> {
        let case = state
            .crisis(crisis_id)
            .ok_or_else(|| CouncilError::CrisisNotFound(crisis_id.clone()))?;
        if !case.is_open() {
            return Err(CouncilError::CrisisClosed(crisis_id.clone()));
        }
        if case.status != CrisisStatus::OverrideReview {
            return Err(CouncilError::CrisisState {
                crisis: crisis_id.clone(),
                status: case.status,
            });
        }
        if acting_role != self.registry.overseer() {
            return Err(CouncilError::authority(acting_role, format!("override {}", crisis_id)));
        }
        if decision.justification.trim().is_empty() {
            return Err(CouncilError::InvalidOverride("justification is required".into()));
        }

        let task = state
            .task(&case.task_id)
            .ok_or_else(|| CouncilError::TaskNotFound(case.task_id.clone()))?;
        match &decision.action {
            OverrideAction::ForceAccept => {
                if !matches!(
                    task.status,
                    TaskStatus::AwaitingValidation | TaskStatus::Escalated
                ) {
                    return Err(CouncilError::InvalidOverride(format!(
                        "cannot force-accept {} while it is {}",
                        task.id, task.status
                    )));
                }
                if task.result.is_none() {
                    return Err(CouncilError::InvalidOverride(format!(
                        "{} has no result to accept",
                        task.id
                    )));
                }
                if task.owner == *acting_role {
                    return Err(CouncilError::SelfValidation {
                        task: task.id.clone(),
                        role: acting_role.clone(),
                    });
                }
                if task.phase == Phase::Implement
                    && !state.graph.has_accepted_descendant(&task.id, Phase::Validate)
                {
                    return Err(CouncilError::PhaseOrdering(task.id.clone()));
                }
            }
            OverrideAction::ForceReject => {
                if task.is_terminal() {
                    return Err(CouncilError::InvalidOverride(format!(
                        "{} is already {}",
                        task.id, task.status
                    )));
                }
            }
            OverrideAction::Reassign { role } => {
                let authority = self
                    .registry
                    .authority_of(role)
                    .ok_or_else(|| RegistryError::UnknownRole(role.clone()))?;
                if authority < task.phase.minimum_authority() {
                    return Err(CouncilError::authority(role, format!("own {} task {}", task.phase, task.id)));
                }
                if state.excluded_roles.contains(role) {
                    return Err(CouncilError::InvalidOverride(format!("{} is excluded", role)));
                }
                if *role == task.owner {
                    return Err(CouncilError::InvalidOverride(format!("{} already owns {}", role, task.id)));
                }
                if !matches!(
                    task.status,
                    TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Escalated
                ) {
                    return Err(CouncilError::InvalidOverride(format!(
                        "cannot reassign {} while it is {}",
                        task.id, task.status
                    )));
                }
            }
            OverrideAction::AbortWorkflow => {}
        }
        Ok(())
    }

    pub fn resolve(
        &self,
        journal: &mut Journal,
        crisis_id: &CrisisId,
        resolution: CrisisResolution,
        at: DateTime<Utc>,
    ) -> CouncilResult<()> {
        let status = match resolution {
            CrisisResolution::Overridden { .. } => CrisisStatus::Overridden,
            _ => CrisisStatus::Resolved,
        };
        let detail = format!("{:?}", resolution);
        journal.record(
            EventDraft::new(EventKind::CrisisResolved { resolution, status }, at)
                .crisis(crisis_id)
                .detail(detail),
        )?;
        tracing::info!(crisis_id = %crisis_id, status = ?status, "Crisis closed");
        Ok(())
    }

    // ── Deadlock ─────────────────────────────────────────────────────

    /// A task stuck behind work that can never finish.
    ///
    /// The workflow is deadlocked when nothing is ready, running or under
    /// review, no crisis is open, no retry is waiting out its backoff, and
    /// some task is still not terminal.
    pub fn detect_deadlock(&self, state: &WorkflowState, now: DateTime<Utc>) -> Option<TaskId> {
        if !state.open_crises().is_empty() {
            return None;
        }
        let mut stuck: Vec<&Task> = Vec::new();
        for task in state.graph.tasks().filter(|t| !t.retired) {
            match task.status {
                TaskStatus::Ready | TaskStatus::Running | TaskStatus::AwaitingValidation => {
                    return None
                }
                TaskStatus::Pending if task.not_before.is_some_and(|t| t > now) => return None,
                TaskStatus::Pending | TaskStatus::Escalated => stuck.push(task),
                TaskStatus::Accepted | TaskStatus::Rejected => {}
            }
        }
        stuck
            .into_iter()
            .min_by_key(|t| (t.created_seq, t.id.clone()))
            .map(|t| t.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Arc<RoleRegistry> {
        let config = RegistryConfig::standard()
            .with_role(Role::new("implementer-b", AuthorityLevel::Implement))
            .with_role(Role::new("validator-b", AuthorityLevel::Validate));
        Arc::new(RoleRegistry::load(config).unwrap())
    }

    fn journal() -> Journal {
        let now = Utc::now();
        let root = Task::new(
            TaskId::sequential(1),
            1,
            Phase::Implement,
            RoleId::new("implementer"),
            json!(null),
            now,
        );
        Journal::open(WorkflowId::new("wf"), root, None, now).unwrap()
    }

    fn rvf() -> CrisisTrigger {
        CrisisTrigger::new(
            CrisisKind::RepeatedValidationFailure,
            TaskId::sequential(1),
            FailureOrigin::Substantive,
        )
    }

    #[test]
    fn test_major_retry_crisis_goes_to_vote() {
        let manager = CrisisManager::new(registry(), CrisisPolicy::default());
        let mut journal = journal();
        let (id, path) = manager.open(&mut journal, rvf(), Utc::now()).unwrap();
        assert_eq!(path, CrisisPath::Voting);
        let case = journal.state().crisis(&id).unwrap();
        assert_eq!(case.status, CrisisStatus::Voting);
        // planner is below voting authority, overseer and implementers vote
        assert!(!case.eligible_voters.contains(&RoleId::new("planner")));
        assert!(case.eligible_voters.contains(&RoleId::new("overseer")));
    }

    fn minor_policy() -> CrisisPolicy {
        CrisisPolicy {
            severity: SeverityPolicy {
                deadlock: Severity::Minor,
                authority_violation: Severity::Minor,
                repeated_validation_failure: Severity::Minor,
                no_confidence: Severity::Minor,
            },
            ..CrisisPolicy::default()
        }
    }

    #[test]
    fn test_minor_cases_auto_retry_without_vote() {
        let manager = CrisisManager::new(registry(), minor_policy());
        let now = Utc::now();
        for kind in [
            CrisisKind::RepeatedValidationFailure,
            CrisisKind::AuthorityViolation,
            CrisisKind::NoConfidence,
            CrisisKind::Deadlock,
        ] {
            let mut journal = journal();
            journal
                .transition(&TaskId::sequential(1), TaskStatus::Rejected, Some("rejected".into()), None, now)
                .unwrap();
            let trigger = CrisisTrigger::new(kind, TaskId::sequential(1), FailureOrigin::Substantive)
                .against(RoleId::new("implementer"));
            let (id, path) = manager.open(&mut journal, trigger, now).unwrap();
            assert_eq!(path, CrisisPath::AutoRetry, "{kind}");

            let case = journal.state().crisis(&id).unwrap();
            assert_eq!(
                case.motion,
                Some(Motion::RetryTask {
                    task: TaskId::sequential(1)
                }),
                "{kind}"
            );
            assert!(case.eligible_voters.is_empty());
            assert!(case.vote_deadline.is_none());
        }
    }

    #[test]
    fn test_minor_case_on_live_task_has_nothing_to_retry() {
        let manager = CrisisManager::new(registry(), minor_policy());
        let now = Utc::now();
        for kind in [CrisisKind::AuthorityViolation, CrisisKind::NoConfidence] {
            let mut journal = journal();
            let trigger = CrisisTrigger::new(kind, TaskId::sequential(1), FailureOrigin::Substantive)
                .against(RoleId::new("implementer"));
            let (id, path) = manager.open(&mut journal, trigger, now).unwrap();
            assert_eq!(path, CrisisPath::AutoRetry, "{kind}");
            assert_eq!(journal.state().crisis(&id).unwrap().motion, None);
        }

        // Closing a deadlock without a retry would only reopen it
        let mut journal = journal();
        let trigger = CrisisTrigger::new(CrisisKind::Deadlock, TaskId::sequential(1), FailureOrigin::Substantive);
        let (_, path) = manager.open(&mut journal, trigger, now).unwrap();
        assert_eq!(path, CrisisPath::OverrideReview);
    }

    #[test]
    fn test_deadlock_goes_to_override_review() {
        let manager = CrisisManager::new(registry(), CrisisPolicy::default());
        let trigger = CrisisTrigger::new(CrisisKind::Deadlock, TaskId::sequential(1), FailureOrigin::Substantive);
        let (id, path) = manager.open(&mut journal(), trigger, Utc::now()).unwrap();
        assert_eq!(path, CrisisPath::OverrideReview);
        assert_eq!(id, CrisisId::sequential(1));
    }

    #[test]
    fn test_no_confidence_motion_names_replacement() {
        let manager = CrisisManager::new(registry(), CrisisPolicy::default());
        let mut journal = journal();
        let trigger = CrisisTrigger::new(CrisisKind::NoConfidence, TaskId::sequential(1), FailureOrigin::Substantive)
            .against(RoleId::new("implementer"));
        let (id, _) = manager.open(&mut journal, trigger, Utc::now()).unwrap();
        let case = journal.state().crisis(&id).unwrap();
        assert_eq!(
            case.motion,
            Some(Motion::ExcludeRole {
                role: RoleId::new("implementer"),
                replacement: RoleId::new("implementer-b"),
            })
        );
        assert!(!case.eligible_voters.contains(&RoleId::new("implementer")));
    }

    #[test]
    fn test_vote_closes_when_everyone_voted() {
        let manager = CrisisManager::new(registry(), CrisisPolicy::default());
        let mut journal = journal();
        let now = Utc::now();
        let (id, _) = manager.open(&mut journal, rvf(), now).unwrap();
        let voters: Vec<RoleId> = journal.state().crisis(&id).unwrap().eligible_voters.iter().cloned().collect();

        let (last, rest) = voters.split_last().unwrap();
        for role in rest {
            let resolution = manager.cast_vote(&mut journal, &id, role, Ballot::Support, now).unwrap();
            assert_eq!(resolution, VoteResolution::Pending);
        }
        let resolution = manager.cast_vote(&mut journal, &id, last, Ballot::Support, now).unwrap();
        assert_eq!(resolution, VoteResolution::Carried);
        assert_eq!(
            journal.state().crisis(&id).unwrap().outcome,
            Some(VoteOutcome::Passed)
        );
    }

    #[test]
    fn test_ballot_errors() {
        let manager = CrisisManager::new(registry(), CrisisPolicy::default());
        let mut journal = journal();
        let now = Utc::now();
        let (id, _) = manager.open(&mut journal, rvf(), now).unwrap();

        let err = manager
            .cast_vote(&mut journal, &id, &RoleId::new("planner"), Ballot::Support, now)
            .unwrap_err();
        assert!(matches!(err, CouncilError::NotEligible { .. }));

        manager
            .cast_vote(&mut journal, &id, &RoleId::new("overseer"), Ballot::Oppose, now)
            .unwrap();
        let err = manager
            .cast_vote(&mut journal, &id, &RoleId::new("overseer"), Ballot::Support, now)
            .unwrap_err();
        assert!(matches!(err, CouncilError::DuplicateBallot { .. }));

        let err = manager
            .cast_vote(&mut journal, &CrisisId::sequential(9), &RoleId::new("overseer"), Ballot::Support, now)
            .unwrap_err();
        assert!(matches!(err, CouncilError::CrisisNotFound(_)));
    }

    #[test]
    fn test_expired_vote_fails_or_goes_to_override() {
        let now = Utc::now();
        for (flag, expected) in [(true, VoteResolution::OverrideReview), (false, VoteResolution::Failed)] {
            let policy = CrisisPolicy {
                override_on_vote_failure: flag,
                ..CrisisPolicy::default()
            };
            let manager = CrisisManager::new(registry(), policy);
            let mut journal = journal();
            let (id, _) = manager.open(&mut journal, rvf(), now).unwrap();
            let later = now + manager.policy().vote_timeout();
            assert_eq!(manager.expired_votes(journal.state(), later), vec![id.clone()]);
            assert_eq!(manager.close_vote(&mut journal, &id, later).unwrap(), expected);
        }
    }

    #[test]
    fn test_override_checks() {
        let manager = CrisisManager::new(registry(), CrisisPolicy::default());
        let mut journal = journal();
        let now = Utc::now();
        let trigger = CrisisTrigger::new(CrisisKind::Deadlock, TaskId::sequential(1), FailureOrigin::Substantive);
        let (id, _) = manager.open(&mut journal, trigger, now).unwrap();
        manager.enter_override_review(&mut journal, &id, None, now).unwrap();

        let overseer = RoleId::new("overseer");
        let reassign = OverrideDecision::new(
            OverrideAction::Reassign {
                role: RoleId::new("implementer-b"),
            },
            "fresh eyes",
        );
        manager.check_override(journal.state(), &id, &reassign, &overseer).unwrap();

        let err = manager
            .check_override(journal.state(), &id, &reassign, &RoleId::new("validator"))
            .unwrap_err();
        assert!(err.is_authority());

        let unjustified = OverrideDecision::new(OverrideAction::AbortWorkflow, "  ");
        assert!(matches!(
            manager.check_override(journal.state(), &id, &unjustified, &overseer),
            Err(CouncilError::InvalidOverride(_))
        ));

        // The task never produced a result
        let accept = OverrideDecision::new(OverrideAction::ForceAccept, "ship it");
        assert!(manager.check_override(journal.state(), &id, &accept, &overseer).is_err());
    }

    #[test]
    fn test_detect_deadlock_on_unsatisfiable_dependency() {
        let manager = CrisisManager::new(registry(), CrisisPolicy::default());
        let now = Utc::now();
        let mut journal = journal();
        let root = TaskId::sequential(1);
        journal
            .transition(&root, TaskStatus::Rejected, Some("dropped".into()), None, now)
            .unwrap();
        assert_eq!(manager.detect_deadlock(journal.state(), now), None);

        let waiting = Task::new(TaskId::sequential(2), 2, Phase::Implement, RoleId::new("implementer"), json!(null), now)
            .with_dependency(root);
        journal
            .record(EventDraft::new(EventKind::TaskDelegated { task: waiting }, now).task(&TaskId::sequential(2)))
            .unwrap();
        assert_eq!(manager.detect_deadlock(journal.state(), now), Some(TaskId::sequential(2)));
    }
}
