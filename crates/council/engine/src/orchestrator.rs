//! Workflow engine: one workflow's control loop
//!
//! The engine never runs executors itself. `tick` hands back the work to
//! start (task invocations and ballot requests); the caller runs it and
//! reports back through `complete` and `cast_vote`. Every decision in
//! between (gating results, correcting rejected work, opening and routing
//! crisis cases, closing the workflow) happens here, synchronously and in a
//! single place, so one workflow's events are totally ordered.

use crate::{
    CrisisManager, CrisisPath, CrisisTrigger, DelegationEngine, EventDraft, GateOutcome, Journal,
    RetryDecision, Scheduler, ValidationGate, VoteResolution, WorkflowState,
};
use chrono::{DateTime, Utc};
use council_types::*;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct WorkflowEngine {
    journal: Journal,
    registry: Arc<RoleRegistry>,
    policy: CouncilPolicy,
    delegation: DelegationEngine,
    scheduler: Scheduler,
    gate: ValidationGate,
    crisis: CrisisManager,
    dispatch: Vec<Dispatch>,
}

impl WorkflowEngine {
    /// Start a workflow whose root `Propose` task belongs to the policy's
    /// entry role
    pub fn submit(
        id: WorkflowId,
        root_payload: serde_json::Value,
        registry: Arc<RoleRegistry>,
        policy: CouncilPolicy,
        at: DateTime<Utc>,
    ) -> CouncilResult<Self> {
        registry.require(&policy.entry_role)?;
        let root = Task::new(
            TaskId::sequential(1),
            1,
            Phase::Propose,
            policy.entry_role.clone(),
            root_payload,
            at,
        );
        let journal = Journal::open(id.clone(), root, None, at)?;
        tracing::info!(workflow_id = %id, entry_role = %policy.entry_role, "Workflow submitted");
        Ok(Self::assemble(journal, registry, policy))
    }

    /// Resume a workflow rebuilt from its snapshot and audit log.
    ///
    /// Ballot requests for votes still open are queued again; running
    /// attempts whose workers were lost are left to their deadlines.
    pub fn restore(state: WorkflowState, registry: Arc<RoleRegistry>, policy: CouncilPolicy) -> Self {
        let voting: Vec<CrisisId> = state
            .crises
            .values()
            .filter(|c| c.status == CrisisStatus::Voting)
            .map(|c| c.id.clone())
            .collect();
        let mut engine = Self::assemble(Journal::from_state(state), registry, policy);
        for crisis_id in voting {
            engine.queue_ballots(&crisis_id);
        }
        tracing::info!(
            workflow_id = %engine.id(),
            sequence = engine.state().last_sequence,
            "Workflow restored"
        );
        engine
    }

    fn assemble(journal: Journal, registry: Arc<RoleRegistry>, policy: CouncilPolicy) -> Self {
        Self {
            delegation: DelegationEngine::new(registry.clone()),
            scheduler: Scheduler::new(policy.scheduler.clone()),
            gate: ValidationGate::new(registry.clone(), policy.validation.clone()),
            crisis: CrisisManager::new(registry.clone(), policy.crisis.clone()),
            journal,
            registry,
            policy,
            dispatch: Vec::new(),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn id(&self) -> &WorkflowId {
        &self.journal.state().id
    }

    pub fn state(&self) -> &WorkflowState {
        self.journal.state()
    }

    pub fn snapshot(&self) -> WorkflowState {
        self.journal.state().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.journal.state().is_closed()
    }

    pub fn running_count(&self) -> usize {
        self.journal.state().graph.count(TaskStatus::Running)
    }

    pub fn open_crises(&self) -> Vec<CrisisCase> {
        self.journal
            .state()
            .open_crises()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> WorkflowSummary {
        let state = self.journal.state();
        let root = current_version(state, &state.root);
        WorkflowSummary {
            id: state.id.clone(),
            status: state.status,
            closing_reason: state.closing_reason.clone(),
            root: state.root.clone(),
            root_result: state.task(&root).and_then(|t| t.result.clone()),
            tasks: state.status_counts(),
            open_crises: state.open_crises().into_iter().map(|c| c.id.clone()).collect(),
            unresolved_crisis: state.unresolved_crisis.clone(),
            submitted_at: state.submitted_at,
            updated_at: state.updated_at,
        }
    }

    /// Events recorded since the last drain, in sequence order
    pub fn drain_events(&mut self) -> Vec<AuditEvent> {
        self.journal.drain()
    }

    pub fn take_dispatches(&mut self) -> Vec<Dispatch> {
        std::mem::take(&mut self.dispatch)
    }

    // ── Control Loop ─────────────────────────────────────────────────

    /// Advance the workflow and return the work to start now.
    ///
    /// `capacity` is how many more tasks the caller can run; the engine
    /// also keeps its own running count under the policy limit. Ballot
    /// requests do not take capacity.
    pub fn tick(&mut self, now: DateTime<Utc>, capacity: usize) -> CouncilResult<Vec<Dispatch>> {
        if self.is_closed() {
            self.dispatch.clear();
            return Ok(Vec::new());
        }

        for (task_id, attempt) in self.scheduler.expired(self.state(), now) {
            tracing::warn!(workflow_id = %self.id(), task_id = %task_id, attempt, "Task deadline exceeded");
            self.fail_attempt(&task_id, ExecutionFailure::Timeout, now)?;
            if self.is_closed() {
                return Ok(self.closed_tick());
            }
        }

        for crisis_id in self.crisis.expired_votes(self.state(), now) {
            let resolution = self.crisis.close_vote(&mut self.journal, &crisis_id, now)?;
            self.route_vote(&crisis_id, resolution, now)?;
            if self.is_closed() {
                return Ok(self.closed_tick());
            }
        }

        self.scheduler.promote_ready(&mut self.journal, now)?;
        if let Some(stuck) = self.crisis.detect_deadlock(self.state(), now) {
            let trigger = CrisisTrigger::new(CrisisKind::Deadlock, stuck.clone(), FailureOrigin::Substantive)
                .with_detail(format!("no runnable work; {} cannot proceed", stuck));
            self.escalate(trigger, now)?;
            if self.is_closed() {
                return Ok(self.closed_tick());
            }
            self.scheduler.promote_ready(&mut self.journal, now)?;
        }

        let limit = self.policy.scheduler.max_concurrency;
        let slots = capacity.min(limit.saturating_sub(self.running_count()));
        for task_id in self.scheduler.admit(&mut self.journal, slots, now)? {
            let invocation = self.invocation(&task_id, now)?;
            tracing::debug!(
                workflow_id = %self.id(),
                task_id = %task_id,
                role = %invocation.role,
                phase = %invocation.phase,
                attempt = invocation.attempt,
                "Task dispatched"
            );
            self.dispatch.push(Dispatch::Execute(invocation));
        }

        self.maybe_close(now)?;
        if self.is_closed() {
            return Ok(self.closed_tick());
        }
        Ok(self.take_dispatches())
    }

    fn closed_tick(&mut self) -> Vec<Dispatch> {
        self.dispatch.clear();
        Vec::new()
    }

    fn invocation(&self, task_id: &TaskId, now: DateTime<Utc>) -> CouncilResult<TaskInvocation> {
        let state = self.state();
        let task = state
            .task(task_id)
            .ok_or_else(|| CouncilError::TaskNotFound(task_id.clone()))?;
        let inputs: BTreeMap<TaskId, serde_json::Value> = task
            .dependencies
            .iter()
            .filter_map(|d| state.task(d))
            .map(|d| (d.id.clone(), d.result.clone().unwrap_or_default()))
            .collect();
        let context = TaskContext {
            parent: task.parent.clone(),
            feedback: task.feedback.clone(),
            subject: task
                .reviews
                .as_ref()
                .and_then(|s| state.task(s))
                .map(SubjectView::from),
            inputs,
            crisis: match task.phase {
                Phase::OverseeReview => state.crisis_for_review(task_id).cloned(),
                _ => None,
            },
        };
        Ok(TaskInvocation {
            workflow_id: state.id.clone(),
            task_id: task_id.clone(),
            attempt: task.attempts,
            role: task.owner.clone(),
            phase: task.phase,
            payload: task.payload.clone(),
            context,
            deadline: task
                .deadline
                .unwrap_or_else(|| now + self.scheduler.policy().task_timeout()),
        })
    }

    /// Report the end of one execution attempt.
    ///
    /// Late and stale reports (closed workflow, superseded attempt) are
    /// logged as faults and otherwise ignored.
    pub fn complete(
        &mut self,
        task_id: &TaskId,
        attempt: u32,
        outcome: ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> CouncilResult<()> {
        if self.is_closed() {
            return self.journal.fault(
                format!("late completion of {} attempt {} after workflow closed", task_id, attempt),
                Some(task_id),
                None,
                now,
            );
        }
        let task = self
            .state()
            .task(task_id)
            .ok_or_else(|| CouncilError::TaskNotFound(task_id.clone()))?;
        if task.status != TaskStatus::Running || task.attempts != attempt {
            let error = format!(
                "stale completion of {} attempt {} (task is {}, attempt {})",
                task_id, attempt, task.status, task.attempts
            );
            return self.journal.fault(error, Some(task_id), None, now);
        }

        match outcome {
            ExecutionOutcome::Succeeded(output) => self.handle_success(task_id, output, now)?,
            ExecutionOutcome::Failed(failure) => self.fail_attempt(task_id, failure, now)?,
        }
        self.maybe_close(now)
    }

    fn fail_attempt(&mut self, task_id: &TaskId, failure: ExecutionFailure, now: DateTime<Utc>) -> CouncilResult<()> {
        let decision = self
            .scheduler
            .schedule_retry(&mut self.journal, task_id, &failure, now)?;
        if decision != RetryDecision::Exhausted {
            return Ok(());
        }

        let (phase, owner, attempts) = self
            .state()
            .task(task_id)
            .map(|t| (t.phase, t.owner.clone(), t.attempts))
            .ok_or_else(|| CouncilError::TaskNotFound(task_id.clone()))?;
        if phase == Phase::OverseeReview {
            return self.fail_on_review(task_id, format!("override review failed: {}", failure), now);
        }
        let trigger = CrisisTrigger::new(
            CrisisKind::RepeatedValidationFailure,
            task_id.clone(),
            FailureOrigin::Infrastructure,
        )
        .against(owner)
        .with_detail(format!("failed after {} attempt(s): {}", attempts, failure));
        self.escalate(trigger, now).map(|_| ())
    }

    fn handle_success(&mut self, task_id: &TaskId, output: ExecutionOutput, now: DateTime<Utc>) -> CouncilResult<()> {
        let task = self
            .state()
            .task(task_id)
            .cloned()
            .ok_or_else(|| CouncilError::TaskNotFound(task_id.clone()))?;

        // Out-of-authority requests are dropped; a malformed remainder fails
        // the whole output
        let struck_before = self.state().strikes(&task.owner);
        let mut refused = 0;
        let mut malformed = None;
        if !output.delegations.is_empty() {
            let screened = self.delegation.screen(self.state(), task_id, output.delegations)?;
            for err in &screened.refused {
                self.refuse(task_id, &task.owner, err, now)?;
            }
            refused = screened.refused.len();
            if !screened.permitted.is_empty() {
                match self
                    .delegation
                    .delegate_batch(&mut self.journal, task_id, screened.permitted, now)
                {
                    Ok(_) => {}
                    Err(err @ CouncilError::Replay(_)) => return Err(err),
                    Err(err) => {
                        self.refuse(task_id, &task.owner, &err, now)?;
                        malformed = Some(err);
                    }
                }
            }
        }

        self.journal.record(
            EventDraft::new(
                EventKind::TaskCompleted {
                    result: output.result.clone(),
                },
                now,
            )
            .task(task_id)
            .role(&task.owner)
            .detail(format!("{} completed attempt {}", task_id, task.attempts)),
        )?;

        if let Some(err) = malformed {
            self.gate_error(task_id, format!("{}: delegation refused: {}", GATE_ERROR, err), now)?;
            return self.check_strikes(&task.owner, task_id, struck_before, now);
        }

        match task.phase {
            Phase::Propose => self.countersign(task_id, Verdict::Pass, Vec::new(), now)?,
            Phase::Implement => self.ensure_reviewer(task_id, now)?,
            Phase::Validate => self.judge(&task, &output.result, now)?,
            Phase::OverseeReview => self.decide(&task, &output.result, now)?,
        }
        if refused > 0 {
            tracing::debug!(workflow_id = %self.id(), task_id = %task_id, refused, "Refused requests dropped");
            self.check_strikes(&task.owner, task_id, struck_before, now)?;
        }
        Ok(())
    }

    fn refuse(&mut self, task_id: &TaskId, role: &RoleId, err: &CouncilError, now: DateTime<Utc>) -> CouncilResult<()> {
        tracing::warn!(workflow_id = %self.id(), task_id = %task_id, role = %role, error = %err, "Delegation refused");
        self.journal.record(
            EventDraft::new(
                EventKind::DelegationRefused {
                    error: err.to_string(),
                    authority: err.is_authority(),
                },
                now,
            )
            .task(task_id)
            .role(role)
            .detail(err.to_string()),
        )?;
        Ok(())
    }

    /// Open an authority case when the strikes of `role` just reached the
    /// limit (from `before`)
    fn check_strikes(&mut self, role: &RoleId, task_id: &TaskId, before: u32, now: DateTime<Utc>) -> CouncilResult<()> {
        let limit = self.policy.crisis.authority_strike_limit;
        if self.is_closed() || limit == 0 || before >= limit || self.state().strikes(role) < limit {
            return Ok(());
        }
        let target = current_version(self.state(), task_id);
        let trigger = CrisisTrigger::new(CrisisKind::AuthorityViolation, target, FailureOrigin::Substantive)
            .against(role.clone())
            .with_detail(format!("{} refused delegation(s) by {}", limit, role));
        self.escalate(trigger, now).map(|_| ())
    }

    // ── Gating ───────────────────────────────────────────────────────

    /// Independent sign-off by the lowest-ranked eligible validator
    fn countersign(
        &mut self,
        task_id: &TaskId,
        verdict: Verdict,
        reasons: Vec<String>,
        now: DateTime<Utc>,
    ) -> CouncilResult<()> {
        let state = self.state();
        let owner = state
            .task(task_id)
            .map(|t| t.owner.clone())
            .ok_or_else(|| CouncilError::TaskNotFound(task_id.clone()))?;
        let signer = match self.registry.countersigner_for(&owner, &state.excluded_roles) {
            Some(signer) => signer,
            None => {
                self.journal.transition(
                    task_id,
                    TaskStatus::Escalated,
                    Some("no eligible countersigner".into()),
                    None,
                    now,
                )?;
                return self.route_gate(task_id, GateOutcome::Escalated, now);
            }
        };
        let (_, outcome) = self
            .gate
            .validate(&mut self.journal, task_id, &signer, verdict, reasons, now)?;
        self.route_gate(task_id, outcome, now)
    }

    fn gate_error(&mut self, task_id: &TaskId, reason: String, now: DateTime<Utc>) -> CouncilResult<()> {
        self.countersign(task_id, Verdict::Fail, vec![reason], now)
    }

    /// Implementations wait for a validate-phase reviewer; spawn one when
    /// nobody delegated it
    fn ensure_reviewer(&mut self, task_id: &TaskId, now: DateTime<Utc>) -> CouncilResult<()> {
        let reviewed = self
            .state()
            .graph
            .reviewers_of(task_id)
            .iter()
            .any(|r| !r.retired && r.status != TaskStatus::Rejected);
        if !reviewed {
            self.delegation.spawn_reviewer(&mut self.journal, task_id, now)?;
        }
        Ok(())
    }

    /// A reviewer finished: sign off the review, then apply its verdict
    fn judge(&mut self, reviewer: &Task, result: &serde_json::Value, now: DateTime<Utc>) -> CouncilResult<()> {
        let subject_id = match &reviewer.reviews {
            Some(subject) => subject.clone(),
            None => return self.countersign(&reviewer.id, Verdict::Pass, Vec::new(), now),
        };
        let report = match VerdictReport::from_result(result) {
            Ok(report) => report,
            Err(err) => {
                return self.gate_error(
                    &reviewer.id,
                    format!("{}: malformed verdict: {}", GATE_ERROR, err),
                    now,
                )
            }
        };

        self.countersign(&reviewer.id, Verdict::Pass, Vec::new(), now)?;
        if self.state().task(&reviewer.id).map(|t| t.status) != Some(TaskStatus::Accepted) {
            return Ok(());
        }

        let subject_status = self.state().task(&subject_id).map(|t| t.status);
        if subject_status != Some(TaskStatus::AwaitingValidation) {
            return self.journal.fault(
                format!(
                    "verdict from {} on {} arrived while it is {:?}",
                    reviewer.id, subject_id, subject_status
                ),
                Some(&subject_id),
                Some(&reviewer.owner),
                now,
            );
        }

        match self.gate.validate(
            &mut self.journal,
            &subject_id,
            &reviewer.owner,
            report.verdict,
            report.reasons,
            now,
        ) {
            Ok((_, outcome)) => self.route_gate(&subject_id, outcome, now),
            Err(err @ (CouncilError::SelfValidation { .. } | CouncilError::Authority { .. })) => self.gate_error(
                &subject_id,
                format!("{}: reviewer {} ineligible: {}", GATE_ERROR, reviewer.owner, err),
                now,
            ),
            Err(err) => Err(err),
        }
    }

    /// An override review finished: check and execute the decision
    fn decide(&mut self, review: &Task, result: &serde_json::Value, now: DateTime<Utc>) -> CouncilResult<()> {
        let crisis_id = match self.state().crisis_for_review(&review.id) {
            Some(case) => case.id.clone(),
            None => {
                self.journal.fault(
                    format!("override review {} has no open crisis", review.id),
                    Some(&review.id),
                    Some(&review.owner),
                    now,
                )?;
                return self.countersign(&review.id, Verdict::Pass, Vec::new(), now);
            }
        };
        let decision: OverrideDecision = match serde_json::from_value(result.clone()) {
            Ok(decision) => decision,
            Err(err) => {
                return self.gate_error(
                    &review.id,
                    format!("{}: malformed override decision: {}", GATE_ERROR, err),
                    now,
                )
            }
        };
        if let Err(err) = self
            .crisis
            .check_override(self.state(), &crisis_id, &decision, &review.owner)
        {
            return self.gate_error(&review.id, format!("{}: override refused: {}", GATE_ERROR, err), now);
        }

        self.countersign(&review.id, Verdict::Pass, Vec::new(), now)?;
        self.execute_override(&crisis_id, decision, &review.owner, now)
    }

    /// Follow a gate outcome: correct a rejection, escalate an exhaustion
    fn route_gate(&mut self, task_id: &TaskId, outcome: GateOutcome, now: DateTime<Utc>) -> CouncilResult<()> {
        match outcome {
            GateOutcome::Accepted => Ok(()),
            GateOutcome::Rejected => {
                let feedback = self
                    .state()
                    .active_validation(task_id)
                    .map(|r| r.reasons.clone())
                    .unwrap_or_default();
                let owner = self.correction_owner(task_id);
                self.delegation
                    .correct(&mut self.journal, task_id, feedback, owner, now)?;
                Ok(())
            }
            GateOutcome::Escalated => {
                let task = self
                    .state()
                    .task(task_id)
                    .cloned()
                    .ok_or_else(|| CouncilError::TaskNotFound(task_id.clone()))?;
                if task.phase == Phase::OverseeReview {
                    return self.fail_on_review(task_id, "override review exhausted its corrections".into(), now);
                }
                let reasons = self
                    .state()
                    .active_validation(task_id)
                    .map(|r| r.reasons.join("; "))
                    .unwrap_or_default();
                let trigger = CrisisTrigger::new(
                    CrisisKind::RepeatedValidationFailure,
                    task_id.clone(),
                    FailureOrigin::Substantive,
                )
                .against(task.owner.clone())
                .with_detail(format!(
                    "rejected in correction round {}: {}",
                    task.correction_round, reasons
                ));
                self.escalate(trigger, now).map(|_| ())
            }
        }
    }

    /// Excluded owners hand their corrective copies to a replacement
    fn correction_owner(&self, task_id: &TaskId) -> Option<RoleId> {
        let state = self.state();
        let owner = &state.task(task_id)?.owner;
        if state.excluded_roles.contains(owner) {
            self.registry.alternate_for(owner, &state.excluded_roles)
        } else {
            None
        }
    }

    // ── Crisis Routing ───────────────────────────────────────────────

    fn escalate(&mut self, trigger: CrisisTrigger, now: DateTime<Utc>) -> CouncilResult<CrisisId> {
        let (crisis_id, path) = self.crisis.open(&mut self.journal, trigger, now)?;
        match path {
            CrisisPath::AutoRetry => {
                self.apply_motion(&crisis_id, now)?;
                self.crisis
                    .resolve(&mut self.journal, &crisis_id, CrisisResolution::AutoRetried, now)?;
            }
            CrisisPath::Voting => self.queue_ballots(&crisis_id),
            CrisisPath::OverrideReview => self.open_override_review(&crisis_id, now)?,
        }
        Ok(crisis_id)
    }

    fn queue_ballots(&mut self, crisis_id: &CrisisId) {
        let state = self.journal.state();
        let case = match state.crisis(crisis_id) {
            Some(case) => case,
            None => return,
        };
        let deadline = case.vote_deadline.unwrap_or(case.opened_at);
        for role in &case.eligible_voters {
            if case.ballot_of(role).is_none() {
                self.dispatch.push(Dispatch::Deliberate(BallotRequest {
                    workflow_id: state.id.clone(),
                    role: role.clone(),
                    case: case.clone(),
                    deadline,
                }));
            }
        }
    }

    fn open_override_review(&mut self, crisis_id: &CrisisId, now: DateTime<Utc>) -> CouncilResult<()> {
        let review = self
            .delegation
            .spawn_override_review(&mut self.journal, crisis_id, now)?;
        self.crisis
            .enter_override_review(&mut self.journal, crisis_id, Some(review), now)
    }

    fn route_vote(&mut self, crisis_id: &CrisisId, resolution: VoteResolution, now: DateTime<Utc>) -> CouncilResult<()> {
        match resolution {
            VoteResolution::Pending => Ok(()),
            VoteResolution::Carried => {
                self.apply_motion(crisis_id, now)?;
                self.crisis
                    .resolve(&mut self.journal, crisis_id, CrisisResolution::MotionCarried, now)
            }
            VoteResolution::OverrideReview => self.open_override_review(crisis_id, now),
            VoteResolution::Failed => {
                self.crisis
                    .resolve(&mut self.journal, crisis_id, CrisisResolution::MotionFailed, now)?;
                // A failed retry motion leaves the escalated task with no way forward
                let stranded = match self.state().crisis(crisis_id).and_then(|c| c.motion.as_ref()) {
                    Some(Motion::RetryTask { task }) => self.state().task(task).is_some_and(Task::is_retryable),
                    _ => false,
                };
                if !stranded {
                    return Ok(());
                }
                let err = CouncilError::CrisisUnresolved {
                    crisis: crisis_id.clone(),
                    reason: "retry motion failed and no override is available".into(),
                };
                self.terminate(WorkflowStatus::Failed, err.to_string(), Some(crisis_id.clone()), now)
            }
        }
    }

    fn apply_motion(&mut self, crisis_id: &CrisisId, now: DateTime<Utc>) -> CouncilResult<()> {
        let motion = self
            .state()
            .crisis(crisis_id)
            .ok_or_else(|| CouncilError::CrisisNotFound(crisis_id.clone()))?
            .motion
            .clone();
        match motion {
            Some(Motion::RetryTask { task }) => {
                if !self.state().task(&task).is_some_and(Task::is_retryable) {
                    return self.journal.fault(
                        format!("motion on {} has nothing to retry", task),
                        Some(&task),
                        None,
                        now,
                    );
                }
                let feedback = self
                    .state()
                    .active_validation(&task)
                    .map(|r| r.reasons.clone())
                    .unwrap_or_default();
                let owner = self.correction_owner(&task);
                self.delegation
                    .correct(&mut self.journal, &task, feedback, owner, now)?;
                Ok(())
            }
            Some(Motion::ExcludeRole { role, replacement }) => {
                self.exclude_role(crisis_id, &role, &replacement, now)
            }
            None => Ok(()),
        }
    }

    fn exclude_role(
        &mut self,
        crisis_id: &CrisisId,
        role: &RoleId,
        replacement: &RoleId,
        now: DateTime<Utc>,
    ) -> CouncilResult<()> {
        self.journal.record(
            EventDraft::new(
                EventKind::RoleExcluded {
                    role: role.clone(),
                    replacement: replacement.clone(),
                },
                now,
            )
            .crisis(crisis_id)
            .role(role)
            .detail(format!("{} excluded; open work goes to {}", role, replacement)),
        )?;
        tracing::warn!(workflow_id = %self.id(), role = %role, replacement = %replacement, "Role excluded");

        let open_work: Vec<(TaskId, TaskStatus)> = self
            .state()
            .graph
            .tasks()
            .filter(|t| !t.retired && t.owner == *role)
            .filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Escalated
                )
            })
            .map(|t| (t.id.clone(), t.status))
            .collect();
        for (task_id, status) in open_work {
            self.hand_over(&task_id, status, role, replacement, format!("{} excluded", role), now)?;
        }
        Ok(())
    }

    /// Give a task to another role: unstarted tasks change owner, escalated
    /// ones get a corrective copy under the new owner
    fn hand_over(
        &mut self,
        task_id: &TaskId,
        status: TaskStatus,
        from: &RoleId,
        to: &RoleId,
        feedback: String,
        now: DateTime<Utc>,
    ) -> CouncilResult<()> {
        if status == TaskStatus::Escalated {
            self.delegation
                .correct(&mut self.journal, task_id, vec![feedback], Some(to.clone()), now)?;
            return Ok(());
        }
        self.journal.record(
            EventDraft::new(
                EventKind::OwnerReassigned {
                    from: from.clone(),
                    to: to.clone(),
                },
                now,
            )
            .task(task_id)
            .role(to)
            .detail(format!("{} reassigned from {} to {}", task_id, from, to)),
        )?;
        Ok(())
    }

    // ── Overrides ────────────────────────────────────────────────────

    fn execute_override(
        &mut self,
        crisis_id: &CrisisId,
        decision: OverrideDecision,
        overseer: &RoleId,
        now: DateTime<Utc>,
    ) -> CouncilResult<()> {
        let task_id = self
            .state()
            .crisis(crisis_id)
            .map(|c| c.task_id.clone())
            .ok_or_else(|| CouncilError::CrisisNotFound(crisis_id.clone()))?;
        let OverrideDecision {
            action,
            justification,
        } = decision;

        self.journal.record(
            EventDraft::new(
                EventKind::OverrideApplied {
                    action: action.clone(),
                    justification: justification.clone(),
                },
                now,
            )
            .task(&task_id)
            .role(overseer)
            .crisis(crisis_id)
            .detail(format!("{} on {}: {}", action, task_id, justification)),
        )?;
        tracing::warn!(
            workflow_id = %self.id(),
            crisis_id = %crisis_id,
            action = %action,
            "Override applied"
        );

        match &action {
            OverrideAction::ForceAccept => {
                self.gate
                    .force_accept(&mut self.journal, &task_id, overseer, &justification, now)?;
            }
            OverrideAction::ForceReject => self.force_reject(&task_id, overseer, now)?,
            OverrideAction::Reassign { role } => {
                let (status, from) = self
                    .state()
                    .task(&task_id)
                    .map(|t| (t.status, t.owner.clone()))
                    .ok_or_else(|| CouncilError::TaskNotFound(task_id.clone()))?;
                self.hand_over(
                    &task_id,
                    status,
                    &from,
                    role,
                    format!("reassigned by {}: {}", overseer, justification),
                    now,
                )?;
            }
            OverrideAction::AbortWorkflow => {}
        }

        self.crisis.resolve(
            &mut self.journal,
            crisis_id,
            CrisisResolution::Overridden {
                action: action.clone(),
            },
            now,
        )?;
        if action == OverrideAction::AbortWorkflow {
            self.terminate(WorkflowStatus::Aborted, justification, None, now)?;
        }
        Ok(())
    }

    /// Reject a task and everything waiting on it
    fn force_reject(&mut self, task_id: &TaskId, overseer: &RoleId, now: DateTime<Utc>) -> CouncilResult<()> {
        self.journal.transition(
            task_id,
            TaskStatus::Rejected,
            Some("override".into()),
            Some(overseer),
            now,
        )?;
        let cascade: Vec<TaskId> = {
            let state = self.state();
            state
                .graph
                .descendants(task_id)
                .into_iter()
                .filter(|d| state.task(d).is_some_and(|t| t.is_live()))
                .collect()
        };
        for descendant in cascade {
            self.journal.transition(
                &descendant,
                TaskStatus::Rejected,
                Some("dependency_rejected".into()),
                None,
                now,
            )?;
        }
        Ok(())
    }

    /// Close the crisis an override review was opened for after its review
    /// task failed for good
    fn fail_on_review(&mut self, review_id: &TaskId, reason: String, now: DateTime<Utc>) -> CouncilResult<()> {
        let crisis_id = self.state().crisis_for_review(review_id).map(|c| c.id.clone());
        match crisis_id {
            Some(crisis_id) => {
                self.crisis.resolve(
                    &mut self.journal,
                    &crisis_id,
                    CrisisResolution::Unresolved {
                        reason: reason.clone(),
                    },
                    now,
                )?;
                let err = CouncilError::CrisisUnresolved {
                    crisis: crisis_id.clone(),
                    reason,
                };
                self.terminate(WorkflowStatus::Failed, err.to_string(), Some(crisis_id), now)
            }
            None => {
                self.journal.fault(reason, Some(review_id), None, now)?;
                self.retire(review_id, "override review no longer needed", now)
            }
        }
    }

    /// Take a task out of the live graph without a replacement
    fn retire(&mut self, task_id: &TaskId, reason: &str, now: DateTime<Utc>) -> CouncilResult<()> {
        let status = self.state().task(task_id).map(|t| t.status);
        if status.is_some_and(|s| !s.is_terminal()) {
            self.journal
                .transition(task_id, TaskStatus::Rejected, Some(reason.into()), None, now)?;
        }
        self.journal.record(
            EventDraft::new(EventKind::TaskRetired { superseded_by: None }, now)
                .task(task_id)
                .detail(reason.to_string()),
        )?;
        Ok(())
    }

    fn terminate(
        &mut self,
        status: WorkflowStatus,
        reason: String,
        crisis: Option<CrisisId>,
        now: DateTime<Utc>,
    ) -> CouncilResult<()> {
        self.journal.record(
            EventDraft::new(
                EventKind::WorkflowTerminated {
                    status,
                    reason: reason.clone(),
                    crisis,
                },
                now,
            )
            .detail(reason.clone()),
        )?;
        self.dispatch.clear();
        tracing::warn!(workflow_id = %self.id(), status = %status, reason = %reason, "Workflow terminated");
        Ok(())
    }

    fn maybe_close(&mut self, now: DateTime<Utc>) -> CouncilResult<()> {
        let state = self.state();
        if state.is_closed() || !state.graph.all_terminal() || !state.open_crises().is_empty() {
            return Ok(());
        }
        let rejected: Vec<String> = state
            .graph
            .tasks()
            .filter(|t| !t.retired && t.status != TaskStatus::Accepted)
            .map(|t| t.id.to_string())
            .collect();
        let (status, reason) = if rejected.is_empty() {
            (WorkflowStatus::Completed, None)
        } else {
            (
                WorkflowStatus::Failed,
                Some(format!("tasks rejected: {}", rejected.join(", "))),
            )
        };
        self.journal.record(
            EventDraft::new(EventKind::WorkflowClosed { status, reason: reason.clone() }, now)
                .detail(reason.unwrap_or_else(|| "all tasks accepted".into())),
        )?;
        tracing::info!(workflow_id = %self.id(), status = %status, "Workflow closed");
        Ok(())
    }

    // ── External Operations ──────────────────────────────────────────

    fn ensure_active(&self) -> CouncilResult<()> {
        if self.is_closed() {
            Err(CouncilError::WorkflowClosed(self.id().clone()))
        } else {
            Ok(())
        }
    }

    /// Record a verdict from outside the executor loop
    pub fn validate(
        &mut self,
        task_id: &TaskId,
        role: &RoleId,
        verdict: Verdict,
        reasons: Vec<String>,
        now: DateTime<Utc>,
    ) -> CouncilResult<ValidationRecord> {
        self.ensure_active()?;
        let (record, outcome) = self
            .gate
            .validate(&mut self.journal, task_id, role, verdict, reasons, now)?;
        self.route_gate(task_id, outcome, now)?;
        self.maybe_close(now)?;
        Ok(record)
    }

    /// Create one sub-task of a running task. Refusals are logged against
    /// the parent's owner.
    pub fn delegate(&mut self, parent: &TaskId, request: DelegationRequest, now: DateTime<Utc>) -> CouncilResult<TaskId> {
        self.ensure_active()?;
        match self.delegation.delegate(&mut self.journal, parent, request, now) {
            Ok(id) => Ok(id),
            Err(err @ CouncilError::Replay(_)) => Err(err),
            Err(err) => {
                if let Some(owner) = self.state().task(parent).map(|t| t.owner.clone()) {
                    let before = self.state().strikes(&owner);
                    self.refuse(parent, &owner, &err, now)?;
                    self.check_strikes(&owner, parent, before, now)?;
                }
                Err(err)
            }
        }
    }

    pub fn cast_vote(
        &mut self,
        crisis_id: &CrisisId,
        role: &RoleId,
        ballot: Ballot,
        now: DateTime<Utc>,
    ) -> CouncilResult<VoteOutcome> {
        self.ensure_active()?;
        let resolution = self
            .crisis
            .cast_vote(&mut self.journal, crisis_id, role, ballot, now)?;
        self.route_vote(crisis_id, resolution, now)?;
        self.maybe_close(now)?;
        Ok(resolution.outcome())
    }

    /// Apply an Overseer decision directly, without waiting for the
    /// override review task
    pub fn apply_override(
        &mut self,
        crisis_id: &CrisisId,
        decision: OverrideDecision,
        acting_role: &RoleId,
        now: DateTime<Utc>,
    ) -> CouncilResult<()> {
        self.ensure_active()?;
        self.crisis
            .check_override(self.state(), crisis_id, &decision, acting_role)?;
        let review = self
            .state()
            .crisis(crisis_id)
            .and_then(|c| c.review_task.clone())
            .map(|t| current_version(self.state(), &t));
        self.execute_override(crisis_id, decision, acting_role, now)?;
        if let Some(review) = review {
            if !self.is_closed() {
                self.retire(&review, "override applied directly", now)?;
            }
        }
        self.maybe_close(now)
    }

    /// Open a no-confidence case against a role
    pub fn raise_no_confidence(
        &mut self,
        against: &RoleId,
        raised_by: &RoleId,
        now: DateTime<Utc>,
    ) -> CouncilResult<CrisisId> {
        self.ensure_active()?;
        let raiser = self.registry.require(raised_by)?;
        self.registry.require(against)?;
        if !raiser.authority.can_vote() || raised_by == against {
            return Err(CouncilError::authority(
                raised_by,
                format!("raise no confidence in {}", against),
            ));
        }
        if against == self.registry.overseer() {
            return Err(CouncilError::authority(raised_by, "raise no confidence in the overseer"));
        }

        let state = self.state();
        let task = state
            .graph
            .tasks()
            .filter(|t| t.is_live() && t.owner == *against)
            .min_by_key(|t| t.created_seq)
            .map(|t| t.id.clone())
            .unwrap_or_else(|| current_version(state, &state.root));
        let trigger = CrisisTrigger::new(CrisisKind::NoConfidence, task, FailureOrigin::Substantive)
            .against(against.clone())
            .with_detail(format!("raised by {}", raised_by));
        self.escalate(trigger, now)
    }

    /// Stop the workflow; open work is swept to `Rejected`
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> CouncilResult<()> {
        self.ensure_active()?;
        self.terminate(WorkflowStatus::Cancelled, reason.into(), None, now)
    }
}

/// Latest corrective copy of a task
fn current_version(state: &WorkflowState, id: &TaskId) -> TaskId {
    let mut current = id.clone();
    while let Some(next) = state.task(&current).and_then(|t| t.superseded_by.clone()) {
        current = next;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn registry() -> Arc<RoleRegistry> {
        Arc::new(RoleRegistry::load(RegistryConfig::standard()).unwrap())
    }

    fn engine() -> WorkflowEngine {
        engine_with(CouncilPolicy::default())
    }

    fn engine_with(policy: CouncilPolicy) -> WorkflowEngine {
        WorkflowEngine::submit(WorkflowId::new("wf"), json!({"goal": "report"}), registry(), policy, Utc::now())
            .unwrap()
    }

    fn executions(dispatches: Vec<Dispatch>) -> Vec<TaskInvocation> {
        dispatches
            .into_iter()
            .filter_map(|d| match d {
                Dispatch::Execute(invocation) => Some(invocation),
                Dispatch::Deliberate(_) => None,
            })
            .collect()
    }

    fn succeed(engine: &mut WorkflowEngine, invocation: &TaskInvocation, output: ExecutionOutput) {
        engine
            .complete(
                &invocation.task_id,
                invocation.attempt,
                ExecutionOutcome::Succeeded(output),
                Utc::now(),
            )
            .unwrap();
    }

    fn pass() -> ExecutionOutput {
        ExecutionOutput::new(VerdictReport::pass().to_value())
    }

    /// Tick and answer every dispatch with `answer` until nothing is left
    fn drive(engine: &mut WorkflowEngine, mut answer: impl FnMut(&TaskInvocation) -> ExecutionOutput) {
        for _ in 0..50 {
            let work = executions(engine.tick(Utc::now(), 8).unwrap());
            if work.is_empty() {
                return;
            }
            for invocation in &work {
                let output = answer(invocation);
                succeed(engine, invocation, output);
            }
        }
        panic!("workflow did not settle");
    }

    #[test]
    fn test_plan_implement_review_completes() {
        let mut engine = engine();
        drive(&mut engine, |inv| match inv.phase {
            Phase::Propose => ExecutionOutput::new(json!("plan"))
                .with_delegation(DelegationRequest::new("implementer", Phase::Implement).with_payload(json!("draft"))),
            Phase::Implement => ExecutionOutput::new(json!("report body")),
            _ => pass(),
        });

        let state = engine.state();
        assert_eq!(state.status, WorkflowStatus::Completed);
        // root, implementation, spawned reviewer
        assert_eq!(state.graph.len(), 3);
        assert!(state.graph.tasks().all(|t| t.status == TaskStatus::Accepted));
        let implementation = state.task(&TaskId::sequential(2)).unwrap();
        let record = state.active_validation(&implementation.id).unwrap();
        assert_eq!(record.validating_role, RoleId::new("validator"));
    }

    #[test]
    fn test_failed_review_triggers_corrective_copy() {
        let mut engine = engine();
        let mut verdicts = vec![VerdictReport::fail(["missing totals"]), VerdictReport::pass()].into_iter();
        drive(&mut engine, |inv| match inv.phase {
            Phase::Propose => ExecutionOutput::new(json!("plan"))
                .with_delegation(DelegationRequest::new("implementer", Phase::Implement)),
            Phase::Implement => ExecutionOutput::new(json!({"feedback": inv.context.feedback})),
            _ => ExecutionOutput::new(verdicts.next().unwrap().to_value()),
        });

        let state = engine.state();
        assert_eq!(state.status, WorkflowStatus::Completed);
        let original = state.task(&TaskId::sequential(2)).unwrap();
        assert!(original.retired);
        let copy = state.task(original.superseded_by.as_ref().unwrap()).unwrap();
        assert_eq!(copy.status, TaskStatus::Accepted);
        assert_eq!(copy.feedback, vec!["missing totals".to_string()]);
        assert_eq!(copy.result, Some(json!({"feedback": ["missing totals"]})));
    }

    #[test]
    fn test_unauthorised_request_is_dropped_alone() {
        let mut engine = engine();
        let work = executions(engine.tick(Utc::now(), 8).unwrap());
        let root = &work[0];
        succeed(
            &mut engine,
            root,
            ExecutionOutput::new(json!("plan"))
                .with_delegation(DelegationRequest::new("implementer", Phase::Implement))
                .with_delegation(DelegationRequest::new("overseer", Phase::OverseeReview)),
        );

        let state = engine.state();
        assert_eq!(state.strikes(&RoleId::new("planner")), 1);
        let parent = state.task(&root.task_id).unwrap();
        assert_eq!(parent.status, TaskStatus::Accepted);
        assert!(!parent.retired);
        assert!(!state.active_validation(&root.task_id).unwrap().is_gate_error());
        // root and the permitted implementation, no corrective copy
        assert_eq!(state.graph.len(), 2);
        assert_eq!(state.task(&TaskId::sequential(2)).unwrap().owner, RoleId::new("implementer"));
        assert!(state.graph.tasks().all(|t| t.owner != RoleId::new("overseer")));

        let events = engine.drain_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e.kind, EventKind::DelegationRefused { authority: true, .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_malformed_batch_fails_parent() {
        let mut engine = engine();
        let work = executions(engine.tick(Utc::now(), 8).unwrap());
        succeed(
            &mut engine,
            &work[0],
            ExecutionOutput::new(json!("plan"))
                .with_delegation(DelegationRequest::new("implementer", Phase::Implement).depends_on(DependencyRef::Sibling(1)))
                .with_delegation(DelegationRequest::new("implementer", Phase::Implement).depends_on(DependencyRef::Sibling(0))),
        );

        let state = engine.state();
        assert_eq!(state.strikes(&RoleId::new("planner")), 0);
        assert!(state.active_validation(&work[0].task_id).unwrap().is_gate_error());
        assert!(state.task(&work[0].task_id).unwrap().retired);
    }

    #[test]
    fn test_second_strike_opens_authority_crisis() {
        let mut engine = engine();
        let work = executions(engine.tick(Utc::now(), 8).unwrap());
        succeed(
            &mut engine,
            &work[0],
            ExecutionOutput::new(json!("plan"))
                .with_delegation(DelegationRequest::new("overseer", Phase::OverseeReview))
                .with_delegation(DelegationRequest::new("implementer", Phase::Validate)),
        );
        assert_eq!(engine.state().strikes(&RoleId::new("planner")), 2);
        let crises = engine.open_crises();
        assert_eq!(crises.len(), 1);
        assert_eq!(crises[0].kind, CrisisKind::AuthorityViolation);
        // planner has no same-level alternate, so the Overseer decides
        assert_eq!(crises[0].status, CrisisStatus::OverrideReview);
    }

    #[test]
    fn test_exhausted_corrections_open_vote() {
        let mut policy = CouncilPolicy::default();
        policy.validation.max_corrections = 0;
        let mut engine = engine_with(policy);
        drive(&mut engine, |inv| match inv.phase {
            Phase::Propose => ExecutionOutput::new(json!("plan"))
                .with_delegation(DelegationRequest::new("implementer", Phase::Implement)),
            Phase::Implement => ExecutionOutput::new(json!("weak")),
            _ => ExecutionOutput::new(VerdictReport::fail(["wrong"]).to_value()),
        });

        let crises = engine.open_crises();
        assert_eq!(crises.len(), 1);
        assert_eq!(crises[0].kind, CrisisKind::RepeatedValidationFailure);
        assert_eq!(crises[0].status, CrisisStatus::Voting);
        assert_eq!(
            engine.state().task(&crises[0].task_id).unwrap().status,
            TaskStatus::Escalated
        );
    }

    #[test]
    fn test_failed_vote_goes_to_override_then_force_reject() {
        let mut policy = CouncilPolicy::default();
        policy.validation.max_corrections = 0;
        policy.crisis.override_on_vote_failure = true;
        let mut engine = engine_with(policy);
        drive(&mut engine, |inv| match inv.phase {
            Phase::Propose => ExecutionOutput::new(json!("plan"))
                .with_delegation(DelegationRequest::new("implementer", Phase::Implement)),
            Phase::Implement => ExecutionOutput::new(json!("weak")),
            _ => ExecutionOutput::new(VerdictReport::fail(["wrong"]).to_value()),
        });
        let case = engine.open_crises().remove(0);
        let now = Utc::now();
        let mut outcome = VoteOutcome::Pending;
        for role in &case.eligible_voters {
            outcome = engine.cast_vote(&case.id, role, Ballot::Oppose, now).unwrap();
        }
        assert_eq!(outcome, VoteOutcome::Failed);
        let case = engine.state().crisis(&case.id).unwrap().clone();
        assert_eq!(case.status, CrisisStatus::OverrideReview);

        // The Overseer's review task rejects the escalated implementation
        let work = executions(engine.tick(Utc::now(), 8).unwrap());
        let review = work.iter().find(|i| i.phase == Phase::OverseeReview).unwrap();
        assert_eq!(review.context.crisis.as_ref().map(|c| c.id.clone()), Some(case.id.clone()));
        let decision = OverrideDecision::new(OverrideAction::ForceReject, "not salvageable");
        succeed(&mut engine, review, ExecutionOutput::new(serde_json::to_value(&decision).unwrap()));

        let state = engine.state();
        assert_eq!(state.crisis(&case.id).unwrap().status, CrisisStatus::Overridden);
        assert_eq!(state.task(&case.task_id).unwrap().status, TaskStatus::Rejected);
        assert_eq!(state.status, WorkflowStatus::Failed);
    }

    #[test]
    fn test_unresolved_vote_fails_workflow() {
        let mut policy = CouncilPolicy::default();
        policy.validation.max_corrections = 0;
        let mut engine = engine_with(policy);
        drive(&mut engine, |inv| match inv.phase {
            Phase::Propose => ExecutionOutput::new(json!("plan"))
                .with_delegation(DelegationRequest::new("implementer", Phase::Implement)),
            Phase::Implement => ExecutionOutput::new(json!("weak")),
            _ => ExecutionOutput::new(VerdictReport::fail(["wrong"]).to_value()),
        });
        let case = engine.open_crises().remove(0);

        // Nobody votes before the deadline
        let later = Utc::now() + Duration::milliseconds(engine.policy.crisis.vote_timeout_ms as i64 + 1);
        assert!(engine.tick(later, 8).unwrap().is_empty());

        let state = engine.state();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.unresolved_crisis, Some(case.id.clone()));
        assert!(state.graph.tasks().all(|t| t.is_terminal()));
    }

    #[test]
    fn test_timeouts_retry_then_escalate() {
        let mut policy = CouncilPolicy::default();
        policy.scheduler.max_attempts = 2;
        policy.scheduler.task_timeout_ms = 1_000;
        policy.scheduler.backoff_base_ms = 10;
        let mut engine = engine_with(policy);
        let mut now = Utc::now();

        let work = executions(engine.tick(now, 8).unwrap());
        assert_eq!(work[0].attempt, 1);
        now += Duration::seconds(2);
        assert!(executions(engine.tick(now, 8).unwrap()).is_empty());

        now += Duration::seconds(1);
        let work = executions(engine.tick(now, 8).unwrap());
        assert_eq!(work[0].attempt, 2);

        // The stale first attempt reporting late changes nothing
        engine
            .complete(&work[0].task_id, 1, ExecutionOutcome::Succeeded(ExecutionOutput::default()), now)
            .unwrap();
        assert_eq!(engine.state().task(&work[0].task_id).unwrap().status, TaskStatus::Running);

        now += Duration::seconds(2);
        engine.tick(now, 8).unwrap();
        let crises = engine.open_crises();
        assert_eq!(crises.len(), 1);
        assert_eq!(crises[0].origin, FailureOrigin::Infrastructure);
    }

    #[test]
    fn test_capacity_limits_admission() {
        let mut engine = engine();
        let work = executions(engine.tick(Utc::now(), 8).unwrap());
        let mut output = ExecutionOutput::new(json!("plan"));
        for _ in 0..4 {
            output = output.with_delegation(DelegationRequest::new("implementer", Phase::Implement));
        }
        succeed(&mut engine, &work[0], output);

        let first = executions(engine.tick(Utc::now(), 3).unwrap());
        assert_eq!(first.len(), 3);
        let ids: Vec<TaskId> = first.iter().map(|i| i.task_id.clone()).collect();
        assert_eq!(ids, vec![TaskId::sequential(2), TaskId::sequential(3), TaskId::sequential(4)]);
        assert!(executions(engine.tick(Utc::now(), 0).unwrap()).is_empty());
        assert_eq!(engine.running_count(), 3);
    }

    #[test]
    fn test_cancel_sweeps_and_rejects_late_results() {
        let mut engine = engine();
        let work = executions(engine.tick(Utc::now(), 8).unwrap());
        engine.cancel("operator request", Utc::now()).unwrap();
        assert_eq!(engine.state().status, WorkflowStatus::Cancelled);
        assert!(matches!(
            engine.cancel("again", Utc::now()),
            Err(CouncilError::WorkflowClosed(_))
        ));

        succeed(&mut engine, &work[0], ExecutionOutput::new(json!("late")));
        let root = engine.state().task(&work[0].task_id).unwrap();
        assert_eq!(root.status, TaskStatus::Rejected);
        assert_eq!(root.status_reason.as_deref(), Some("workflow_cancelled"));
        let events = engine.drain_events();
        assert!(matches!(events.last().unwrap().kind, EventKind::Fault { .. }));
    }

    #[test]
    fn test_no_confidence_vote_excludes_role() {
        let config = RegistryConfig::standard().with_role(Role::new("implementer-b", AuthorityLevel::Implement));
        let registry = Arc::new(RoleRegistry::load(config).unwrap());
        let mut engine = WorkflowEngine::submit(
            WorkflowId::new("wf"),
            json!(null),
            registry,
            CouncilPolicy::default(),
            Utc::now(),
        )
        .unwrap();
        let work = executions(engine.tick(Utc::now(), 8).unwrap());
        succeed(
            &mut engine,
            &work[0],
            ExecutionOutput::new(json!("plan")).with_delegation(DelegationRequest::new("implementer", Phase::Implement)),
        );

        let now = Utc::now();
        let crisis_id = engine
            .raise_no_confidence(&RoleId::new("implementer"), &RoleId::new("validator"), now)
            .unwrap();
        let voters = engine.state().crisis(&crisis_id).unwrap().eligible_voters.clone();
        for role in &voters {
            engine.cast_vote(&crisis_id, role, Ballot::Support, now).unwrap();
        }

        let state = engine.state();
        assert!(state.excluded_roles.contains(&RoleId::new("implementer")));
        assert_eq!(state.task(&TaskId::sequential(2)).unwrap().owner, RoleId::new("implementer-b"));
        assert_eq!(state.crisis(&crisis_id).unwrap().status, CrisisStatus::Resolved);
    }

    fn engine_with_alternate(policy: CouncilPolicy) -> WorkflowEngine {
        let config = RegistryConfig::standard().with_role(Role::new("implementer-b", AuthorityLevel::Implement));
        let registry = Arc::new(RoleRegistry::load(config).unwrap());
        let mut engine =
            WorkflowEngine::submit(WorkflowId::new("wf"), json!(null), registry, policy, Utc::now()).unwrap();
        let work = executions(engine.tick(Utc::now(), 8).unwrap());
        succeed(
            &mut engine,
            &work[0],
            ExecutionOutput::new(json!("plan")).with_delegation(DelegationRequest::new("implementer", Phase::Implement)),
        );
        engine
    }

    #[test]
    fn test_failed_no_confidence_vote_closes_case() {
        let mut engine = engine_with_alternate(CouncilPolicy::default());
        let now = Utc::now();
        let crisis_id = engine
            .raise_no_confidence(&RoleId::new("implementer"), &RoleId::new("validator"), now)
            .unwrap();
        let voters: Vec<RoleId> = engine.state().crisis(&crisis_id).unwrap().eligible_voters.iter().cloned().collect();
        assert_eq!(voters.len(), 3);
        let mut outcome = VoteOutcome::Pending;
        for (role, ballot) in voters.iter().zip([Ballot::Oppose, Ballot::Oppose, Ballot::Support]) {
            outcome = engine.cast_vote(&crisis_id, role, ballot, now).unwrap();
        }
        assert_eq!(outcome, VoteOutcome::Failed);

        let state = engine.state();
        let case = state.crisis(&crisis_id).unwrap();
        assert_eq!(case.status, CrisisStatus::Resolved);
        assert_eq!(case.resolution, Some(CrisisResolution::MotionFailed));
        assert!(case.review_task.is_none());
        assert!(!state.excluded_roles.contains(&RoleId::new("implementer")));
        assert_eq!(state.task(&TaskId::sequential(2)).unwrap().owner, RoleId::new("implementer"));
        assert_eq!(state.status, WorkflowStatus::Active);
        assert!(state.graph.tasks().all(|t| t.phase != Phase::OverseeReview));
    }

    #[test]
    fn test_minor_crises_auto_retry_without_vote() {
        let mut policy = CouncilPolicy::default();
        policy.crisis.severity.no_confidence = Severity::Minor;
        let mut engine = engine_with_alternate(policy);
        let crisis_id = engine
            .raise_no_confidence(&RoleId::new("implementer"), &RoleId::new("validator"), Utc::now())
            .unwrap();

        let state = engine.state();
        let case = state.crisis(&crisis_id).unwrap();
        assert_eq!(case.status, CrisisStatus::Resolved);
        assert_eq!(case.resolution, Some(CrisisResolution::AutoRetried));
        assert!(case.eligible_voters.is_empty());
        assert!(!state.excluded_roles.contains(&RoleId::new("implementer")));
        assert!(engine.take_dispatches().iter().all(|d| matches!(d, Dispatch::Execute(_))));

        drive(&mut engine, |inv| match inv.phase {
            Phase::Implement => ExecutionOutput::new(json!("body")),
            _ => pass(),
        });
        assert_eq!(engine.state().status, WorkflowStatus::Completed);
    }

    #[test]
    fn test_minor_repeated_failure_retries_escalated_task() {
        let mut policy = CouncilPolicy::default();
        policy.validation.max_corrections = 0;
        policy.crisis.severity.repeated_validation_failure = Severity::Minor;
        let mut engine = engine_with(policy);
        let mut verdicts = vec![VerdictReport::fail(["wrong"]), VerdictReport::pass()].into_iter();
        drive(&mut engine, |inv| match inv.phase {
            Phase::Propose => ExecutionOutput::new(json!("plan"))
                .with_delegation(DelegationRequest::new("implementer", Phase::Implement)),
            Phase::Implement => ExecutionOutput::new(json!("body")),
            _ => ExecutionOutput::new(verdicts.next().unwrap().to_value()),
        });

        let state = engine.state();
        assert_eq!(state.status, WorkflowStatus::Completed);
        let case = state.crisis(&CrisisId::sequential(1)).unwrap();
        assert_eq!(case.kind, CrisisKind::RepeatedValidationFailure);
        assert_eq!(case.resolution, Some(CrisisResolution::AutoRetried));
        assert!(case.tally.is_none());
        let original = state.task(&TaskId::sequential(2)).unwrap();
        assert!(original.retired);
    }

    #[test]
    fn test_no_confidence_rules() {
        let mut engine = engine();
        let now = Utc::now();
        assert!(engine
            .raise_no_confidence(&RoleId::new("implementer"), &RoleId::new("planner"), now)
            .unwrap_err()
            .is_authority());
        assert!(engine
            .raise_no_confidence(&RoleId::new("overseer"), &RoleId::new("validator"), now)
            .unwrap_err()
            .is_authority());
    }

    #[test]
    fn test_restore_matches_live_engine() {
        let mut engine = engine();
        let mut log = Vec::new();
        drive(&mut engine, |inv| match inv.phase {
            Phase::Propose => ExecutionOutput::new(json!("plan"))
                .with_delegation(DelegationRequest::new("implementer", Phase::Implement)),
            Phase::Implement => ExecutionOutput::new(json!("body")),
            _ => pass(),
        });
        log.extend(engine.drain_events());

        let rebuilt = WorkflowState::replay(None, &log).unwrap();
        assert_eq!(&rebuilt, engine.state());
        let restored = WorkflowEngine::restore(rebuilt, registry(), CouncilPolicy::default());
        assert_eq!(restored.summary().status, WorkflowStatus::Completed);
    }
}
