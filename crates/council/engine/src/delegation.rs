//! Delegation engine: creates sub-tasks under authority checks
//!
//! Requests from one executor output form a batch. Every request is checked
//! for authority, references are resolved, and the extended graph is checked
//! for cycles before anything is recorded, so a refused batch leaves the
//! graph exactly as it was.
//!
//! Executor output is screened first: requests outside the owner's
//! authority are dropped (with any sibling that refers to them) and the
//! rest go through as one batch.
//!
//! The engine also creates the tasks the system itself needs: reviewers for
//! implementations, corrective copies of rejected tasks, and override
//! reviews for crisis cases.

use crate::{EventDraft, Journal, TaskGraph, WorkflowState};
use chrono::{DateTime, Utc};
use council_types::*;
use std::collections::BTreeSet;
use std::sync::Arc;

/// An executor's batch split by authority
#[derive(Clone, Debug, Default)]
pub struct ScreenedBatch {
    /// Requests the owner may make, sibling references renumbered
    pub permitted: Vec<DelegationRequest>,
    /// One error per dropped request
    pub refused: Vec<CouncilError>,
}

#[derive(Clone, Debug)]
pub struct DelegationEngine {
    registry: Arc<RoleRegistry>,
}

impl DelegationEngine {
    pub fn new(registry: Arc<RoleRegistry>) -> Self {
        Self { registry }
    }

    /// Create one sub-task under `parent`
    pub fn delegate(
        &self,
        journal: &mut Journal,
        parent: &TaskId,
        request: DelegationRequest,
        at: DateTime<Utc>,
    ) -> CouncilResult<TaskId> {
        self.delegate_batch(journal, parent, vec![request], at)?
            .into_iter()
            .next()
            .ok_or_else(|| CouncilError::InvalidDelegation("empty delegation batch".into()))
    }

    /// Split `requests` from the owner of `parent_id` into the ones it may
    /// make and the refused ones. A request that refers to a refused
    /// sibling is refused too.
    pub fn screen(
        &self,
        state: &WorkflowState,
        parent_id: &TaskId,
        requests: Vec<DelegationRequest>,
    ) -> CouncilResult<ScreenedBatch> {
        let delegator = state
            .task(parent_id)
            .map(|t| t.owner.clone())
            .ok_or_else(|| CouncilError::TaskNotFound(parent_id.clone()))?;
        let mut refusals: Vec<Option<CouncilError>> = requests
            .iter()
            .map(|r| self.authorize(&delegator, r, &state.excluded_roles).err())
            .collect();

        let mut spreading = true;
        while spreading {
            spreading = false;
            for (index, request) in requests.iter().enumerate() {
                if refusals[index].is_some() {
                    continue;
                }
                let refused_sibling =
                    sibling_refs(request).find(|s| refusals.get(*s).is_some_and(Option::is_some));
                if let Some(sibling) = refused_sibling {
                    refusals[index] = Some(CouncilError::InvalidDelegation(format!(
                        "request {} refers to refused request {}",
                        index, sibling
                    )));
                    spreading = true;
                }
            }
        }

        let mut positions = Vec::with_capacity(requests.len());
        let mut kept = 0;
        for refusal in &refusals {
            if refusal.is_none() {
                positions.push(Some(kept));
                kept += 1;
            } else {
                positions.push(None);
            }
        }

        let mut screened = ScreenedBatch::default();
        for (mut request, refusal) in requests.into_iter().zip(refusals) {
            match refusal {
                Some(err) => screened.refused.push(err),
                None => {
                    renumber(&mut request, &positions);
                    screened.permitted.push(request);
                }
            }
        }
        Ok(screened)
    }

    /// Create all requested sub-tasks, or none of them
    pub fn delegate_batch(
        &self,
        journal: &mut Journal,
        parent_id: &TaskId,
        requests: Vec<DelegationRequest>,
        at: DateTime<Utc>,
    ) -> CouncilResult<Vec<TaskId>> {
        let state = journal.state();
        if state.is_closed() {
            return Err(CouncilError::WorkflowClosed(state.id.clone()));
        }
        let parent = state
            .task(parent_id)
            .ok_or_else(|| CouncilError::TaskNotFound(parent_id.clone()))?;
        if !matches!(
            parent.status,
            TaskStatus::Running | TaskStatus::AwaitingValidation
        ) {
            return Err(CouncilError::InvalidDelegation(format!(
                "parent {} is {}, not running or awaiting validation",
                parent_id, parent.status
            )));
        }
        let delegator = parent.owner.clone();

        for request in &requests {
            self.authorize(&delegator, request, &state.excluded_roles)?;
        }

        let base = state.next_task_seq;
        let ids: Vec<TaskId> = (0..requests.len() as u64)
            .map(|i| TaskId::sequential(base + i))
            .collect();

        let mut new_tasks = Vec::with_capacity(requests.len());
        let mut extra_edges: Vec<(TaskId, TaskId)> = Vec::new();
        for (index, request) in requests.iter().enumerate() {
            let mut task = Task::new(
                ids[index].clone(),
                base + index as u64,
                request.phase,
                request.target_role.clone(),
                request.payload.clone(),
                at,
            )
            .with_parent(parent_id.clone());

            for dependency in &request.depends_on {
                task.dependencies
                    .insert(resolve(dependency, &ids, &state.graph)?);
            }
            if let Some(subject) = &request.reviews {
                if !request.phase.is_review() {
                    return Err(CouncilError::InvalidDelegation(format!(
                        "{} tasks cannot review another task",
                        request.phase
                    )));
                }
                task.reviews = Some(resolve(subject, &ids, &state.graph)?);
            }
            for waiting in &request.required_by {
                let waiting_id = resolve(waiting, &ids, &state.graph)?;
                if let Some(existing) = state.task(&waiting_id) {
                    if !matches!(existing.status, TaskStatus::Pending | TaskStatus::Ready) {
                        return Err(CouncilError::InvalidDelegation(format!(
                            "{} is {} and can no longer gain dependencies",
                            waiting_id, existing.status
                        )));
                    }
                }
                extra_edges.push((waiting_id, ids[index].clone()));
            }
            new_tasks.push(task);
        }

        // Edges into sibling tasks become plain dependencies
        let mut existing_edges = Vec::new();
        for (waiting, prerequisite) in extra_edges {
            match new_tasks.iter_mut().find(|t| t.id == waiting) {
                Some(task) => {
                    task.dependencies.insert(prerequisite);
                }
                None => existing_edges.push((waiting, prerequisite)),
            }
        }

        let mut scratch = state.graph.clone();
        for task in &new_tasks {
            scratch.insert(task.clone());
        }
        for (waiting, prerequisite) in &existing_edges {
            if let Some(task) = scratch.get_mut(waiting) {
                task.dependencies.insert(prerequisite.clone());
            }
        }
        if let Some(cycle) = scratch.find_cycle() {
            return Err(CouncilError::Cycle(cycle));
        }

        // Checks passed: record the batch
        for task in new_tasks {
            let detail = format!(
                "{} delegated {} task {} to {}",
                delegator, task.phase, task.id, task.owner
            );
            let id = task.id.clone();
            journal.record(
                EventDraft::new(EventKind::TaskDelegated { task }, at)
                    .task(&id)
                    .role(&delegator)
                    .detail(detail),
            )?;
        }
        for (waiting, prerequisite) in existing_edges {
            let was_ready = journal
                .state()
                .task(&waiting)
                .is_some_and(|t| t.status == TaskStatus::Ready);
            journal.record(
                EventDraft::new(
                    EventKind::DependencyAdded {
                        on: prerequisite.clone(),
                    },
                    at,
                )
                .task(&waiting)
                .role(&delegator)
                .detail(format!("{} now waits on {}", waiting, prerequisite)),
            )?;
            if was_ready {
                journal.transition(
                    &waiting,
                    TaskStatus::Pending,
                    Some("new dependency".into()),
                    Some(&delegator),
                    at,
                )?;
            }
        }

        tracing::debug!(
            workflow_id = %journal.state().id,
            parent = %parent_id,
            count = ids.len(),
            "Delegation batch applied"
        );
        Ok(ids)
    }

    fn authorize(
        &self,
        delegator: &RoleId,
        request: &DelegationRequest,
        excluded: &BTreeSet<RoleId>,
    ) -> CouncilResult<()> {
        let target = &request.target_role;
        let allowed = !excluded.contains(delegator)
            && !excluded.contains(target)
            && self.registry.can_delegate(delegator, target, request.phase);
        if allowed {
            Ok(())
        } else {
            Err(CouncilError::authority(
                delegator,
                format!("delegate {} work to {}", request.phase, target),
            ))
        }
    }

    // ── System Tasks ─────────────────────────────────────────────────

    /// Spawn a `Validate` task for an implementation that has none
    pub fn spawn_reviewer(
        &self,
        journal: &mut Journal,
        subject_id: &TaskId,
        at: DateTime<Utc>,
    ) -> CouncilResult<TaskId> {
        let state = journal.state();
        let subject = state
            .task(subject_id)
            .ok_or_else(|| CouncilError::TaskNotFound(subject_id.clone()))?;
        let reviewer = self
            .registry
            .reviewer_for(&subject.owner, &state.excluded_roles)
            .ok_or_else(|| CouncilError::authority(&subject.owner, "find a reviewer"))?;

        let task = Task::new(
            TaskId::sequential(state.next_task_seq),
            state.next_task_seq,
            Phase::Validate,
            reviewer,
            serde_json::json!({ "review": subject_id }),
            at,
        )
        .with_parent(subject_id.clone())
        .with_reviews(subject_id.clone());
        self.spawn(journal, task, format!("reviewer spawned for {}", subject_id), at)
    }

    /// Spawn the Overseer's review task for a crisis case
    pub fn spawn_override_review(
        &self,
        journal: &mut Journal,
        crisis_id: &CrisisId,
        at: DateTime<Utc>,
    ) -> CouncilResult<TaskId> {
        let state = journal.state();
        let case = state
            .crisis(crisis_id)
            .ok_or_else(|| CouncilError::CrisisNotFound(crisis_id.clone()))?;
        let payload = serde_json::json!({
            "crisis": case.id,
            "kind": case.kind,
            "severity": case.severity,
            "task": case.task_id,
            "detail": case.detail,
        });
        let task = Task::new(
            TaskId::sequential(state.next_task_seq),
            state.next_task_seq,
            Phase::OverseeReview,
            self.registry.overseer().clone(),
            payload,
            at,
        )
        .with_parent(case.task_id.clone());
        self.spawn(journal, task, format!("override review opened for {}", crisis_id), at)
    }

    fn spawn(
        &self,
        journal: &mut Journal,
        task: Task,
        detail: String,
        at: DateTime<Utc>,
    ) -> CouncilResult<TaskId> {
        let id = task.id.clone();
        journal.record(
            EventDraft::new(EventKind::TaskDelegated { task }, at)
                .task(&id)
                .detail(detail),
        )?;
        Ok(id)
    }

    // ── Corrective Re-delegation ─────────────────────────────────────

    /// Replace a rejected or escalated task with a fresh copy.
    ///
    /// The copy inherits the original's parent, phase, dependencies and
    /// authorization. Waiting dependents are rewired to it and unstarted
    /// reviewers are retargeted; when an implementation has no such
    /// reviewer, its most recent one is cloned for the copy.
    pub fn correct(
        &self,
        journal: &mut Journal,
        original_id: &TaskId,
        feedback: Vec<String>,
        new_owner: Option<RoleId>,
        at: DateTime<Utc>,
    ) -> CouncilResult<TaskId> {
        let state = journal.state();
        let original = state
            .task(original_id)
            .cloned()
            .ok_or_else(|| CouncilError::TaskNotFound(original_id.clone()))?;
        if original.retired
            || !matches!(
                original.status,
                TaskStatus::Rejected | TaskStatus::Escalated
            )
        {
            return Err(CouncilError::InvalidDelegation(format!(
                "{} is {} and cannot be corrected",
                original_id, original.status
            )));
        }

        let owner = new_owner.unwrap_or_else(|| original.owner.clone());
        let owner_authority = self.registry.authority_of(&owner);
        if owner_authority.map_or(true, |a| a < original.phase.minimum_authority())
            || state.excluded_roles.contains(&owner)
        {
            return Err(CouncilError::authority(
                &owner,
                format!("own {} task {}", original.phase, original_id),
            ));
        }

        let id = TaskId::sequential(state.next_task_seq);
        let mut copy = Task::new(
            id.clone(),
            state.next_task_seq,
            original.phase,
            owner.clone(),
            original.payload.clone(),
            at,
        );
        copy.parent = original.parent.clone();
        copy.dependencies = original.dependencies.clone();
        copy.reviews = original.reviews.clone();
        copy.correction_round = original.correction_round + 1;
        copy.supersedes = Some(original_id.clone());
        copy.feedback = original.feedback.clone();
        copy.feedback.extend(feedback);

        let dependents: Vec<TaskId> = state
            .graph
            .tasks()
            .filter(|t| t.is_live() && t.dependencies.contains(original_id))
            .map(|t| t.id.clone())
            .collect();
        let waiting_reviewers: Vec<(TaskId, TaskStatus)> = state
            .graph
            .reviewers_of(original_id)
            .into_iter()
            .filter(|t| !t.retired && matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
            .map(|t| (t.id.clone(), t.status))
            .collect();
        let reviewer_template = if waiting_reviewers.is_empty() && original.phase == Phase::Implement {
            state
                .graph
                .reviewers_of(original_id)
                .into_iter()
                .max_by_key(|t| t.created_seq)
                .cloned()
        } else {
            None
        };
        let excluded = state.excluded_roles.clone();

        // Record
        if original.status == TaskStatus::Escalated {
            journal.transition(
                original_id,
                TaskStatus::Rejected,
                Some("superseded".into()),
                None,
                at,
            )?;
        }
        journal.record(
            EventDraft::new(EventKind::TaskDelegated { task: copy }, at)
                .task(&id)
                .role(&owner)
                .detail(format!(
                    "corrective task {} supersedes {} (round {})",
                    id,
                    original_id,
                    original.correction_round + 1
                )),
        )?;
        journal.record(
            EventDraft::new(
                EventKind::TaskRetired {
                    superseded_by: Some(id.clone()),
                },
                at,
            )
            .task(original_id)
            .detail(format!("{} retired in favour of {}", original_id, id)),
        )?;
        for dependent in dependents {
            journal.record(
                EventDraft::new(
                    EventKind::DependencyRewired {
                        from: original_id.clone(),
                        to: id.clone(),
                    },
                    at,
                )
                .task(&dependent)
                .detail(format!("{} now waits on {}", dependent, id)),
            )?;
        }
        for (reviewer, status) in waiting_reviewers {
            journal.record(
                EventDraft::new(EventKind::ReviewRetargeted { to: id.clone() }, at)
                    .task(&reviewer)
                    .detail(format!("{} now reviews {}", reviewer, id)),
            )?;
            if status == TaskStatus::Ready {
                journal.transition(
                    &reviewer,
                    TaskStatus::Pending,
                    Some("subject superseded".into()),
                    None,
                    at,
                )?;
            }
        }
        if let Some(template) = reviewer_template {
            let reviewer_owner = if template.owner == owner || excluded.contains(&template.owner) {
                self.registry
                    .reviewer_for(&owner, &excluded)
                    .ok_or_else(|| CouncilError::authority(&owner, "find a reviewer"))?
            } else {
                template.owner.clone()
            };
            let seq = journal.state().next_task_seq;
            let mut reviewer = Task::new(
                TaskId::sequential(seq),
                seq,
                Phase::Validate,
                reviewer_owner,
                template.payload.clone(),
                at,
            )
            .with_reviews(id.clone());
            reviewer.parent = template.parent.clone();
            reviewer.dependencies = template.dependencies.clone();
            self.spawn(journal, reviewer, format!("reviewer cloned for {}", id), at)?;
        }

        tracing::info!(
            workflow_id = %journal.state().id,
            original = %original_id,
            correction = %id,
            "Corrective task delegated"
        );
        Ok(id)
    }
}

fn resolve(reference: &DependencyRef, batch: &[TaskId], graph: &TaskGraph) -> CouncilResult<TaskId> {
    match reference {
        DependencyRef::Sibling(index) => batch.get(*index).cloned().ok_or_else(|| {
            CouncilError::InvalidDelegation(format!("sibling index {} out of range", index))
        }),
        DependencyRef::Task(id) if graph.contains(id) => Ok(id.clone()),
        DependencyRef::Task(id) => Err(CouncilError::TaskNotFound(id.clone())),
    }
}

fn sibling_refs(request: &DelegationRequest) -> impl Iterator<Item = usize> + '_ {
    request
        .depends_on
        .iter()
        .chain(&request.required_by)
        .chain(request.reviews.as_ref())
        .filter_map(|r| match r {
            DependencyRef::Sibling(index) => Some(*index),
            DependencyRef::Task(_) => None,
        })
}

/// Point sibling references at the request's position after screening
fn renumber(request: &mut DelegationRequest, positions: &[Option<usize>]) {
    request
        .depends_on
        .iter_mut()
        .chain(request.required_by.iter_mut())
        .chain(request.reviews.as_mut())
        .for_each(|r| {
            if let DependencyRef::Sibling(index) = r {
                if let Some(Some(position)) = positions.get(*index) {
                    *index = *position;
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Arc<RoleRegistry> {
        Arc::new(RoleRegistry::load(RegistryConfig::standard()).unwrap())
    }

    /// A journal whose planner root is running
    fn running_root() -> Journal {
        let now = Utc::now();
        let root = Task::new(
            TaskId::sequential(1),
            1,
            Phase::Propose,
            RoleId::new("planner"),
            json!({"goal": "report"}),
            now,
        );
        let mut journal = Journal::open(WorkflowId::new("wf"), root, None, now).unwrap();
        let root_id = TaskId::sequential(1);
        journal
            .transition(&root_id, TaskStatus::Ready, None, None, now)
            .unwrap();
        journal
            .record(
                EventDraft::new(
                    EventKind::TaskStarted {
                        attempt: 1,
                        deadline: now,
                    },
                    now,
                )
                .task(&root_id),
            )
            .unwrap();
        journal
    }

    #[test]
    fn test_delegate_creates_pending_task() {
        let engine = DelegationEngine::new(registry());
        let mut journal = running_root();
        let id = engine
            .delegate(
                &mut journal,
                &TaskId::sequential(1),
                DelegationRequest::new("implementer", Phase::Implement).with_payload(json!("draft")),
                Utc::now(),
            )
            .unwrap();
        let task = journal.state().task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.parent, Some(TaskId::sequential(1)));
        assert_eq!(task.owner, RoleId::new("implementer"));
    }

    #[test]
    fn test_unauthorised_delegation_creates_nothing() {
        let engine = DelegationEngine::new(registry());
        let mut journal = running_root();
        let before = journal.state().graph.len();
        let err = engine
            .delegate(
                &mut journal,
                &TaskId::sequential(1),
                DelegationRequest::new("overseer", Phase::OverseeReview),
                Utc::now(),
            )
            .unwrap_err();
        assert!(err.is_authority());
        assert_eq!(journal.state().graph.len(), before);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let engine = DelegationEngine::new(registry());
        let mut journal = running_root();
        let events_before = journal.state().last_sequence;
        let err = engine
            .delegate_batch(
                &mut journal,
                &TaskId::sequential(1),
                vec![
                    DelegationRequest::new("implementer", Phase::Implement),
                    DelegationRequest::new("implementer", Phase::Validate),
                ],
                Utc::now(),
            )
            .unwrap_err();
        assert!(err.is_authority());
        assert_eq!(journal.state().graph.len(), 1);
        assert_eq!(journal.state().last_sequence, events_before);
    }

    #[test]
    fn test_sibling_cycle_rejected_without_change() {
        let engine = DelegationEngine::new(registry());
        let mut journal = running_root();
        let before = journal.state().clone();
        let err = engine
            .delegate_batch(
                &mut journal,
                &TaskId::sequential(1),
                vec![
                    DelegationRequest::new("implementer", Phase::Implement)
                        .depends_on(DependencyRef::Sibling(1)),
                    DelegationRequest::new("implementer", Phase::Implement)
                        .depends_on(DependencyRef::Sibling(0)),
                ],
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, CouncilError::Cycle(_)));
        assert_eq!(journal.state(), &before);
    }

    #[test]
    fn test_required_by_existing_task_detects_cycle() {
        let engine = DelegationEngine::new(registry());
        let mut journal = running_root();
        let now = Utc::now();
        let first = engine
            .delegate(
                &mut journal,
                &TaskId::sequential(1),
                DelegationRequest::new("implementer", Phase::Implement),
                now,
            )
            .unwrap();
        let err = engine
            .delegate(
                &mut journal,
                &TaskId::sequential(1),
                DelegationRequest::new("implementer", Phase::Implement)
                    .depends_on(DependencyRef::Task(first.clone()))
                    .required_by(DependencyRef::Task(first.clone())),
                now,
            )
            .unwrap_err();
        assert!(matches!(err, CouncilError::Cycle(_)));
        assert!(journal.state().task(&first).unwrap().dependencies.is_empty());
    }

    #[test]
    fn test_reviews_wires_subject() {
        let engine = DelegationEngine::new(registry());
        let mut journal = running_root();
        let ids = engine
            .delegate_batch(
                &mut journal,
                &TaskId::sequential(1),
                vec![
                    DelegationRequest::new("implementer", Phase::Implement),
                    DelegationRequest::new("validator", Phase::Validate)
                        .reviewing(DependencyRef::Sibling(0)),
                ],
                Utc::now(),
            )
            .unwrap();
        let reviewer = journal.state().task(&ids[1]).unwrap();
        assert_eq!(reviewer.reviews.as_ref(), Some(&ids[0]));
    }

    #[test]
    fn test_screen_drops_refused_requests_and_their_dependents() {
        let engine = DelegationEngine::new(registry());
        let mut journal = running_root();
        let screened = engine
            .screen(
                journal.state(),
                &TaskId::sequential(1),
                vec![
                    DelegationRequest::new("overseer", Phase::OverseeReview),
                    DelegationRequest::new("implementer", Phase::Implement).depends_on(DependencyRef::Sibling(0)),
                    DelegationRequest::new("implementer", Phase::Implement),
                    DelegationRequest::new("validator", Phase::Validate).reviewing(DependencyRef::Sibling(2)),
                ],
            )
            .unwrap();
        assert_eq!(screened.refused.len(), 2);
        assert!(screened.refused[0].is_authority());
        assert!(matches!(screened.refused[1], CouncilError::InvalidDelegation(_)));
        assert_eq!(screened.permitted.len(), 2);
        assert_eq!(screened.permitted[1].reviews, Some(DependencyRef::Sibling(0)));

        let ids = engine
            .delegate_batch(&mut journal, &TaskId::sequential(1), screened.permitted, Utc::now())
            .unwrap();
        let reviewer = journal.state().task(&ids[1]).unwrap();
        assert_eq!(reviewer.reviews.as_ref(), Some(&ids[0]));
        assert!(journal.state().graph.tasks().all(|t| t.owner != RoleId::new("overseer")));
    }

    #[test]
    fn test_parent_must_be_running() {
        let engine = DelegationEngine::new(registry());
        let now = Utc::now();
        let root = Task::new(TaskId::sequential(1), 1, Phase::Propose, RoleId::new("planner"), json!(null), now);
        let mut journal = Journal::open(WorkflowId::new("wf"), root, None, now).unwrap();
        let err = engine
            .delegate(
                &mut journal,
                &TaskId::sequential(1),
                DelegationRequest::new("implementer", Phase::Implement),
                now,
            )
            .unwrap_err();
        assert!(matches!(err, CouncilError::InvalidDelegation(_)));
    }
}
