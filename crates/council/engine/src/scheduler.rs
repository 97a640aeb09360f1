//! Scheduler: readiness, admission and retry
//!
//! Admission is FIFO by task creation order. The caller supplies how many
//! slots it can fill; the orchestrator already caps that at the policy's
//! concurrency limit.

use crate::{EventDraft, Journal, WorkflowState};
use chrono::{DateTime, Utc};
use council_types::*;

/// What happened to a failed attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Pending` until `not_before`
    Retry { not_before: DateTime<Utc> },
    /// Attempts used up; the task is now `Escalated`
    Exhausted,
}

#[derive(Clone, Debug)]
pub struct Scheduler {
    policy: SchedulerPolicy,
}

impl Scheduler {
    pub fn new(policy: SchedulerPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.policy
    }

    /// Move every runnable `Pending` task to `Ready`
    pub fn promote_ready(&self, journal: &mut Journal, now: DateTime<Utc>) -> CouncilResult<Vec<TaskId>> {
        let state = journal.state();
        let runnable: Vec<TaskId> = state
            .graph
            .tasks()
            .filter(|t| state.graph.is_runnable(t, now))
            .map(|t| t.id.clone())
            .collect();
        for id in &runnable {
            journal.transition(id, TaskStatus::Ready, None, None, now)?;
        }
        Ok(runnable)
    }

    /// Start up to `capacity` ready tasks, oldest first
    pub fn admit(
        &self,
        journal: &mut Journal,
        capacity: usize,
        now: DateTime<Utc>,
    ) -> CouncilResult<Vec<TaskId>> {
        if capacity == 0 {
            return Ok(Vec::new());
        }
        let mut ready: Vec<(u64, TaskId, u32)> = journal
            .state()
            .graph
            .in_status(TaskStatus::Ready)
            .into_iter()
            .map(|t| (t.created_seq, t.id.clone(), t.attempts))
            .collect();
        ready.sort();
        ready.truncate(capacity);

        let deadline = now + self.policy.task_timeout();
        let mut started = Vec::with_capacity(ready.len());
        for (_, id, attempts) in ready {
            let attempt = attempts + 1;
            journal.record(
                EventDraft::new(EventKind::TaskStarted { attempt, deadline }, now)
                    .task(&id)
                    .detail(format!("attempt {} started", attempt)),
            )?;
            started.push(id);
        }
        Ok(started)
    }

    /// Running tasks past their deadline, with the attempt that expired
    pub fn expired(&self, state: &WorkflowState, now: DateTime<Utc>) -> Vec<(TaskId, u32)> {
        state
            .graph
            .in_status(TaskStatus::Running)
            .into_iter()
            .filter(|t| t.deadline.is_some_and(|d| d <= now))
            .map(|t| (t.id.clone(), t.attempts))
            .collect()
    }

    /// Send a failed attempt back for retry, or escalate it
    pub fn schedule_retry(
        &self,
        journal: &mut Journal,
        task_id: &TaskId,
        failure: &ExecutionFailure,
        now: DateTime<Utc>,
    ) -> CouncilResult<RetryDecision> {
        let attempts = journal
            .state()
            .task(task_id)
            .map(|t| t.attempts)
            .ok_or_else(|| CouncilError::TaskNotFound(task_id.clone()))?;

        if attempts < self.policy.max_attempts {
            let not_before = now + self.policy.backoff(attempts);
            journal.record(
                EventDraft::new(
                    EventKind::TaskRetryScheduled {
                        attempts,
                        not_before,
                        error: failure.to_string(),
                    },
                    now,
                )
                .task(task_id)
                .detail(format!("attempt {} failed: {}", attempts, failure)),
            )?;
            tracing::debug!(
                task_id = %task_id,
                attempts,
                not_before = %not_before,
                "Retry scheduled"
            );
            Ok(RetryDecision::Retry { not_before })
        } else {
            journal.transition(
                task_id,
                TaskStatus::Escalated,
                Some(format!("attempts exhausted: {}", failure)),
                None,
                now,
            )?;
            tracing::warn!(task_id = %task_id, attempts, "Retry budget exhausted");
            Ok(RetryDecision::Exhausted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn journal_with_tasks(count: u64) -> Journal {
        let now = Utc::now();
        let root = Task::new(TaskId::sequential(1), 1, Phase::Implement, RoleId::new("implementer"), json!(null), now);
        let mut journal = Journal::open(WorkflowId::new("wf"), root, None, now).unwrap();
        for seq in 2..=count {
            let task = Task::new(TaskId::sequential(seq), seq, Phase::Implement, RoleId::new("implementer"), json!(null), now);
            journal
                .record(EventDraft::new(EventKind::TaskDelegated { task }, now).task(&TaskId::sequential(seq)))
                .unwrap();
        }
        journal
    }

    fn policy() -> SchedulerPolicy {
        SchedulerPolicy {
            max_attempts: 2,
            backoff_base_ms: 100,
            backoff_cap_ms: 1_000,
            ..SchedulerPolicy::default()
        }
    }

    #[test]
    fn test_admission_is_fifo_and_capped() {
        let scheduler = Scheduler::new(policy());
        let mut journal = journal_with_tasks(4);
        let now = Utc::now();
        let promoted = scheduler.promote_ready(&mut journal, now).unwrap();
        assert_eq!(promoted.len(), 4);

        let started = scheduler.admit(&mut journal, 2, now).unwrap();
        assert_eq!(started, vec![TaskId::sequential(1), TaskId::sequential(2)]);
        assert_eq!(journal.state().graph.count(TaskStatus::Running), 2);
        assert_eq!(journal.state().graph.count(TaskStatus::Ready), 2);
    }

    #[test]
    fn test_zero_capacity_starts_nothing() {
        let scheduler = Scheduler::new(policy());
        let mut journal = journal_with_tasks(2);
        let now = Utc::now();
        scheduler.promote_ready(&mut journal, now).unwrap();
        assert!(scheduler.admit(&mut journal, 0, now).unwrap().is_empty());
    }

    #[test]
    fn test_retry_then_exhaust() {
        let scheduler = Scheduler::new(policy());
        let mut journal = journal_with_tasks(1);
        let id = TaskId::sequential(1);
        let now = Utc::now();

        scheduler.promote_ready(&mut journal, now).unwrap();
        scheduler.admit(&mut journal, 1, now).unwrap();
        let decision = scheduler
            .schedule_retry(&mut journal, &id, &ExecutionFailure::Timeout, now)
            .unwrap();
        assert_eq!(
            decision,
            RetryDecision::Retry {
                not_before: now + Duration::milliseconds(200)
            }
        );

        // Still in backoff
        assert!(scheduler.promote_ready(&mut journal, now).unwrap().is_empty());

        let later = now + Duration::seconds(1);
        scheduler.promote_ready(&mut journal, later).unwrap();
        scheduler.admit(&mut journal, 1, later).unwrap();
        assert_eq!(journal.state().task(&id).unwrap().attempts, 2);

        let decision = scheduler
            .schedule_retry(&mut journal, &id, &ExecutionFailure::Provider("boom".into()), later)
            .unwrap();
        assert_eq!(decision, RetryDecision::Exhausted);
        assert_eq!(journal.state().task(&id).unwrap().status, TaskStatus::Escalated);
    }

    #[test]
    fn test_expired_reports_running_past_deadline() {
        let scheduler = Scheduler::new(SchedulerPolicy {
            task_timeout_ms: 1_000,
            ..policy()
        });
        let mut journal = journal_with_tasks(1);
        let now = Utc::now();
        scheduler.promote_ready(&mut journal, now).unwrap();
        scheduler.admit(&mut journal, 1, now).unwrap();

        assert!(scheduler.expired(journal.state(), now).is_empty());
        let expired = scheduler.expired(journal.state(), now + Duration::seconds(2));
        assert_eq!(expired, vec![(TaskId::sequential(1), 1)]);
    }
}
