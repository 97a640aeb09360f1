//! Task graph: the DAG of sub-tasks that makes up a workflow
//!
//! An edge runs from a prerequisite to the task that waits on it. A task
//! waits on its declared dependencies and, for review tasks, on the subject
//! it reviews. Both kinds of edge take part in cycle detection.
//!
//! The graph is only mutated by `WorkflowState::apply`.

use chrono::{DateTime, Utc};
use council_types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    tasks: BTreeMap<TaskId, Task>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub(crate) fn tasks_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.tasks.values_mut()
    }

    pub(crate) fn insert(&mut self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn in_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.tasks.values().filter(|t| t.status == status).collect()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Tasks that wait on `id`, through a dependency or a review edge
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.dependencies.contains(id) || t.reviews.as_ref() == Some(id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Review tasks pointed at `id`
    pub fn reviewers_of(&self, id: &TaskId) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|t| t.reviews.as_ref() == Some(id))
            .collect()
    }

    /// Every task transitively waiting on `id`
    pub fn descendants(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<TaskId> = VecDeque::from([id.clone()]);
        while let Some(current) = queue.pop_front() {
            for next in self.dependents(&current) {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Phase-ordering check: does `id` have an accepted descendant in `phase`?
    pub fn has_accepted_descendant(&self, id: &TaskId, phase: Phase) -> bool {
        self.descendants(id).iter().any(|d| {
            self.tasks
                .get(d)
                .is_some_and(|t| t.phase == phase && t.status == TaskStatus::Accepted)
        })
    }

    /// Readiness: pending, out of backoff, every dependency accepted, and
    /// (for reviewers) the subject awaiting validation
    pub fn is_runnable(&self, task: &Task, now: DateTime<Utc>) -> bool {
        if task.status != TaskStatus::Pending || task.retired {
            return false;
        }
        if task.not_before.is_some_and(|t| t > now) {
            return false;
        }
        let dependencies_accepted = task.dependencies.iter().all(|d| {
            self.tasks
                .get(d)
                .is_some_and(|t| t.status == TaskStatus::Accepted)
        });
        let subject_waiting = task.reviews.as_ref().map_or(true, |s| {
            self.tasks
                .get(s)
                .is_some_and(|t| t.status == TaskStatus::AwaitingValidation)
        });
        dependencies_accepted && subject_waiting
    }

    /// A path that returns to its start, if the graph has one
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut marks: BTreeMap<&TaskId, Mark> = BTreeMap::new();
        let mut stack: Vec<&TaskId> = Vec::new();
        for id in self.tasks.keys() {
            if let Some(cycle) = self.visit(id, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        id: &'a TaskId,
        marks: &mut BTreeMap<&'a TaskId, Mark>,
        stack: &mut Vec<&'a TaskId>,
    ) -> Option<Vec<TaskId>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut cycle: Vec<TaskId> = stack[start..].iter().map(|s| (*s).clone()).collect();
                cycle.push(id.clone());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(id, Mark::Visiting);
        stack.push(id);
        if let Some(task) = self.tasks.get(id) {
            for prerequisite in task.dependencies.iter().chain(task.reviews.iter()) {
                if let Some(cycle) = self.visit(prerequisite, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn task(seq: u64, phase: Phase) -> Task {
        Task::new(
            TaskId::sequential(seq),
            seq,
            phase,
            RoleId::new("implementer"),
            Value::Null,
            Utc::now(),
        )
    }

    fn id(seq: u64) -> TaskId {
        TaskId::sequential(seq)
    }

    #[test]
    fn test_descendants_follow_dependency_and_review_edges() {
        let mut graph = TaskGraph::new();
        graph.insert(task(1, Phase::Implement));
        graph.insert(task(2, Phase::Validate).with_reviews(id(1)));
        graph.insert(task(3, Phase::Implement).with_dependency(id(1)));
        graph.insert(task(4, Phase::Implement).with_dependency(id(3)));
        graph.insert(task(5, Phase::Implement));

        let descendants = graph.descendants(&id(1));
        assert_eq!(descendants, [id(2), id(3), id(4)].into_iter().collect());
        assert!(graph.descendants(&id(5)).is_empty());
    }

    #[test]
    fn test_find_cycle_through_review_edge() {
        let mut graph = TaskGraph::new();
        graph.insert(task(1, Phase::Implement).with_dependency(id(2)));
        graph.insert(task(2, Phase::Validate).with_reviews(id(1)));
        let cycle = graph.find_cycle().expect("cycle");
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn test_acyclic_graph_has_no_cycle() {
        let mut graph = TaskGraph::new();
        graph.insert(task(1, Phase::Propose));
        graph.insert(task(2, Phase::Implement).with_dependency(id(1)));
        graph.insert(task(3, Phase::Implement).with_dependency(id(1)));
        graph.insert(task(4, Phase::Implement).with_dependency(id(2)).with_dependency(id(3)));
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut graph = TaskGraph::new();
        graph.insert(task(1, Phase::Implement).with_dependency(id(1)));
        assert_eq!(graph.find_cycle(), Some(vec![id(1), id(1)]));
    }

    #[test]
    fn test_readiness_requires_accepted_dependencies() {
        let now = Utc::now();
        let mut graph = TaskGraph::new();
        let mut first = task(1, Phase::Implement);
        first.status = TaskStatus::Running;
        graph.insert(first);
        graph.insert(task(2, Phase::Implement).with_dependency(id(1)));

        let waiting = graph.get(&id(2)).cloned().unwrap();
        assert!(!graph.is_runnable(&waiting, now));

        graph.get_mut(&id(1)).unwrap().status = TaskStatus::Accepted;
        assert!(graph.is_runnable(&waiting, now));
    }

    #[test]
    fn test_reviewer_waits_for_subject_and_backoff() {
        let now = Utc::now();
        let mut graph = TaskGraph::new();
        let mut subject = task(1, Phase::Implement);
        subject.status = TaskStatus::Running;
        graph.insert(subject);
        let mut reviewer = task(2, Phase::Validate).with_reviews(id(1));
        assert!(!graph.is_runnable(&reviewer, now));

        graph.get_mut(&id(1)).unwrap().status = TaskStatus::AwaitingValidation;
        assert!(graph.is_runnable(&reviewer, now));

        reviewer.not_before = Some(now + chrono::Duration::seconds(5));
        assert!(!graph.is_runnable(&reviewer, now));
    }

    #[test]
    fn test_accepted_validate_descendant() {
        let mut graph = TaskGraph::new();
        graph.insert(task(1, Phase::Implement));
        let mut review = task(2, Phase::Validate).with_reviews(id(1));
        review.status = TaskStatus::Running;
        graph.insert(review);
        assert!(!graph.has_accepted_descendant(&id(1), Phase::Validate));
        graph.get_mut(&id(2)).unwrap().status = TaskStatus::Accepted;
        assert!(graph.has_accepted_descendant(&id(1), Phase::Validate));
    }
}
