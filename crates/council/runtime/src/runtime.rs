//! Council runtime: the orchestrator loop and its control handle
//!
//! A single task owns every [`WorkflowEngine`]. It wakes on control
//! commands, worker completions and the scheduler tick, applies the change,
//! then advances all active workflows in submission order under one global
//! concurrency limit. Workers run in their own tasks; audit events and
//! snapshots are written by a separate persistence task over an unbounded
//! queue, so the loop never waits on a provider or on disk.
//!
//! Closed workflows stay queryable until more than `archive_limit` newer
//! ones have closed.

use crate::audit::{AuditSink, MemoryAuditSink};
use crate::provider::ReasoningProvider;
use crate::store::SnapshotStore;
use crate::worker::{self, Completion};
use chrono::{DateTime, Utc};
use council_engine::{WorkflowEngine, WorkflowState};
use council_types::*;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const COMMAND_BUFFER: usize = 64;
const DEFAULT_ARCHIVE_LIMIT: usize = 256;

type Reply<T> = oneshot::Sender<CouncilResult<T>>;

enum Command {
    Submit {
        payload: serde_json::Value,
        reply: Reply<WorkflowId>,
    },
    Status {
        id: WorkflowId,
        reply: Reply<WorkflowSummary>,
    },
    Snapshot {
        id: WorkflowId,
        reply: Reply<WorkflowState>,
    },
    Cancel {
        id: WorkflowId,
        reply: Reply<()>,
    },
    OpenCrises {
        id: WorkflowId,
        reply: Reply<Vec<CrisisCase>>,
    },
    CastVote {
        id: WorkflowId,
        crisis: CrisisId,
        role: RoleId,
        ballot: Ballot,
        reply: Reply<VoteOutcome>,
    },
    ApplyOverride {
        id: WorkflowId,
        crisis: CrisisId,
        decision: OverrideDecision,
        role: RoleId,
        reply: Reply<()>,
    },
    RaiseNoConfidence {
        id: WorkflowId,
        against: RoleId,
        raised_by: RoleId,
        reply: Reply<CrisisId>,
    },
    WaitClosed {
        id: WorkflowId,
        reply: Reply<WorkflowSummary>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Work for the persistence task
enum Record {
    Event(AuditEvent),
    Snapshot(Box<WorkflowState>),
}

/// Runtime configuration and collaborators; `start` launches the loop
pub struct CouncilRuntime {
    registry: Arc<RoleRegistry>,
    policy: CouncilPolicy,
    provider: Arc<dyn ReasoningProvider>,
    audit: Arc<dyn AuditSink>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    snapshot_interval: u64,
    archive_limit: usize,
    restored: Vec<WorkflowEngine>,
}

impl CouncilRuntime {
    pub fn new(
        registry: Arc<RoleRegistry>,
        policy: CouncilPolicy,
        provider: Arc<dyn ReasoningProvider>,
    ) -> Self {
        Self {
            registry,
            policy,
            provider,
            audit: Arc::new(MemoryAuditSink::new()),
            snapshots: None,
            snapshot_interval: 20,
            archive_limit: DEFAULT_ARCHIVE_LIMIT,
            restored: Vec::new(),
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Snapshot every active workflow once per `ticks` scheduler ticks
    /// (0 disables periodic snapshots; closing workflows are always saved)
    pub fn with_snapshot_interval(mut self, ticks: u64) -> Self {
        self.snapshot_interval = ticks;
        self
    }

    /// Closed workflows kept in memory for status queries; the oldest are
    /// evicted first (0 keeps all of them)
    pub fn with_archive_limit(mut self, limit: usize) -> Self {
        self.archive_limit = limit;
        self
    }

    /// Resume workflows rebuilt by [`crate::recover`]
    pub fn with_workflows(mut self, engines: Vec<WorkflowEngine>) -> Self {
        self.restored.extend(engines);
        self
    }

    /// Spawn the orchestrator loop. Must be called inside a Tokio runtime.
    pub fn start(self) -> CouncilHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let persistence = tokio::spawn(persist(record_rx, self.audit.clone(), self.snapshots.clone()));

        let mut orchestrator = Orchestrator {
            registry: self.registry,
            policy: self.policy,
            provider: self.provider,
            persist_snapshots: self.snapshots.is_some(),
            snapshot_interval: self.snapshot_interval,
            active: Vec::new(),
            archive: HashMap::new(),
            archive_order: VecDeque::new(),
            archive_limit: self.archive_limit,
            inflight: HashMap::new(),
            waiters: HashMap::new(),
            outbox: Vec::new(),
            records: record_tx,
            completions: completion_tx,
            ticks: 0,
        };
        for engine in self.restored {
            orchestrator.adopt(engine);
        }

        tokio::spawn(orchestrator.run(command_rx, completion_rx, persistence));
        CouncilHandle { commands: command_tx }
    }
}

/// Cloneable control API of a running council
#[derive(Clone)]
pub struct CouncilHandle {
    commands: mpsc::Sender<Command>,
}

impl CouncilHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> CouncilResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| CouncilError::Unavailable("runtime has stopped".into()))?;
        rx.await
            .map_err(|_| CouncilError::Unavailable("runtime dropped the request".into()))?
    }

    #[tracing::instrument(skip(self, payload))]
    pub async fn submit_workflow(&self, payload: serde_json::Value) -> CouncilResult<WorkflowId> {
        self.request(|reply| Command::Submit { payload, reply }).await
    }

    pub async fn get_status(&self, id: &WorkflowId) -> CouncilResult<WorkflowSummary> {
        let id = id.clone();
        self.request(|reply| Command::Status { id, reply }).await
    }

    /// Full state as of the last completed tick
    pub async fn snapshot(&self, id: &WorkflowId) -> CouncilResult<WorkflowState> {
        let id = id.clone();
        self.request(|reply| Command::Snapshot { id, reply }).await
    }

    #[tracing::instrument(skip(self), fields(workflow_id = %id))]
    pub async fn cancel(&self, id: &WorkflowId) -> CouncilResult<()> {
        let id = id.clone();
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    pub async fn list_open_crises(&self, id: &WorkflowId) -> CouncilResult<Vec<CrisisCase>> {
        let id = id.clone();
        self.request(|reply| Command::OpenCrises { id, reply }).await
    }

    /// Cast a ballot on behalf of `role`, outside ballot solicitation
    #[tracing::instrument(skip(self), fields(workflow_id = %id, crisis_id = %crisis))]
    pub async fn cast_vote(
        &self,
        id: &WorkflowId,
        crisis: &CrisisId,
        role: &RoleId,
        ballot: Ballot,
    ) -> CouncilResult<VoteOutcome> {
        let (id, crisis, role) = (id.clone(), crisis.clone(), role.clone());
        self.request(|reply| Command::CastVote {
            id,
            crisis,
            role,
            ballot,
            reply,
        })
        .await
    }

    #[tracing::instrument(skip(self, decision), fields(workflow_id = %id, crisis_id = %crisis))]
    pub async fn apply_override(
        &self,
        id: &WorkflowId,
        crisis: &CrisisId,
        decision: OverrideDecision,
        role: &RoleId,
    ) -> CouncilResult<()> {
        let (id, crisis, role) = (id.clone(), crisis.clone(), role.clone());
        self.request(|reply| Command::ApplyOverride {
            id,
            crisis,
            decision,
            role,
            reply,
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(workflow_id = %id))]
    pub async fn raise_no_confidence(
        &self,
        id: &WorkflowId,
        against: &RoleId,
        raised_by: &RoleId,
    ) -> CouncilResult<CrisisId> {
        let (id, against, raised_by) = (id.clone(), against.clone(), raised_by.clone());
        self.request(|reply| Command::RaiseNoConfidence {
            id,
            against,
            raised_by,
            reply,
        })
        .await
    }

    /// Wait until the workflow closes. A workflow that failed on an
    /// unresolved crisis is reported as [`CouncilError::CrisisUnresolved`].
    pub async fn wait_for_completion(&self, id: &WorkflowId) -> CouncilResult<WorkflowSummary> {
        let id = id.clone();
        let summary = self.request(|reply| Command::WaitClosed { id, reply }).await?;
        match (&summary.status, &summary.unresolved_crisis) {
            (WorkflowStatus::Failed, Some(crisis)) => Err(CouncilError::CrisisUnresolved {
                crisis: crisis.clone(),
                reason: summary
                    .closing_reason
                    .clone()
                    .unwrap_or_else(|| "crisis unresolved".into()),
            }),
            _ => Ok(summary),
        }
    }

    /// Stop the loop, cancel running work and flush persistence
    pub async fn shutdown(&self) -> CouncilResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct Flight {
    attempt: u32,
    cancel: watch::Sender<bool>,
}

struct Orchestrator {
    registry: Arc<RoleRegistry>,
    policy: CouncilPolicy,
    provider: Arc<dyn ReasoningProvider>,
    persist_snapshots: bool,
    snapshot_interval: u64,
    /// Open workflows in submission order
    active: Vec<WorkflowEngine>,
    archive: HashMap<WorkflowId, WorkflowEngine>,
    /// Archived ids, oldest first
    archive_order: VecDeque<WorkflowId>,
    archive_limit: usize,
    inflight: HashMap<(WorkflowId, TaskId), Flight>,
    waiters: HashMap<WorkflowId, Vec<Reply<WorkflowSummary>>>,
    outbox: Vec<Record>,
    records: mpsc::UnboundedSender<Record>,
    completions: mpsc::UnboundedSender<Completion>,
    ticks: u64,
}

impl Orchestrator {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        persistence: JoinHandle<()>,
    ) {
        let mut ticker = tokio::time::interval(self.policy.scheduler.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            max_concurrency = self.policy.scheduler.max_concurrency,
            restored = self.active.len() + self.archive.len(),
            "Council runtime started"
        );

        let shutdown = loop {
            let mut periodic = false;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => break Some(reply),
                    Some(command) => self.handle(command),
                    None => break None,
                },
                Some(done) = completions.recv() => self.on_completion(done),
                _ = ticker.tick() => periodic = true,
            }
            self.advance(periodic);
        };

        self.stop();
        if let Err(err) = persistence.await {
            tracing::error!(error = %err, "Persistence task failed");
        }
        tracing::info!("Council runtime stopped");
        if let Some(reply) = shutdown {
            let _ = reply.send(Ok(()));
        }
    }

    // ── Lookup ───────────────────────────────────────────────────────

    fn find(&self, id: &WorkflowId) -> Option<&WorkflowEngine> {
        self.active
            .iter()
            .find(|e| e.id() == id)
            .or_else(|| self.archive.get(id))
    }

    fn find_mut(&mut self, id: &WorkflowId) -> Option<&mut WorkflowEngine> {
        match self.active.iter().position(|e| e.id() == id) {
            Some(index) => self.active.get_mut(index),
            None => self.archive.get_mut(id),
        }
    }

    fn read<T>(&self, id: &WorkflowId, f: impl FnOnce(&WorkflowEngine) -> T) -> CouncilResult<T> {
        self.find(id)
            .map(f)
            .ok_or_else(|| CouncilError::WorkflowNotFound(id.clone()))
    }

    /// Run a mutation on an open workflow and queue its events
    fn mutate<T>(
        &mut self,
        id: &WorkflowId,
        f: impl FnOnce(&mut WorkflowEngine, DateTime<Utc>) -> CouncilResult<T>,
    ) -> CouncilResult<T> {
        if self.archive.contains_key(id) {
            return Err(CouncilError::WorkflowClosed(id.clone()));
        }
        let index = self
            .active
            .iter()
            .position(|e| e.id() == id)
            .ok_or_else(|| CouncilError::WorkflowNotFound(id.clone()))?;
        let engine = &mut self.active[index];
        let result = f(engine, Utc::now());
        let events = engine.drain_events();
        self.outbox.extend(events.into_iter().map(Record::Event));
        result
    }

    fn adopt(&mut self, mut engine: WorkflowEngine) {
        let events = engine.drain_events();
        self.outbox.extend(events.into_iter().map(Record::Event));
        if engine.is_closed() {
            self.retire(engine);
        } else {
            self.active.push(engine);
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { payload, reply } => {
                let result = WorkflowEngine::submit(
                    WorkflowId::generate(),
                    payload,
                    self.registry.clone(),
                    self.policy.clone(),
                    Utc::now(),
                )
                .map(|engine| {
                    let id = engine.id().clone();
                    self.adopt(engine);
                    id
                });
                let _ = reply.send(result);
            }
            Command::Status { id, reply } => {
                let _ = reply.send(self.read(&id, |e| e.summary()));
            }
            Command::Snapshot { id, reply } => {
                let _ = reply.send(self.read(&id, |e| e.snapshot()));
            }
            Command::OpenCrises { id, reply } => {
                let _ = reply.send(self.read(&id, |e| e.open_crises()));
            }
            Command::Cancel { id, reply } => {
                let result = self.mutate(&id, |e, now| e.cancel("cancelled by request", now));
                let _ = reply.send(result);
            }
            Command::CastVote {
                id,
                crisis,
                role,
                ballot,
                reply,
            } => {
                let result = self.mutate(&id, |e, now| e.cast_vote(&crisis, &role, ballot, now));
                let _ = reply.send(result);
            }
            Command::ApplyOverride {
                id,
                crisis,
                decision,
                role,
                reply,
            } => {
                let result = self.mutate(&id, |e, now| e.apply_override(&crisis, decision, &role, now));
                let _ = reply.send(result);
            }
            Command::RaiseNoConfidence {
                id,
                against,
                raised_by,
                reply,
            } => {
                let result = self.mutate(&id, |e, now| e.raise_no_confidence(&against, &raised_by, now));
                let _ = reply.send(result);
            }
            Command::WaitClosed { id, reply } => {
                if let Some(engine) = self.archive.get(&id) {
                    let _ = reply.send(Ok(engine.summary()));
                } else if self.active.iter().any(|e| *e.id() == id) {
                    self.waiters.entry(id).or_default().push(reply);
                } else {
                    let _ = reply.send(Err(CouncilError::WorkflowNotFound(id)));
                }
            }
            Command::Shutdown { reply } => {
                // Handled by the loop
                let _ = reply.send(Ok(()));
            }
        }
    }

    // ── Completions ──────────────────────────────────────────────────

    fn on_completion(&mut self, completion: Completion) {
        let now = Utc::now();
        match completion {
            Completion::Task {
                workflow_id,
                task_id,
                attempt,
                outcome,
            } => {
                let key = (workflow_id.clone(), task_id.clone());
                if self.inflight.get(&key).is_some_and(|f| f.attempt == attempt) {
                    self.inflight.remove(&key);
                }
                let Some(engine) = self.find_mut(&workflow_id) else {
                    tracing::warn!(workflow_id = %workflow_id, task_id = %task_id, "Completion for unknown workflow");
                    return;
                };
                if let Err(err) = engine.complete(&task_id, attempt, outcome, now) {
                    tracing::warn!(
                        workflow_id = %workflow_id,
                        task_id = %task_id,
                        attempt,
                        error = %err,
                        "Completion rejected"
                    );
                }
                let events = engine.drain_events();
                self.outbox.extend(events.into_iter().map(Record::Event));
            }
            Completion::Ballot {
                workflow_id,
                crisis_id,
                role,
                ballot,
            } => {
                let result = self.mutate(&workflow_id, |e, now| e.cast_vote(&crisis_id, &role, ballot, now));
                if let Err(err) = result {
                    tracing::warn!(
                        workflow_id = %workflow_id,
                        crisis_id = %crisis_id,
                        role = %role,
                        error = %err,
                        "Ballot discarded"
                    );
                }
            }
        }
    }

    // ── Scheduling ───────────────────────────────────────────────────

    fn capacity(&self) -> usize {
        self.policy
            .scheduler
            .max_concurrency
            .saturating_sub(self.inflight.len())
    }

    fn advance(&mut self, periodic: bool) {
        let now = Utc::now();
        if periodic {
            self.ticks += 1;
        }
        let snapshot_due = periodic
            && self.persist_snapshots
            && self.snapshot_interval > 0
            && self.ticks % self.snapshot_interval == 0;

        let mut index = 0;
        while index < self.active.len() {
            let capacity = self.capacity();
            let engine = &mut self.active[index];
            let id = engine.id().clone();
            let dispatches = match engine.tick(now, capacity) {
                Ok(dispatches) => dispatches,
                Err(err) => {
                    tracing::error!(workflow_id = %id, error = %err, "Workflow tick failed");
                    Vec::new()
                }
            };
            let events = engine.drain_events();
            self.outbox.extend(events.into_iter().map(Record::Event));

            // Cancel attempts the engine no longer considers running
            let state = self.active[index].state();
            self.inflight.retain(|(wf, task), flight| {
                if *wf != id {
                    return true;
                }
                let live = state
                    .task(task)
                    .is_some_and(|t| t.status == TaskStatus::Running && t.attempts == flight.attempt);
                if !live {
                    let _ = flight.cancel.send(true);
                }
                live
            });

            self.launch(dispatches);

            if self.active[index].is_closed() {
                let engine = self.active.remove(index);
                self.close(engine);
            } else {
                if snapshot_due {
                    let state = self.active[index].snapshot();
                    self.outbox.push(Record::Snapshot(Box::new(state)));
                }
                index += 1;
            }
        }

        self.flush();
    }

    fn launch(&mut self, dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            match dispatch {
                Dispatch::Execute(invocation) => {
                    let (cancel_tx, cancel_rx) = watch::channel(false);
                    let key = (invocation.workflow_id.clone(), invocation.task_id.clone());
                    let flight = Flight {
                        attempt: invocation.attempt,
                        cancel: cancel_tx,
                    };
                    if let Some(previous) = self.inflight.insert(key, flight) {
                        let _ = previous.cancel.send(true);
                    }
                    worker::spawn_execution(
                        self.provider.clone(),
                        invocation,
                        cancel_rx,
                        self.completions.clone(),
                    );
                }
                Dispatch::Deliberate(request) => {
                    tracing::debug!(
                        workflow_id = %request.workflow_id,
                        crisis_id = %request.case.id,
                        role = %request.role,
                        "Ballot requested"
                    );
                    worker::spawn_deliberation(self.provider.clone(), request, self.completions.clone());
                }
            }
        }
    }

    fn close(&mut self, engine: WorkflowEngine) {
        let summary = engine.summary();
        tracing::info!(
            workflow_id = %summary.id,
            status = %summary.status,
            reason = summary.closing_reason.as_deref().unwrap_or(""),
            "Workflow closed"
        );
        if self.persist_snapshots {
            self.outbox.push(Record::Snapshot(Box::new(engine.snapshot())));
        }
        for waiter in self.waiters.remove(&summary.id).unwrap_or_default() {
            let _ = waiter.send(Ok(summary.clone()));
        }
        self.retire(engine);
    }

    /// Archive a closed workflow, evicting the oldest past the limit
    fn retire(&mut self, engine: WorkflowEngine) {
        let id = engine.id().clone();
        if self.archive.insert(id.clone(), engine).is_none() {
            self.archive_order.push_back(id);
        }
        while self.archive_limit > 0 && self.archive_order.len() > self.archive_limit {
            if let Some(evicted) = self.archive_order.pop_front() {
                self.archive.remove(&evicted);
                tracing::debug!(workflow_id = %evicted, "Closed workflow evicted from memory");
            }
        }
    }

    /// Hand queued records to the persistence task without waiting on it
    fn flush(&mut self) {
        for record in std::mem::take(&mut self.outbox) {
            if self.records.send(record).is_err() {
                tracing::error!("Persistence task is gone; audit record dropped");
            }
        }
    }

    fn stop(mut self) {
        for flight in self.inflight.values() {
            let _ = flight.cancel.send(true);
        }
        if self.persist_snapshots {
            let snapshots: Vec<Record> = self
                .active
                .iter()
                .map(|e| Record::Snapshot(Box::new(e.snapshot())))
                .collect();
            self.outbox.extend(snapshots);
        }
        self.flush();
        // Dropping `self` closes the persistence channel
    }
}

/// Drain audit events and snapshots in order
async fn persist(
    mut records: mpsc::UnboundedReceiver<Record>,
    audit: Arc<dyn AuditSink>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
) {
    while let Some(record) = records.recv().await {
        match record {
            Record::Event(event) => {
                if let Err(err) = audit.append(&event).await {
                    tracing::error!(
                        workflow_id = %event.workflow_id,
                        sequence = event.sequence,
                        error = %err,
                        "Failed to append audit event"
                    );
                }
            }
            Record::Snapshot(state) => {
                if let Some(store) = &snapshots {
                    if let Err(err) = store.save(&state).await {
                        tracing::error!(workflow_id = %state.id, error = %err, "Failed to save snapshot");
                    }
                }
            }
        }
    }
    if let Err(err) = audit.flush().await {
        tracing::error!(error = %err, "Failed to flush audit sink");
    }
}
