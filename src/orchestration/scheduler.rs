//! Group scheduler: the coordinating control loop.
//!
//! Each round takes the ready frontier as one group (bounded by
//! `max_parallelism`, cheapest tasks first), runs every task in its own
//! worker, waits for the whole group, integrates the group's branches into
//! the main line and checkpoints. No group starts before the previous one
//! is merged. Semantic conflicts hold back only the tasks that depend on the
//! conflicting work while a decision is pending.

use futures::future::join_all;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::context::{ChangeSet, ContextManager, ContextScope, ExecutionContext, Release};
use crate::core::{
    EvidenceEntry, ScoreHistory, SharedGraph, TaskGraph, TaskId, TaskNode, TaskStatus,
};
use crate::orchestration::escalation::{Escalation, EscalationChannel, Reply, ResolutionChoice};
use crate::orchestration::report::{FailureKind, FailureReport, RunOutcome, RunReport};
use crate::orchestration::resolver::{
    BranchResult, ConflictRecord, ConflictResolver, Integration, Resolution,
};
use crate::orchestration::runner::{settle_failed, TaskResult, TaskRunner, CANCELLED_REASON};
use crate::state::{Checkpoint, CheckpointReason, CheckpointStore, ResumePointer};
use crate::{rlog, rlog_debug, rlog_error, rlog_warn, Error, Result};

/// Events emitted as the run progresses, for observers such as the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    GroupStarted {
        round: u32,
        tasks: Vec<TaskId>,
    },
    TaskStarted {
        task_id: TaskId,
        branch: String,
    },
    TaskFinished {
        task_id: TaskId,
        status: TaskStatus,
        attempts: u32,
    },
    MergeFinished {
        round: u32,
        paths: usize,
        conflicts: usize,
    },
    ConflictEscalated {
        escalation_id: String,
        path: PathBuf,
        tasks: Vec<TaskId>,
    },
    /// `None` means the decision was deferred.
    ConflictSettled {
        escalation_id: String,
        choice: Option<ResolutionChoice>,
    },
    CheckpointWritten {
        seq: u64,
        reason: CheckpointReason,
    },
    HandedOff {
        round: u32,
    },
}

type EventSender = Option<mpsc::UnboundedSender<SchedulerEvent>>;

fn emit(events: &EventSender, event: SchedulerEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Wall-clock budget of one session.
#[derive(Debug, Clone)]
pub struct SessionBudget {
    started: Instant,
    limit: Option<Duration>,
    handoff_ratio: f64,
    /// Seconds spent in earlier sessions of the same run.
    prior_secs: f64,
}

impl SessionBudget {
    pub fn new(limit: Option<Duration>, handoff_ratio: f64) -> Self {
        Self {
            started: Instant::now(),
            limit,
            handoff_ratio,
            prior_secs: 0.0,
        }
    }

    pub fn with_prior(mut self, prior_secs: f64) -> Self {
        self.prior_secs = prior_secs;
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn total_secs(&self) -> f64 {
        self.prior_secs + self.elapsed().as_secs_f64()
    }

    /// True once the handoff threshold of the session limit is crossed.
    pub fn exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| {
            self.elapsed().as_secs_f64() >= limit.as_secs_f64() * self.handoff_ratio
        })
    }
}

/// Asks a running scheduler for a checkpoint at the next round boundary.
#[derive(Debug, Clone, Default)]
pub struct CheckpointTrigger(Arc<AtomicBool>);

impl CheckpointTrigger {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Ready tasks not waiting on a pending decision, ordered by
/// (complexity, id) and truncated to `max_parallelism`.
pub fn select_group(
    graph: &TaskGraph,
    held: &HashSet<TaskId>,
    max_parallelism: usize,
) -> Vec<TaskId> {
    let ready_ids = graph.ready_nodes();
    let mut ready: Vec<&TaskNode> = ready_ids
        .iter()
        .filter_map(|id| graph.get(id))
        .filter(|node| !node.dependencies.iter().any(|dep| held.contains(dep)))
        .collect();
    ready.sort_by(|a, b| (a.complexity, &a.id).cmp(&(b.complexity, &b.id)));
    ready.truncate(max_parallelism.max(1));
    ready.into_iter().map(|node| node.id.clone()).collect()
}

/// Upper bound on one checkpoint write attempt.
const CHECKPOINT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

type ReplyMessage = (String, Result<Reply>);

struct RunState {
    graph: TaskGraph,
    round: u32,
    rounds_this_session: u32,
    history: ScoreHistory,
    conflicts: Vec<ConflictRecord>,
    /// Escalations sent out and not yet answered, by escalation id.
    awaiting: HashMap<String, Escalation>,
    deferred: Vec<Escalation>,
    failures: Vec<FailureReport>,
    warnings: Vec<String>,
    budget: SessionBudget,
    last_checkpoint: Instant,
    checkpoint: Option<PathBuf>,
    replies_tx: mpsc::UnboundedSender<ReplyMessage>,
    replies_rx: mpsc::UnboundedReceiver<ReplyMessage>,
}

impl RunState {
    fn new(graph: TaskGraph, budget: SessionBudget) -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Self {
            graph,
            round: 0,
            rounds_this_session: 0,
            history: ScoreHistory::default(),
            conflicts: Vec::new(),
            awaiting: HashMap::new(),
            deferred: Vec::new(),
            failures: Vec::new(),
            warnings: Vec::new(),
            budget,
            last_checkpoint: Instant::now(),
            checkpoint: None,
            replies_tx,
            replies_rx,
        }
    }

    /// Tasks whose dependents wait on an open conflict.
    fn held(&self) -> HashSet<TaskId> {
        self.open_escalations()
            .flat_map(|e| e.tasks())
            .collect()
    }

    fn open_escalations(&self) -> impl Iterator<Item = &Escalation> {
        self.awaiting.values().chain(self.deferred.iter())
    }
}

/// What one worker produced: its context and a result per task it ran.
struct Slot {
    scope: ContextScope,
    context: Option<ExecutionContext>,
    results: Vec<TaskResult>,
}

#[derive(Clone)]
struct Worker {
    contexts: Arc<ContextManager>,
    runner: Arc<TaskRunner>,
    graph: Arc<SharedGraph>,
    cancel: CancellationToken,
    events: EventSender,
}

impl Worker {
    async fn run(self, scope: ContextScope) -> Slot {
        let tasks = scope.tasks();
        let context = match self.contexts.acquire(scope.clone()).await {
            Ok(context) => context,
            Err(e) => {
                rlog_error!("No execution context for {}: {}", scope, e);
                let results = tasks
                    .iter()
                    .map(|id| self.give_up(id, FailureKind::ContextAcquisition, &e.to_string()))
                    .collect();
                return Slot {
                    scope,
                    context: None,
                    results,
                };
            }
        };

        let mut results = Vec::with_capacity(tasks.len());
        for id in tasks {
            if self.cancel.is_cancelled() {
                break;
            }
            emit(
                &self.events,
                SchedulerEvent::TaskStarted {
                    task_id: id.clone(),
                    branch: context.branch.clone(),
                },
            );
            let result = self.runner.run(&self.graph, &id, &context, &self.cancel).await;
            let settled = if result.is_done() {
                let title = self
                    .graph
                    .node(&id)
                    .map(|n| n.description.lines().next().unwrap_or_default().to_string())
                    .unwrap_or_default();
                self.contexts
                    .seal(&context, &format!("relay: {} {}", id, title))
                    .await
            } else {
                self.contexts.discard(&context).await
            };
            if let Err(e) = settled {
                rlog_warn!(
                    "Settling context {} after task {} failed: {}",
                    context.id.short(),
                    id,
                    e
                );
            }
            results.push(result);
        }
        Slot {
            scope,
            context: Some(context),
            results,
        }
    }

    fn give_up(&self, id: &TaskId, kind: FailureKind, reason: &str) -> TaskResult {
        let status = settle_failed(&self.graph, id, &format!("{:?}: {}", kind, reason));
        TaskResult {
            task_id: id.clone(),
            status,
            attempts: 0,
            failure: Some(FailureReport::for_task(id, kind, reason)),
        }
    }
}

pub struct GroupScheduler {
    config: Config,
    contexts: Arc<ContextManager>,
    runner: Arc<TaskRunner>,
    resolver: ConflictResolver,
    escalations: EscalationChannel,
    store: Option<CheckpointStore>,
    events: EventSender,
    cancel: CancellationToken,
    trigger: CheckpointTrigger,
}

impl GroupScheduler {
    pub fn new(
        config: Config,
        contexts: Arc<ContextManager>,
        runner: Arc<TaskRunner>,
        escalations: EscalationChannel,
    ) -> Result<Self> {
        Ok(Self {
            config,
            contexts,
            runner,
            resolver: ConflictResolver::new()?,
            escalations,
            store: None,
            events: None,
            cancel: CancellationToken::new(),
            trigger: CheckpointTrigger::default(),
        })
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn checkpoint_trigger(&self) -> CheckpointTrigger {
        self.trigger.clone()
    }

    fn budget(&self, prior_secs: f64) -> SessionBudget {
        SessionBudget::new(
            self.config.budget.session_limit_secs.map(Duration::from_secs),
            self.config.budget.handoff_ratio,
        )
        .with_prior(prior_secs)
    }

    /// Run a freshly built graph to the end, a handoff or a cancellation.
    pub async fn run(&self, graph: TaskGraph) -> RunReport {
        rlog!(
            "Starting run: {} tasks, {} edges, backend {}",
            graph.len(),
            graph.edge_count(),
            self.contexts.backend_name()
        );
        let state = RunState::new(graph, self.budget(0.0));
        self.execute(state).await
    }

    /// Continue from a checkpoint. Tasks stopped by a cancellation are
    /// re-opened and deferred escalations are asked again.
    pub async fn resume(&self, checkpoint: Checkpoint) -> RunReport {
        let mut graph = match checkpoint.graph() {
            Ok(graph) => graph,
            Err(e) => return RunReport::rejected(&e),
        };
        graph.reset_in_flight();
        for id in graph.ids_with_status(TaskStatus::Blocked) {
            let cancelled = graph
                .get(&id)
                .is_some_and(|n| n.blocked_reason.as_deref() == Some(CANCELLED_REASON));
            if cancelled {
                graph.unblock(&id, "re-opened on resume");
            }
        }

        let mut state = RunState::new(graph, self.budget(checkpoint.elapsed_secs));
        state.round = checkpoint.resume.round;
        state.history = checkpoint.history;
        state.conflicts = checkpoint.conflicts;
        rlog!(
            "Resuming from checkpoint {} at round {} ({} open escalations)",
            checkpoint.seq,
            state.round,
            checkpoint.pending_escalations.len()
        );
        for escalation in checkpoint.pending_escalations {
            self.escalate(&mut state, escalation);
        }
        self.execute(state).await
    }

    async fn execute(&self, mut state: RunState) -> RunReport {
        let result = match self.contexts.prepare().await {
            Ok(()) => self.drive(&mut state).await,
            Err(e) => Err(e),
        };
        let (outcome, error) = match result {
            Ok(outcome) => (outcome, None),
            Err(e @ Error::Stalled { .. }) => (RunOutcome::Stalled, Some(e)),
            Err(e) => {
                rlog_error!("Run aborted: {}", e);
                (RunOutcome::Partial, Some(e))
            }
        };
        self.finish(state, outcome, error).await
    }

    async fn drive(&self, state: &mut RunState) -> Result<RunOutcome> {
        let interval = Duration::from_secs(self.config.checkpoint.interval_secs);
        loop {
            if self.cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            while let Ok((id, reply)) = state.replies_rx.try_recv() {
                self.settle_escalation(state, &id, reply).await?;
            }

            if self.trigger.take() {
                self.checkpoint(state, CheckpointReason::Requested).await;
            } else if !interval.is_zero() && state.last_checkpoint.elapsed() >= interval {
                self.checkpoint(state, CheckpointReason::Interval).await;
            }

            let group = select_group(
                &state.graph,
                &state.held(),
                self.config.scheduler.max_parallelism,
            );
            if !group.is_empty() {
                if state.rounds_this_session > 0 && state.budget.exhausted() {
                    rlog!(
                        "Session budget reached after {:.1}s, handing off at round {}",
                        state.budget.elapsed().as_secs_f64(),
                        state.round
                    );
                    return Ok(RunOutcome::HandedOff);
                }
                self.run_group(state, group).await?;
                continue;
            }

            if !state.awaiting.is_empty() {
                rlog_debug!("Waiting on {} escalation(s)", state.awaiting.len());
                let received = tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    received = state.replies_rx.recv() => received,
                };
                if let Some((id, reply)) = received {
                    self.settle_escalation(state, &id, reply).await?;
                }
                continue;
            }

            if state.graph.all_done() && state.deferred.is_empty() {
                return Ok(RunOutcome::Completed);
            }
            return self.wind_down(state);
        }
    }

    /// Nothing is ready and nothing is awaited: either the rest waits on
    /// failures or deferred decisions, or the graph stalled.
    fn wind_down(&self, state: &mut RunState) -> Result<RunOutcome> {
        let mut waiting: HashSet<TaskId> = HashSet::new();
        for id in state.held() {
            waiting.extend(state.graph.transitive_dependents(&id));
        }
        let stalled: Vec<TaskId> = state
            .graph
            .ids_with_status(TaskStatus::Pending)
            .into_iter()
            .filter(|id| !waiting.contains(id))
            .collect();
        if stalled.is_empty() {
            return Ok(RunOutcome::Partial);
        }

        let unmet: Vec<(TaskId, TaskId)> = stalled
            .iter()
            .flat_map(|id| {
                state
                    .graph
                    .unmet_dependencies(id)
                    .into_iter()
                    .map(move |dep| (id.clone(), dep))
            })
            .collect();
        for id in &stalled {
            state.graph.block(id, "stalled: dependencies can never complete");
        }
        rlog_error!("Graph stalled with {} pending task(s)", stalled.len());
        Err(Error::Stalled {
            blocked: stalled,
            unmet,
        })
    }

    async fn run_group(&self, state: &mut RunState, group: Vec<TaskId>) -> Result<()> {
        let round = state.round;
        rlog!(
            "Round {}: [{}]",
            round,
            group.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
        );
        emit(
            &self.events,
            SchedulerEvent::GroupStarted {
                round,
                tasks: group.clone(),
            },
        );

        let mut staged = state.graph.clone();
        for id in &group {
            staged.apply_in_place(
                id,
                TaskStatus::Ready,
                Some(EvidenceEntry::note(format!("scheduled in round {}", round))),
            )?;
        }
        let shared = Arc::new(SharedGraph::new(staged));

        let scopes: Vec<ContextScope> = if group.len() <= self.config.scheduler.sequential_threshold
        {
            let scope = match group.as_slice() {
                [only] => ContextScope::Task(only.clone()),
                _ => ContextScope::Group(group.clone()),
            };
            vec![scope]
        } else {
            group.iter().cloned().map(ContextScope::Task).collect()
        };

        let worker = Worker {
            contexts: Arc::clone(&self.contexts),
            runner: Arc::clone(&self.runner),
            graph: Arc::clone(&shared),
            cancel: self.cancel.clone(),
            events: self.events.clone(),
        };
        let handles: Vec<_> = scopes
            .iter()
            .cloned()
            .map(|scope| tokio::spawn(worker.clone().run(scope)))
            .collect();
        let mut slots = Vec::with_capacity(handles.len());
        for (scope, joined) in scopes.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    rlog_error!("Worker for {} died: {}", scope, e);
                    let results = scope
                        .tasks()
                        .iter()
                        .map(|id| worker.give_up(id, FailureKind::ExecutionFailed, &e.to_string()))
                        .collect();
                    slots.push(Slot {
                        scope,
                        context: None,
                        results,
                    });
                }
            }
        }

        let integration = match self.integrate(&shared, &slots, round).await {
            Ok(integration) => integration,
            Err(e) => {
                // The round is dropped whole; resume runs it again.
                for context in slots.iter().filter_map(|s| s.context.as_ref()) {
                    let _ = self.contexts.release(context, Release::Failed).await;
                }
                return Err(e);
            }
        };

        for slot in &slots {
            let Some(context) = &slot.context else {
                continue;
            };
            let reason = if slot.results.iter().any(|r| r.is_done()) {
                Release::Merged
            } else if self.cancel.is_cancelled() {
                Release::Cancelled
            } else {
                Release::Failed
            };
            if let Err(e) = self.contexts.release(context, reason).await {
                rlog_warn!("Releasing context for {} failed: {}", slot.scope, e);
            }
        }

        state.graph = shared.snapshot()?;
        state.conflicts.extend(integration.records);
        for escalation in integration.escalations {
            self.escalate(state, escalation);
        }

        for result in slots.iter().flat_map(|s| s.results.iter()) {
            emit(
                &self.events,
                SchedulerEvent::TaskFinished {
                    task_id: result.task_id.clone(),
                    status: result.status,
                    attempts: result.attempts,
                },
            );
            state.history.retried_attempts += result.attempts.saturating_sub(1);
            if result.is_done() {
                state.history.completed += 1;
            } else if result.is_failure() {
                if result.status == TaskStatus::Failed {
                    state.history.failed += 1;
                }
                if let Some(failure) = &result.failure {
                    state.failures.push(failure.clone());
                }
                let reason = format!("upstream task {} failed", result.task_id);
                for blocked in state.graph.block_dependents(&result.task_id, &reason) {
                    rlog_debug!("Task {} blocked: {}", blocked, reason);
                    state.failures.push(FailureReport::for_task(
                        &blocked,
                        FailureKind::UpstreamFailed,
                        reason.clone(),
                    ));
                }
            }
        }

        state.round += 1;
        state.rounds_this_session += 1;
        self.checkpoint(state, CheckpointReason::GroupComplete).await;
        Ok(())
    }

    /// Merge every context with at least one Done task into the main line,
    /// in the resolver's order.
    async fn integrate(
        &self,
        graph: &SharedGraph,
        slots: &[Slot],
        round: u32,
    ) -> Result<Integration> {
        let mut branches = Vec::new();
        for slot in slots {
            let Some(context) = &slot.context else {
                continue;
            };
            let done: Vec<TaskId> = slot
                .results
                .iter()
                .filter(|r| r.is_done())
                .map(|r| r.task_id.clone())
                .collect();
            if done.is_empty() {
                continue;
            }
            let mut complexity = 1;
            for id in &done {
                complexity = complexity.max(graph.node(id)?.complexity);
            }
            branches.push(BranchResult {
                tasks: done,
                branch: context.branch.clone(),
                complexity,
                changes: self.contexts.changes(context).await?,
            });
        }
        if branches.is_empty() {
            return Ok(Integration::default());
        }

        let paths: BTreeSet<PathBuf> = branches
            .iter()
            .flat_map(|b| b.changes.keys().cloned())
            .collect();
        let main = self.contexts.read_main(paths.into_iter().collect()).await?;
        let integration = self.resolver.integrate(&main, branches)?;
        self.contexts
            .commit_main(
                integration.merged.clone(),
                &format!("relay: integrate round {}", round),
            )
            .await?;
        rlog!(
            "Round {} merged: {} path(s), {} conflict(s), {} escalated",
            round,
            integration.merged.len(),
            integration.records.len(),
            integration.escalations.len()
        );
        emit(
            &self.events,
            SchedulerEvent::MergeFinished {
                round,
                paths: integration.merged.len(),
                conflicts: integration.records.len(),
            },
        );
        Ok(integration)
    }

    /// Send an escalation out without blocking the loop; the answer comes
    /// back through the run's reply channel.
    fn escalate(&self, state: &mut RunState, escalation: Escalation) {
        emit(
            &self.events,
            SchedulerEvent::ConflictEscalated {
                escalation_id: escalation.id.clone(),
                path: escalation.path.clone(),
                tasks: escalation.tasks(),
            },
        );
        let id = escalation.id.clone();
        state.awaiting.insert(id.clone(), escalation.clone());
        let channel = self.escalations.clone();
        let replies = state.replies_tx.clone();
        tokio::spawn(async move {
            let reply = channel.request(escalation).await;
            let _ = replies.send((id, reply));
        });
    }

    async fn settle_escalation(
        &self,
        state: &mut RunState,
        id: &str,
        reply: Result<Reply>,
    ) -> Result<()> {
        let Some(escalation) = state.awaiting.remove(id) else {
            return Ok(());
        };
        let choice = match reply {
            Ok(Reply::Choose(choice)) => choice,
            Ok(Reply::Defer) => {
                rlog!("Conflict on {} deferred", escalation.path.display());
                self.defer(state, escalation);
                return Ok(());
            }
            Err(e) => {
                let warning = format!(
                    "no decision for conflict on {}: {}",
                    escalation.path.display(),
                    e
                );
                rlog_warn!("{}", warning);
                state.warnings.push(warning);
                self.defer(state, escalation);
                return Ok(());
            }
        };

        let main = self
            .contexts
            .read_main(vec![escalation.path.clone()])
            .await?;
        let current = main.get(&escalation.path).cloned().flatten();
        let applied = match self
            .resolver
            .apply_choice(&escalation, choice, current.as_deref())
        {
            Ok(applied) => applied,
            Err(e) => {
                rlog_warn!("Cannot apply {} to {}: {}", choice, escalation.path.display(), e);
                state.warnings.push(e.to_string());
                self.defer(state, escalation);
                return Ok(());
            }
        };
        if let Some(warning) = applied.warning {
            state.warnings.push(warning);
        }
        if applied.content != current {
            let mut changes = ChangeSet::new();
            changes.insert(escalation.path.clone(), applied.content);
            self.contexts
                .commit_main(
                    changes,
                    &format!(
                        "relay: resolve conflict on {} ({})",
                        escalation.path.display(),
                        choice
                    ),
                )
                .await?;
        }

        let outstanding = state
            .open_escalations()
            .any(|e| e.record_id == escalation.record_id);
        if !outstanding {
            if let Some(record) = state
                .conflicts
                .iter_mut()
                .find(|r| r.id == escalation.record_id)
            {
                record.resolution = Resolution::UserResolved { choice };
            }
        }
        rlog!(
            "Conflict on {} resolved with {}",
            escalation.path.display(),
            choice
        );
        emit(
            &self.events,
            SchedulerEvent::ConflictSettled {
                escalation_id: escalation.id,
                choice: Some(choice),
            },
        );
        Ok(())
    }

    fn defer(&self, state: &mut RunState, escalation: Escalation) {
        emit(
            &self.events,
            SchedulerEvent::ConflictSettled {
                escalation_id: escalation.id.clone(),
                choice: None,
            },
        );
        state.deferred.push(escalation);
    }

    fn resume_pointer(&self, state: &RunState) -> ResumePointer {
        ResumePointer {
            round: state.round,
            next_group: select_group(
                &state.graph,
                &state.held(),
                self.config.scheduler.max_parallelism,
            ),
        }
    }

    /// Write a checkpoint, retrying immediately. Persistent failure leaves
    /// the run going in memory with a warning.
    async fn checkpoint(&self, state: &mut RunState, reason: CheckpointReason) {
        state.last_checkpoint = Instant::now();
        let Some(store) = &self.store else {
            return;
        };
        let mut open: Vec<Escalation> = state.open_escalations().cloned().collect();
        open.sort_by(|a, b| a.id.cmp(&b.id));
        let checkpoint = Checkpoint::capture(&state.graph, self.resume_pointer(state), reason)
            .with_conflicts(state.conflicts.clone(), open)
            .with_elapsed(state.budget.total_secs())
            .with_history(state.history.clone());

        let attempts = self.config.checkpoint.write_retries + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match store
                .write_within(checkpoint.clone(), CHECKPOINT_WRITE_TIMEOUT)
                .await
            {
                Ok(written) => {
                    state.checkpoint = Some(store.path_of(written.seq));
                    emit(
                        &self.events,
                        SchedulerEvent::CheckpointWritten {
                            seq: written.seq,
                            reason,
                        },
                    );
                    return;
                }
                Err(e) => {
                    rlog_warn!(
                        "Checkpoint write failed (attempt {}/{}): {}",
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }
        let warning = format!(
            "checkpoint writes are failing ({}); progress is only in memory",
            last_error
        );
        rlog_error!("{}", warning);
        state.warnings.push(warning);
    }

    async fn finish(
        &self,
        mut state: RunState,
        outcome: RunOutcome,
        error: Option<Error>,
    ) -> RunReport {
        let release = if outcome == RunOutcome::Cancelled {
            for id in state.graph.ids() {
                state.graph.block(&id, CANCELLED_REASON);
            }
            Release::Cancelled
        } else {
            Release::Failed
        };
        let released = self.contexts.release_all(release).await;
        if released > 0 {
            rlog_debug!("Released {} leftover context(s)", released);
        }

        let reason = match outcome {
            RunOutcome::Cancelled => CheckpointReason::Cancelled,
            RunOutcome::HandedOff => CheckpointReason::Budget,
            _ => CheckpointReason::Final,
        };
        self.checkpoint(&mut state, reason).await;
        if outcome == RunOutcome::HandedOff {
            emit(&self.events, SchedulerEvent::HandedOff { round: state.round });
        }

        let resume_pointer =
            (outcome != RunOutcome::Completed).then(|| self.resume_pointer(&state));
        let mut report = RunReport::new(outcome, &state.graph);
        report.failures = std::mem::take(&mut state.failures);
        if let Some(e) = &error {
            report.push_error(e);
        }
        for escalation in state.open_escalations() {
            report.failures.push(FailureReport::new(
                escalation.incoming_tasks.first().cloned(),
                FailureKind::ConflictEscalation,
                format!(
                    "conflict on {} needs a decision (escalation {})",
                    escalation.path.display(),
                    escalation.id
                ),
            ));
        }
        report.unresolved_conflicts = state
            .conflicts
            .iter()
            .filter(|r| r.is_unresolved())
            .cloned()
            .collect();
        report.rounds = state.round;
        report.elapsed = state.budget.elapsed();
        report.resume_pointer = resume_pointer;
        report.checkpoint = state.checkpoint.take();
        report.warnings = std::mem::take(&mut state.warnings);
        rlog!(
            "Run finished: {:?} after {} round(s), {} failure(s)",
            outcome,
            report.rounds,
            report.failures.len()
        );
        report
    }
}
