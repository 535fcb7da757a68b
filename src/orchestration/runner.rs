//! Drives one task through Running -> Verifying -> Done/Failed.
//!
//! The runner owns sequencing, timeouts and evidence capture. What execution
//! and verification actually do is up to the capabilities.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::context::ExecutionContext;
use crate::core::{
    AttemptOutcome, AttemptRecord, EvidenceEntry, SharedGraph, TaskId, TaskStatus,
};
use crate::orchestration::capability::{
    ExecutionRequest, Executor, VerificationRequest, Verifier,
};
use crate::orchestration::report::{FailureKind, FailureReport};
use crate::{rlog_debug, rlog_error, rlog_warn, Result};

/// Blocked reason for tasks stopped by run cancellation.
pub const CANCELLED_REASON: &str = "run cancelled";

/// Terminal result of running one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub task_id: TaskId,
    /// Done, Failed, or Blocked when cancelled.
    pub status: TaskStatus,
    pub attempts: u32,
    pub failure: Option<FailureReport>,
}

impl TaskResult {
    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    /// Failed, or Blocked by something other than cancellation.
    pub fn is_failure(&self) -> bool {
        match self.status {
            TaskStatus::Failed => true,
            TaskStatus::Blocked => self
                .failure
                .as_ref()
                .is_some_and(|f| f.kind != FailureKind::Cancelled),
            _ => false,
        }
    }
}

/// Take a task out of play after an error outside its attempts: Failed when
/// the transition is legal, Blocked otherwise. Returns the status the node
/// ended in.
pub(crate) fn settle_failed(graph: &SharedGraph, task_id: &TaskId, reason: &str) -> TaskStatus {
    let note = EvidenceEntry::note(reason.to_string());
    let Err(e) = graph.apply(task_id, TaskStatus::Failed, Some(note)) else {
        return TaskStatus::Failed;
    };
    rlog_warn!("Task {} cannot fail ({}); blocking it", task_id, e);
    if let Err(e) = graph.block(task_id, reason) {
        rlog_error!("Task {} cannot be blocked either: {}", task_id, e);
    }
    graph.status(task_id).unwrap_or(TaskStatus::Failed)
}

pub struct TaskRunner {
    executor: Arc<dyn Executor>,
    verifier: Arc<dyn Verifier>,
    max_retries: u32,
    timeout: Duration,
}

/// Failure of a single attempt, kept to describe the final one.
struct AttemptFailure {
    kind: FailureKind,
    message: String,
}

impl TaskRunner {
    pub fn new(
        executor: Arc<dyn Executor>,
        verifier: Arc<dyn Verifier>,
        config: &RunnerConfig,
    ) -> Self {
        Self {
            executor,
            verifier,
            max_retries: config.max_retries,
            timeout: config.task_timeout(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Run a Ready task to a terminal status inside `context`.
    ///
    /// Never returns an error: unexpected failures end the task as Failed
    /// with a structured report.
    pub async fn run(
        &self,
        graph: &SharedGraph,
        task_id: &TaskId,
        context: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> TaskResult {
        match self.drive(graph, task_id, context, cancel).await {
            Ok(result) => result,
            Err(e) => {
                rlog_error!("Runner error on task {}: {}", task_id, e);
                let status = settle_failed(graph, task_id, &format!("runner error: {}", e));
                let attempts = graph
                    .node(task_id)
                    .map(|n| n.evidence.attempt_count())
                    .unwrap_or(0);
                TaskResult {
                    task_id: task_id.clone(),
                    status,
                    attempts,
                    failure: Some(FailureReport::for_task(
                        task_id,
                        FailureKind::ExecutionFailed,
                        e.to_string(),
                    )),
                }
            }
        }
    }

    async fn drive(
        &self,
        graph: &SharedGraph,
        task_id: &TaskId,
        context: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<TaskResult> {
        graph.apply(
            task_id,
            TaskStatus::Running,
            Some(EvidenceEntry::note(format!(
                "running in context {} on {}",
                context.id.short(),
                context.branch
            ))),
        )?;

        let max_attempts = self.max_attempts();
        let limit = graph
            .node(task_id)?
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);
        let mut last_failure: Option<AttemptFailure> = None;

        for attempt in 1..=max_attempts {
            if graph.status(task_id)? == TaskStatus::Verifying {
                graph.apply(
                    task_id,
                    TaskStatus::Running,
                    Some(EvidenceEntry::note(format!(
                        "retry {} of {}",
                        attempt - 1,
                        self.max_retries
                    ))),
                )?;
            }

            let node = graph.node(task_id)?;
            let started_at = Utc::now();
            let request = ExecutionRequest {
                task: node.clone(),
                workspace: context.root.clone(),
                attempt,
                failure_context: node.evidence.failure_context(),
            };

            let executed = tokio::select! {
                _ = cancel.cancelled() => {
                    return self.cancelled(graph, task_id, attempt, started_at);
                }
                result = timeout(limit, self.executor.execute(request)) => result,
            };

            let failure = match executed {
                Err(_) => Some((
                    AttemptOutcome::TimedOut {
                        phase: "execute".to_string(),
                    },
                    AttemptFailure {
                        kind: FailureKind::Timeout,
                        message: format!("execute timed out after {:?}", limit),
                    },
                )),
                Ok(Err(e)) => Some((
                    AttemptOutcome::ExecutionFailed {
                        error: e.to_string(),
                    },
                    AttemptFailure {
                        kind: FailureKind::ExecutionFailed,
                        message: e.to_string(),
                    },
                )),
                Ok(Ok(_)) => None,
            };
            if let Some((outcome, failure)) = failure {
                rlog_debug!(
                    "Task {} attempt {}/{} failed to execute: {}",
                    task_id,
                    attempt,
                    max_attempts,
                    failure.message
                );
                record_attempt(graph, task_id, attempt, started_at, outcome, &failure.message)?;
                last_failure = Some(failure);
                continue;
            }

            graph.apply(task_id, TaskStatus::Verifying, None)?;
            let request = VerificationRequest {
                task: node,
                workspace: context.root.clone(),
                attempt,
            };
            let verified = tokio::select! {
                _ = cancel.cancelled() => {
                    return self.cancelled(graph, task_id, attempt, started_at);
                }
                result = timeout(limit, self.verifier.verify(request)) => result,
            };

            let (outcome, failure) = match verified {
                Ok(Ok(outcome)) if outcome.passed => {
                    record_attempt(
                        graph,
                        task_id,
                        attempt,
                        started_at,
                        AttemptOutcome::Passed,
                        &outcome.summary,
                    )?;
                    graph.apply(task_id, TaskStatus::Done, None)?;
                    rlog_debug!("Task {} done after {} attempt(s)", task_id, attempt);
                    return Ok(TaskResult {
                        task_id: task_id.clone(),
                        status: TaskStatus::Done,
                        attempts: attempt,
                        failure: None,
                    });
                }
                Ok(Ok(outcome)) => (
                    AttemptOutcome::VerificationFailed,
                    AttemptFailure {
                        kind: FailureKind::VerificationFailed,
                        message: outcome.summary,
                    },
                ),
                Ok(Err(e)) => (
                    AttemptOutcome::VerificationFailed,
                    AttemptFailure {
                        kind: FailureKind::VerificationFailed,
                        message: format!("verifier error: {}", e),
                    },
                ),
                Err(_) => (
                    AttemptOutcome::TimedOut {
                        phase: "verify".to_string(),
                    },
                    AttemptFailure {
                        kind: FailureKind::Timeout,
                        message: format!("verify timed out after {:?}", limit),
                    },
                ),
            };
            rlog_debug!(
                "Task {} attempt {}/{} failed verification: {}",
                task_id,
                attempt,
                max_attempts,
                failure.message
            );
            record_attempt(graph, task_id, attempt, started_at, outcome, &failure.message)?;
            last_failure = Some(failure);
        }

        let failure = last_failure.unwrap_or(AttemptFailure {
            kind: FailureKind::ExecutionFailed,
            message: "no attempts made".to_string(),
        });
        graph.apply(
            task_id,
            TaskStatus::Failed,
            Some(EvidenceEntry::note(format!(
                "failed after {} attempt(s)",
                max_attempts
            ))),
        )?;
        Ok(TaskResult {
            task_id: task_id.clone(),
            status: TaskStatus::Failed,
            attempts: max_attempts,
            failure: Some(FailureReport::for_task(
                task_id,
                failure.kind,
                format!("after {} attempt(s): {}", max_attempts, failure.message),
            )),
        })
    }

    fn cancelled(
        &self,
        graph: &SharedGraph,
        task_id: &TaskId,
        attempt: u32,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<TaskResult> {
        record_attempt(
            graph,
            task_id,
            attempt,
            started_at,
            AttemptOutcome::Cancelled,
            "cancelled",
        )?;
        graph.block(task_id, CANCELLED_REASON)?;
        Ok(TaskResult {
            task_id: task_id.clone(),
            status: TaskStatus::Blocked,
            attempts: attempt,
            failure: Some(FailureReport::for_task(
                task_id,
                FailureKind::Cancelled,
                "run cancelled mid-attempt",
            )),
        })
    }
}

fn record_attempt(
    graph: &SharedGraph,
    task_id: &TaskId,
    attempt: u32,
    started_at: chrono::DateTime<Utc>,
    outcome: AttemptOutcome,
    summary: &str,
) -> Result<()> {
    graph.record(
        task_id,
        EvidenceEntry::Attempt(AttemptRecord {
            attempt,
            started_at,
            finished_at: Utc::now(),
            outcome,
            summary: summary.to_string(),
        }),
    )
}
