//! Structured run summary.
//!
//! Every way a run can end produces a `RunReport`; nothing escapes to the
//! caller as a bare error. Each failure names its task (when there is one),
//! what went wrong and what it takes to move forward.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::{TaskGraph, TaskId, TaskStatus};
use crate::error::{Error, GraphError};
use crate::orchestration::resolver::ConflictRecord;
use crate::state::ResumePointer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidGraph,
    Stalled,
    ExecutionFailed,
    VerificationFailed,
    Timeout,
    ContextAcquisition,
    UpstreamFailed,
    ConflictEscalation,
    Integration,
    CheckpointWrite,
    Cancelled,
}

/// What it takes to make progress past a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// `relay retry <task>` can run it again.
    Retryable,
    /// `relay resume` picks it up from the checkpoint.
    Resumable,
    /// Someone has to decide something first.
    NeedsDecision,
}

impl FailureKind {
    pub fn disposition(&self) -> Disposition {
        match self {
            FailureKind::ExecutionFailed
            | FailureKind::VerificationFailed
            | FailureKind::Timeout
            | FailureKind::ContextAcquisition => Disposition::Retryable,
            FailureKind::UpstreamFailed
            | FailureKind::Integration
            | FailureKind::CheckpointWrite
            | FailureKind::Cancelled => Disposition::Resumable,
            FailureKind::InvalidGraph | FailureKind::Stalled | FailureKind::ConflictEscalation => {
                Disposition::NeedsDecision
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub task: Option<TaskId>,
    pub kind: FailureKind,
    pub message: String,
    pub disposition: Disposition,
}

impl FailureReport {
    pub fn new(task: Option<TaskId>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            task,
            kind,
            message: message.into(),
            disposition: kind.disposition(),
        }
    }

    pub fn for_task(task: &TaskId, kind: FailureKind, message: impl Into<String>) -> Self {
        Self::new(Some(task.clone()), kind, message)
    }
}

impl std::fmt::Display for FailureReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.task {
            Some(task) => write!(
                f,
                "[{}] {:?} ({:?}): {}",
                task, self.kind, self.disposition, self.message
            ),
            None => write!(
                f,
                "{:?} ({:?}): {}",
                self.kind, self.disposition, self.message
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every task Done and every conflict settled.
    Completed,
    /// Ended with Failed or Blocked tasks, or decisions outstanding.
    Partial,
    Cancelled,
    /// Session budget reached; continue with `relay resume`.
    HandedOff,
    Stalled,
    /// The task graph was rejected before anything ran.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub tasks: Vec<TaskSummary>,
    pub failures: Vec<FailureReport>,
    pub unresolved_conflicts: Vec<ConflictRecord>,
    pub rounds: u32,
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_pointer: Option<ResumePointer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn new(outcome: RunOutcome, graph: &TaskGraph) -> Self {
        let tasks = graph
            .nodes()
            .into_iter()
            .map(|node| TaskSummary {
                id: node.id.clone(),
                status: node.status,
                attempts: node.evidence.attempt_count(),
                blocked_reason: node.blocked_reason.clone(),
            })
            .collect();
        Self {
            outcome,
            tasks,
            failures: Vec::new(),
            unresolved_conflicts: Vec::new(),
            rounds: 0,
            elapsed: Duration::ZERO,
            resume_pointer: None,
            checkpoint: None,
            warnings: Vec::new(),
        }
    }

    /// Report for a graph that failed validation.
    pub fn rejected(error: &GraphError) -> Self {
        let task = match error {
            GraphError::DanglingDependency { task, .. }
            | GraphError::InvalidComplexity { task, .. } => Some(task.clone()),
            GraphError::DuplicateTask(task) => Some(task.clone()),
            GraphError::Cycle { .. } | GraphError::Unreachable(_) => None,
        };
        Self {
            outcome: RunOutcome::Rejected,
            tasks: Vec::new(),
            failures: vec![FailureReport::new(
                task,
                FailureKind::InvalidGraph,
                error.to_string(),
            )],
            unresolved_conflicts: Vec::new(),
            rounds: 0,
            elapsed: Duration::ZERO,
            resume_pointer: None,
            checkpoint: None,
            warnings: Vec::new(),
        }
    }

    /// Record the failure carried by a run-level error.
    pub fn push_error(&mut self, error: &Error) {
        let report = match error {
            Error::Stalled { blocked, .. } => FailureReport::new(
                blocked.first().cloned(),
                FailureKind::Stalled,
                error.to_string(),
            ),
            Error::ContextAcquisition { .. } => {
                FailureReport::new(None, FailureKind::ContextAcquisition, error.to_string())
            }
            Error::CheckpointWrite(_) => {
                FailureReport::new(None, FailureKind::CheckpointWrite, error.to_string())
            }
            Error::Graph(_) => {
                FailureReport::new(None, FailureKind::InvalidGraph, error.to_string())
            }
            _ => FailureReport::new(None, FailureKind::Integration, error.to_string()),
        };
        self.failures.push(report);
    }

    pub fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.iter().find(|t| &t.id == id).map(|t| t.status)
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Completed => 0,
            RunOutcome::HandedOff => 0,
            RunOutcome::Partial => 1,
            RunOutcome::Cancelled => 130,
            RunOutcome::Stalled | RunOutcome::Rejected => 2,
        }
    }

    /// Human readable multi-line summary.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Run {:?} after {} round(s) in {:.1}s\n",
            self.outcome,
            self.rounds,
            self.elapsed.as_secs_f64()
        );
        for task in &self.tasks {
            out.push_str(&format!(
                "  {:<24} {:<10} attempts={}",
                task.id.as_str(),
                task.status.to_string(),
                task.attempts
            ));
            if let Some(reason) = &task.blocked_reason {
                out.push_str(&format!("  ({})", reason));
            }
            out.push('\n');
        }
        if !self.failures.is_empty() {
            out.push_str("Failures:\n");
            for failure in &self.failures {
                out.push_str(&format!("  {}\n", failure));
            }
        }
        if !self.unresolved_conflicts.is_empty() {
            out.push_str("Unresolved conflicts:\n");
            for record in &self.unresolved_conflicts {
                out.push_str(&format!("  {}\n", record));
            }
        }
        if let Some(pointer) = &self.resume_pointer {
            let next: Vec<&str> = pointer.next_group.iter().map(|id| id.as_str()).collect();
            out.push_str(&format!(
                "Resume at round {} with [{}]\n",
                pointer.round,
                next.join(", ")
            ));
        }
        for warning in &self.warnings {
            out.push_str(&format!("WARNING: {}\n", warning));
        }
        out
    }
}
