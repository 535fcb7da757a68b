//! Task node data model.
//!
//! A `TaskNode` is one schedulable unit of work emitted by the external
//! decomposition step. The scheduler and runner only ever touch its status,
//! evidence and retry bookkeeping; description, targets and the verification
//! directive are opaque payload handed to the capabilities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier of a task, unique within one graph.
///
/// Ids come from the decomposition input, so they are plain strings rather
/// than generated UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, dependencies not yet known to be satisfied.
    #[default]
    Pending,
    /// Every dependency is Done; selected for the current group.
    Ready,
    /// An attempt is executing in an execution context.
    Running,
    /// The verification capability is judging the attempt.
    Verifying,
    /// Verified and finished.
    Done,
    /// Out of attempts.
    Failed,
    /// Cannot run: an upstream task failed, the run was cancelled, or the
    /// graph stalled.
    Blocked,
}

impl TaskStatus {
    /// Forward transitions accepted by `apply`.
    ///
    /// Failed -> Pending and Blocked -> Pending are deliberately absent: they
    /// only happen through the explicit retry path.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Ready)
                | (Pending, Blocked)
                | (Ready, Running)
                | (Ready, Blocked)
                | (Ready, Failed)
                | (Running, Verifying)
                | (Running, Failed)
                | (Running, Blocked)
                | (Verifying, Done)
                | (Verifying, Failed)
                | (Verifying, Running)
                | (Verifying, Blocked)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// Opaque verification instruction owned by the verification capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationDirective {
    /// Command the verifier runs; `None` means the verifier's default.
    #[serde(default)]
    pub command: Option<String>,
    /// Exit code that counts as success.
    #[serde(default)]
    pub expect_exit_code: i32,
}

impl Default for VerificationDirective {
    fn default() -> Self {
        Self {
            command: None,
            expect_exit_code: 0,
        }
    }
}

/// One task as emitted by the decomposition step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file_targets: Vec<PathBuf>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// 1-5; when absent a `ComplexityScorer` supplies it.
    #[serde(default)]
    pub complexity: Option<u8>,
    #[serde(default)]
    pub verification: VerificationDirective,
    /// Per-phase limit overriding `runner.task_timeout_secs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TaskDescriptor {
    pub fn new(id: &str, description: &str) -> Self {
        Self {
            id: TaskId::from(id),
            description: description.to_string(),
            file_targets: Vec::new(),
            dependencies: Vec::new(),
            complexity: None,
            verification: VerificationDirective::default(),
            timeout_secs: None,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| TaskId::from(*d)).collect();
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = Some(complexity);
        self
    }

    pub fn with_targets(mut self, targets: &[&str]) -> Self {
        self.file_targets = targets.iter().map(PathBuf::from).collect();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AttemptOutcome {
    Passed,
    ExecutionFailed { error: String },
    VerificationFailed,
    TimedOut { phase: String },
    Cancelled,
}

impl AttemptOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, AttemptOutcome::Passed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Condensed capability output.
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EvidenceEntry {
    Attempt(AttemptRecord),
    Note {
        at: DateTime<Utc>,
        message: String,
    },
}

impl EvidenceEntry {
    pub fn note(message: impl Into<String>) -> Self {
        Self::Note {
            at: Utc::now(),
            message: message.into(),
        }
    }
}

/// Append-only evidence trail of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    entries: Vec<EvidenceEntry>,
}

impl Evidence {
    pub fn push(&mut self, entry: EvidenceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    pub fn attempts(&self) -> impl Iterator<Item = &AttemptRecord> {
        self.entries.iter().filter_map(|e| match e {
            EvidenceEntry::Attempt(record) => Some(record),
            EvidenceEntry::Note { .. } => None,
        })
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts().count() as u32
    }

    /// Summaries of every failed attempt, oldest first. Handed to the
    /// executor on retries.
    pub fn failure_context(&self) -> Vec<String> {
        self.attempts()
            .filter(|a| !a.outcome.is_pass())
            .map(|a| format!("attempt {}: {}", a.attempt, a.summary))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A node of the task graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    pub description: String,
    pub file_targets: Vec<PathBuf>,
    pub complexity: u8,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,
    pub verification: VerificationDirective,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub evidence: Evidence,
    /// Explicit Failed -> Pending retries consumed.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    pub fn from_descriptor(descriptor: TaskDescriptor, complexity: u8) -> Self {
        Self {
            id: descriptor.id,
            description: descriptor.description,
            file_targets: descriptor.file_targets,
            complexity,
            status: TaskStatus::Pending,
            dependencies: descriptor.dependencies,
            verification: descriptor.verification,
            timeout_secs: descriptor.timeout_secs,
            evidence: Evidence::default(),
            retry_count: 0,
            blocked_reason: None,
            updated_at: None,
        }
    }

    pub(crate) fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        if status != TaskStatus::Blocked {
            self.blocked_reason = None;
        }
        self.updated_at = Some(Utc::now());
    }
}
