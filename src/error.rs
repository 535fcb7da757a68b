use std::time::Duration;

use thiserror::Error;

use crate::core::{TaskId, TaskStatus};

/// Reasons a task graph is rejected at build time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Dependency cycle: {}", format_cycle(.path))]
    Cycle { path: Vec<TaskId> },

    #[error("Task {task} depends on unknown task {missing}")]
    DanglingDependency { task: TaskId, missing: TaskId },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {task} has complexity {value}, expected 1-5")]
    InvalidComplexity { task: TaskId, value: u8 },

    #[error("Tasks unreachable from any root: {}", format_ids(.0))]
    Unreachable(Vec<TaskId>),
}

fn format_cycle(path: &[TaskId]) -> String {
    let mut parts: Vec<String> = path.iter().map(|id| id.to_string()).collect();
    if let Some(first) = path.first() {
        parts.push(first.to_string());
    }
    parts.join(" -> ")
}

fn format_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Stalled graph: blocked [{}], unmet [{}]", format_ids(.blocked), format_unmet(.unmet))]
    Stalled {
        blocked: Vec<TaskId>,
        unmet: Vec<(TaskId, TaskId)>,
    },

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Retry limit reached for task {task} ({limit})")]
    RetryLimit { task: TaskId, limit: u32 },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Context not found: {0}")]
    ContextNotFound(String),

    #[error("Failed to acquire context for {scope} after {attempts} attempts: {reason}")]
    ContextAcquisition {
        scope: String,
        attempts: u32,
        reason: String,
    },

    #[error("Checkpoint write failed: {0}")]
    CheckpointWrite(String),

    #[error("Escalation channel closed")]
    EscalationClosed,

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

fn format_unmet(unmet: &[(TaskId, TaskId)]) -> String {
    unmet
        .iter()
        .map(|(task, dep)| format!("{} waits on {}", task, dep))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
