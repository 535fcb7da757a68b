//! Execution and verification capabilities.
//!
//! The core never looks inside a task; it hands the task and its workspace
//! to an `Executor` to make changes and to a `Verifier` to judge them. Both
//! are trait objects so the CLI can plug in shell commands and tests can
//! plug in scripted fakes.

use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::core::TaskNode;
use crate::util::condense;
use crate::{rlog_trace, Error, Result};

/// Lines of captured output kept in evidence summaries.
const SUMMARY_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task: TaskNode,
    pub workspace: PathBuf,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Summaries of earlier failed attempts, oldest first.
    pub failure_context: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub task: TaskNode,
    pub workspace: PathBuf,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub passed: bool,
    /// Condensed evidence, e.g. the tail of a test run.
    pub summary: String,
}

impl VerificationOutcome {
    pub fn pass(summary: impl Into<String>) -> Self {
        Self {
            passed: true,
            summary: summary.into(),
        }
    }

    pub fn fail(summary: impl Into<String>) -> Self {
        Self {
            passed: false,
            summary: summary.into(),
        }
    }
}

/// Applies a task's code change inside its workspace.
pub trait Executor: Send + Sync {
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'static, Result<ExecutionOutput>>;
}

/// Judges whether a task's change is complete.
pub trait Verifier: Send + Sync {
    fn verify(&self, request: VerificationRequest)
        -> BoxFuture<'static, Result<VerificationOutcome>>;
}

struct CommandOutput {
    success: bool,
    code: Option<i32>,
    combined: String,
}

async fn run_shell(
    command: &str,
    task: &TaskNode,
    workspace: &Path,
    extra_env: &[(&str, String)],
) -> Result<CommandOutput> {
    let files: Vec<String> = task
        .file_targets
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workspace)
        .env("RELAY_TASK_ID", task.id.as_str())
        .env("RELAY_TASK_DESCRIPTION", &task.description)
        .env("RELAY_TASK_FILES", files.join("\n"))
        .stdin(Stdio::null())
        .kill_on_drop(true);
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    let output = cmd.output().await.map_err(Error::Io)?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    rlog_trace!("[{}] `{}` output:\n{}", task.id, command, combined);
    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        combined,
    })
}

/// Runs a configured shell command in the workspace.
///
/// Failure context from earlier attempts is exported as
/// `RELAY_FAILURE_CONTEXT` so the command can adapt.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    command: String,
}

impl ShellExecutor {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

impl Executor for ShellExecutor {
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'static, Result<ExecutionOutput>> {
        let command = self.command.clone();
        Box::pin(async move {
            let env = [
                ("RELAY_ATTEMPT", request.attempt.to_string()),
                ("RELAY_FAILURE_CONTEXT", request.failure_context.join("\n")),
            ];
            let output = run_shell(&command, &request.task, &request.workspace, &env).await?;
            if !output.success {
                return Err(Error::Validation(format!(
                    "execute command exited with {}: {}",
                    output.code.map_or("signal".to_string(), |c| c.to_string()),
                    condense(&output.combined, SUMMARY_LINES)
                )));
            }
            Ok(ExecutionOutput {
                summary: condense(&output.combined, SUMMARY_LINES),
            })
        })
    }
}

/// Runs the task's verification command, or a default one.
#[derive(Debug, Clone)]
pub struct ShellVerifier {
    default_command: Option<String>,
}

impl ShellVerifier {
    pub fn new(default_command: Option<&str>) -> Self {
        Self {
            default_command: default_command.map(|c| c.to_string()),
        }
    }
}

impl Verifier for ShellVerifier {
    fn verify(
        &self,
        request: VerificationRequest,
    ) -> BoxFuture<'static, Result<VerificationOutcome>> {
        let default = self.default_command.clone();
        Box::pin(async move {
            let directive = &request.task.verification;
            let Some(command) = directive.command.clone().or(default) else {
                return Ok(VerificationOutcome::pass("no verification command"));
            };
            let env = [("RELAY_ATTEMPT", request.attempt.to_string())];
            let output = run_shell(&command, &request.task, &request.workspace, &env).await?;
            let summary = condense(&output.combined, SUMMARY_LINES);
            if output.code == Some(directive.expect_exit_code) {
                Ok(VerificationOutcome::pass(summary))
            } else {
                Ok(VerificationOutcome::fail(format!(
                    "exit {} (expected {}): {}",
                    output.code.map_or("signal".to_string(), |c| c.to_string()),
                    directive.expect_exit_code,
                    summary
                )))
            }
        })
    }
}
