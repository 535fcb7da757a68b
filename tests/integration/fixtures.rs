//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scratch-directory harness with scripted executor and verifier
//! - Temporary git repositories driven through the git CLI
//! - Small graph builders

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use relay::config::{BackendKind, Config, EscalationPolicy};
use relay::context::{ContextManager, ScratchBackend, WorkspaceBackend};
use relay::core::{TaskDescriptor, TaskGraph, TaskId};
use relay::orchestration::{
    serve, EscalationChannel, ExecutionOutput, ExecutionRequest, Executor, GroupScheduler,
    Responder, SchedulerEvent, TaskRunner, VerificationOutcome, VerificationRequest, Verifier,
};
use relay::state::CheckpointStore;
use relay::{Error, Result};

/// A file change a scripted task makes in its workspace.
#[derive(Debug, Clone)]
pub enum Edit {
    /// Replace the whole file.
    Write(String, String),
    /// Append one line, creating the file if needed.
    Append(String, String),
    Delete(String),
}

impl Edit {
    fn apply(&self, workspace: &Path) -> Result<()> {
        match self {
            Edit::Write(path, content) => {
                let full = workspace.join(path);
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(full, content)?;
            }
            Edit::Append(path, line) => {
                let full = workspace.join(path);
                let mut content = std::fs::read_to_string(&full).unwrap_or_default();
                content.push_str(line);
                content.push('\n');
                std::fs::write(full, content)?;
            }
            Edit::Delete(path) => std::fs::remove_file(workspace.join(path))?,
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct Script {
    edits: Vec<Edit>,
    /// The first `failures` attempts error out before touching files.
    failures: u32,
    delay: Option<Duration>,
}

#[derive(Default)]
struct ExecutorState {
    scripts: Mutex<HashMap<TaskId, Script>>,
    started: Mutex<Vec<(TaskId, u32)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Executor whose behaviour per task is set up front by the test.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    state: Arc<ExecutorState>,
    delay: Duration,
}

impl ScriptedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            state: Arc::default(),
            delay,
        }
    }

    fn script(&self, id: &str, f: impl FnOnce(&mut Script)) {
        let mut scripts = self.state.scripts.lock().unwrap();
        f(scripts.entry(TaskId::from(id)).or_default());
    }

    pub fn edit(&self, id: &str, edit: Edit) {
        self.script(id, |s| s.edits.push(edit));
    }

    pub fn fail_first(&self, id: &str, attempts: u32) {
        self.script(id, |s| s.failures = attempts);
    }

    pub fn hang(&self, id: &str, delay: Duration) {
        self.script(id, |s| s.delay = Some(delay));
    }

    /// (task, attempt) in start order.
    pub fn started(&self) -> Vec<(TaskId, u32)> {
        self.state.started.lock().unwrap().clone()
    }

    pub fn attempts_of(&self, id: &str) -> Vec<u32> {
        let id = TaskId::from(id);
        self.started()
            .into_iter()
            .filter(|(task, _)| task == &id)
            .map(|(_, attempt)| attempt)
            .collect()
    }

    /// Highest number of executions observed at the same time.
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'static, Result<ExecutionOutput>> {
        let state = Arc::clone(&self.state);
        let default_delay = self.delay;
        Box::pin(async move {
            let id = request.task.id.clone();
            let script = state
                .scripts
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .unwrap_or_default();
            state
                .started
                .lock()
                .unwrap()
                .push((id.clone(), request.attempt));

            let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
            state.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(script.delay.unwrap_or(default_delay)).await;
            state.active.fetch_sub(1, Ordering::SeqCst);

            if request.attempt <= script.failures {
                return Err(Error::Validation(format!(
                    "scripted failure of {} on attempt {}",
                    id, request.attempt
                )));
            }
            for edit in &script.edits {
                edit.apply(&request.workspace)?;
            }
            Ok(ExecutionOutput {
                summary: format!("{} edit(s)", script.edits.len()),
            })
        })
    }
}

/// Passes everything except the scripted number of rejections per task.
#[derive(Clone, Default)]
pub struct ScriptedVerifier {
    rejections: Arc<Mutex<HashMap<TaskId, u32>>>,
}

impl ScriptedVerifier {
    pub fn reject(&self, id: &str, times: u32) {
        self.rejections
            .lock()
            .unwrap()
            .insert(TaskId::from(id), times);
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(
        &self,
        request: VerificationRequest,
    ) -> BoxFuture<'static, Result<VerificationOutcome>> {
        let rejections = Arc::clone(&self.rejections);
        Box::pin(async move {
            let mut rejections = rejections.lock().unwrap();
            match rejections.get_mut(&request.task.id) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Ok(VerificationOutcome::fail(format!(
                        "attempt {}: checks failed",
                        request.attempt
                    )))
                }
                _ => Ok(VerificationOutcome::pass("checks passed")),
            }
        })
    }
}

/// A wired-up scheduler plus the pieces tests inspect.
pub struct Rig {
    pub scheduler: GroupScheduler,
    pub contexts: Arc<ContextManager>,
    pub events: mpsc::UnboundedReceiver<SchedulerEvent>,
}

impl Rig {
    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Task lists of every GroupStarted event, in order.
    pub fn groups(&mut self) -> Vec<Vec<TaskId>> {
        self.drain_events()
            .into_iter()
            .filter_map(|event| match event {
                SchedulerEvent::GroupStarted { tasks, .. } => Some(tasks),
                _ => None,
            })
            .collect()
    }
}

/// Scratch-backed environment: a main directory, a checkpoint directory and
/// a contexts directory inside one temp dir.
pub struct Harness {
    _dir: TempDir,
    pub root: PathBuf,
    pub main: PathBuf,
    pub config: Config,
    pub executor: ScriptedExecutor,
    pub verifier: ScriptedVerifier,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let root = dir.path().to_path_buf();
        let main = root.join("main");
        std::fs::create_dir_all(&main).expect("Failed to create main dir");

        let mut config = Config::default();
        config.runner.max_retries = 2;
        config.runner.task_timeout_secs = 30;
        config.checkpoint.dir = Some(root.join("checkpoints").display().to_string());
        config.checkpoint.interval_secs = 0;
        config.checkpoint.keep = 50;
        config.workspace.backend = BackendKind::Scratch;
        config.workspace.worktree_dir = Some(root.join("contexts").display().to_string());
        config.commands.escalation = EscalationPolicy::Defer;

        Self {
            _dir: dir,
            root,
            main,
            config,
            executor: ScriptedExecutor::new(Duration::from_millis(10)),
            verifier: ScriptedVerifier::default(),
        }
    }

    pub fn write_main(&self, path: &str, content: &str) {
        let full = self.main.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).expect("Failed to write main file");
    }

    pub fn read_main(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(self.main.join(path)).ok()
    }

    pub fn contexts_dir(&self) -> PathBuf {
        self.root.join("contexts")
    }

    pub fn store(&self) -> CheckpointStore {
        CheckpointStore::new(
            self.root.join("checkpoints"),
            self.config.checkpoint.keep,
        )
    }

    /// Number of checkpoint files on disk.
    pub fn checkpoint_files(&self) -> usize {
        std::fs::read_dir(self.root.join("checkpoints"))
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        let name = e.file_name().to_string_lossy().into_owned();
                        name.starts_with("checkpoint-") && name.ends_with(".json")
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Scheduler over the scratch backend. Must be called inside a runtime.
    pub fn rig<R: Responder + 'static>(&self, responder: R) -> Rig {
        let backend = Arc::new(ScratchBackend::new(&self.main));
        self.rig_on(backend, &self.contexts_dir(), responder)
    }

    pub fn rig_on<R: Responder + 'static>(
        &self,
        backend: Arc<dyn WorkspaceBackend>,
        contexts_dir: &Path,
        responder: R,
    ) -> Rig {
        let contexts = Arc::new(ContextManager::new(
            backend,
            contexts_dir,
            &self.config.workspace.branch_prefix,
            self.config.workspace.disposal,
            self.config.scheduler.context_retries,
        ));
        let runner = Arc::new(TaskRunner::new(
            Arc::new(self.executor.clone()),
            Arc::new(self.verifier.clone()),
            &self.config.runner,
        ));
        let (channel, requests) = EscalationChannel::new(8);
        tokio::spawn(serve(requests, responder));

        let (events_tx, events) = mpsc::unbounded_channel();
        let scheduler = GroupScheduler::new(
            self.config.clone(),
            Arc::clone(&contexts),
            runner,
            channel,
        )
        .expect("Failed to build scheduler")
        .with_checkpoints(self.store())
        .with_events(events_tx);

        Rig {
            scheduler,
            contexts,
            events,
        }
    }
}

pub fn graph(descriptors: Vec<TaskDescriptor>) -> TaskGraph {
    TaskGraph::build(descriptors).expect("valid task graph")
}

pub fn task(id: &str, complexity: u8) -> TaskDescriptor {
    TaskDescriptor::new(id, &format!("task {}", id)).with_complexity(complexity)
}

pub fn ids(names: &[&str]) -> Vec<TaskId> {
    names.iter().map(|n| TaskId::from(*n)).collect()
}

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        let repo = Self { temp_dir, path };

        repo.git(&["init"]);
        repo.git(&["config", "user.email", "test@test.com"]);
        repo.git(&["config", "user.name", "Test User"]);
        repo.commit_file("README.md", "# Test Repository\n", "Initial commit");
        repo
    }

    /// Run git in the repository and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    pub fn commit_file(&self, path: &str, content: &str, message: &str) {
        std::fs::write(self.path.join(path), content).expect("Failed to write file");
        self.git(&["add", path]);
        self.git(&["commit", "-m", message]);
    }

    /// Contents of `path` at `rev`, or `None` if it does not exist there.
    pub fn show(&self, rev: &str, path: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["show", &format!("{}:{}", rev, path)])
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git show");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub fn branches(&self, pattern: &str) -> Vec<String> {
        self.git(&["branch", "--list", pattern, "--format=%(refname:short)"])
            .lines()
            .map(|l| l.to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }
}
