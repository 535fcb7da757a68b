use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use relay::config::{BackendKind, Config, EscalationPolicy};
use relay::context::{ContextManager, GitWorktreeBackend, ScratchBackend, WorkspaceBackend};
use relay::core::{TargetCountScorer, TaskDescriptor, TaskGraph, TaskId};
use relay::orchestration::{
    serve, EscalationChannel, FixedResponder, GroupScheduler, PromptResponder, Reply,
    ResolutionChoice, RunReport, SchedulerEvent, ShellExecutor, ShellVerifier, TaskRunner,
};
use relay::state::{Checkpoint, CheckpointStore};
use relay::{rlog, Error, Result};

/// Relay - run a task graph across isolated workspaces
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    RELAY_DEBUG=1   Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.relay/relay.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Repository to work in (a plain directory with the scratch backend)
    #[arg(long, global = true, default_value = ".")]
    pub repo: PathBuf,

    /// Config file to use instead of ~/.relay/relay.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Build the task graph from a JSON file of task descriptors and run it
    Run {
        /// Path to the task list
        tasks: PathBuf,

        /// Upper bound on tasks per group
        #[arg(long)]
        max_parallelism: Option<usize>,

        /// Retries per task after the first attempt
        #[arg(long)]
        max_retries: Option<u32>,

        /// Workspace backend: worktree or scratch
        #[arg(long)]
        backend: Option<String>,
    },

    /// Continue from the current checkpoint
    Resume,

    /// Show task status recorded in the current checkpoint
    Status,

    /// Re-open a Failed task in the current checkpoint
    Retry {
        /// Task id
        task: String,
    },
}

enum Start {
    Fresh(TaskGraph),
    Resume(Box<Checkpoint>),
}

fn main() {
    let cli = Cli::parse();
    relay::log::init_with_debug(cli.debug);

    match run_cli(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("relay: {}", e);
            std::process::exit(2);
        }
    }
}

fn run_cli(cli: Cli) -> Result<i32> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Command::Run {
        max_parallelism,
        max_retries,
        backend,
        ..
    } = &cli.command
    {
        apply_overrides(&mut config, *max_parallelism, *max_retries, backend.as_deref())?;
    }
    let store = CheckpointStore::new(config.checkpoint_dir()?, config.checkpoint.keep);

    match cli.command.clone() {
        Command::Run { tasks, .. } => {
            let descriptors = load_descriptors(&tasks)?;
            let history = store
                .restore_sync()?
                .map(|checkpoint| checkpoint.history)
                .unwrap_or_default();
            let graph =
                match TaskGraph::build_with_scorer(descriptors, &TargetCountScorer, &history) {
                    Ok(graph) => graph,
                    Err(e) => return print_report(&RunReport::rejected(&e), cli.json),
                };
            let report = block_on(execute(config, cli.repo, store, Start::Fresh(graph)))?;
            print_report(&report, cli.json)
        }
        Command::Resume => {
            let Some(checkpoint) = store.restore_sync()? else {
                eprintln!("relay: no checkpoint in {}", store.dir().display());
                return Ok(1);
            };
            let start = Start::Resume(Box::new(checkpoint));
            let report = block_on(execute(config, cli.repo, store, start))?;
            print_report(&report, cli.json)
        }
        Command::Status => run_status(&store, cli.json),
        Command::Retry { task } => run_retry(&store, &config, &TaskId::from(task.as_str())),
    }
}

fn apply_overrides(
    config: &mut Config,
    max_parallelism: Option<usize>,
    max_retries: Option<u32>,
    backend: Option<&str>,
) -> Result<()> {
    if let Some(n) = max_parallelism {
        config.scheduler.max_parallelism = n;
    }
    if let Some(n) = max_retries {
        config.runner.max_retries = n;
    }
    if let Some(name) = backend {
        config.workspace.backend = match name {
            "worktree" => BackendKind::Worktree,
            "scratch" => BackendKind::Scratch,
            other => {
                return Err(Error::Validation(format!(
                    "unknown backend '{}' (expected worktree or scratch)",
                    other
                )))
            }
        };
    }
    config.validate()
}

fn load_descriptors(path: &Path) -> Result<Vec<TaskDescriptor>> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn block_on<F: std::future::Future<Output = Result<RunReport>>>(future: F) -> Result<RunReport> {
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(future);
    // A terminal prompt may still be waiting on stdin.
    rt.shutdown_background();
    result
}

fn build_backend(config: &Config, repo: &Path) -> Result<(Arc<dyn WorkspaceBackend>, PathBuf)> {
    let worktrees = config.worktrees_dir()?;
    match config.workspace.backend {
        BackendKind::Worktree => {
            let backend = GitWorktreeBackend::new(
                repo,
                &worktrees,
                &config.workspace.integration_branch,
            )?;
            Ok((Arc::new(backend), worktrees.join("contexts")))
        }
        BackendKind::Scratch => Ok((
            Arc::new(ScratchBackend::new(repo)),
            worktrees.join("scratch"),
        )),
    }
}

async fn execute(
    config: Config,
    repo: PathBuf,
    store: CheckpointStore,
    start: Start,
) -> Result<RunReport> {
    let execute_command = config.commands.execute.clone().ok_or_else(|| {
        Error::Validation("commands.execute must be set to run tasks".to_string())
    })?;
    let (backend, contexts_dir) = build_backend(&config, &repo)?;
    let contexts = Arc::new(ContextManager::new(
        backend,
        &contexts_dir,
        &config.workspace.branch_prefix,
        config.workspace.disposal,
        config.scheduler.context_retries,
    ));
    let runner = Arc::new(TaskRunner::new(
        Arc::new(ShellExecutor::new(&execute_command)),
        Arc::new(ShellVerifier::new(config.commands.verify.as_deref())),
        &config.runner,
    ));

    let (channel, requests) = EscalationChannel::new(8);
    match config.commands.escalation {
        EscalationPolicy::Prompt => tokio::spawn(serve(requests, PromptResponder)),
        EscalationPolicy::Baseline => tokio::spawn(serve(
            requests,
            FixedResponder(Reply::Choose(ResolutionChoice::KeepBaseline)),
        )),
        EscalationPolicy::Defer => tokio::spawn(serve(requests, FixedResponder(Reply::Defer))),
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let scheduler = GroupScheduler::new(config, contexts, runner, channel)?
        .with_checkpoints(store)
        .with_events(events_tx);

    let cancel = scheduler.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            rlog!("Interrupt received, cancelling run");
            eprintln!("relay: cancelling, writing final checkpoint...");
            cancel.cancel();
        }
    });
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_event(&event);
        }
    });

    Ok(match start {
        Start::Fresh(graph) => scheduler.run(graph).await,
        Start::Resume(checkpoint) => scheduler.resume(*checkpoint).await,
    })
}

fn print_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::GroupStarted { round, tasks } => {
            let ids: Vec<&str> = tasks.iter().map(|id| id.as_str()).collect();
            eprintln!("round {}: {}", round, ids.join(", "));
        }
        SchedulerEvent::TaskStarted { task_id, branch } => {
            eprintln!("  {} started on {}", task_id, branch)
        }
        SchedulerEvent::TaskFinished {
            task_id,
            status,
            attempts,
        } => eprintln!("  {} {} after {} attempt(s)", task_id, status, attempts),
        SchedulerEvent::MergeFinished {
            paths, conflicts, ..
        } => eprintln!("  merged {} path(s), {} conflict(s)", paths, conflicts),
        SchedulerEvent::ConflictEscalated { path, tasks, .. } => {
            let ids: Vec<&str> = tasks.iter().map(|id| id.as_str()).collect();
            eprintln!(
                "  conflict on {} needs a decision ({})",
                path.display(),
                ids.join(", ")
            )
        }
        SchedulerEvent::ConflictSettled { choice, .. } => match choice {
            Some(choice) => eprintln!("  conflict resolved: {}", choice),
            None => eprintln!("  conflict deferred"),
        },
        SchedulerEvent::CheckpointWritten { seq, reason } => {
            rlog!("checkpoint {} ({:?})", seq, reason)
        }
        SchedulerEvent::HandedOff { round } => {
            eprintln!("session budget reached at round {}; run `relay resume`", round)
        }
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<i32> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report.render());
    }
    Ok(report.exit_code())
}

fn run_status(store: &CheckpointStore, json: bool) -> Result<i32> {
    let Some(checkpoint) = store.restore_sync()? else {
        println!("No checkpoint in {}", store.dir().display());
        return Ok(0);
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        return Ok(0);
    }
    println!(
        "Checkpoint {} ({:?}) taken {}",
        checkpoint.seq,
        checkpoint.reason,
        checkpoint.taken_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    for node in &checkpoint.tasks {
        print!(
            "  {:<24} {:<10} attempts={} retries={}",
            node.id.as_str(),
            node.status.to_string(),
            node.evidence.attempt_count(),
            node.retry_count
        );
        if let Some(reason) = &node.blocked_reason {
            print!("  ({})", reason);
        }
        println!();
    }
    if !checkpoint.pending_escalations.is_empty() {
        println!(
            "{} conflict(s) waiting for a decision",
            checkpoint.pending_escalations.len()
        );
    }
    let next: Vec<&str> = checkpoint
        .resume
        .next_group
        .iter()
        .map(|id| id.as_str())
        .collect();
    println!("Next round {}: [{}]", checkpoint.resume.round, next.join(", "));
    Ok(0)
}

fn run_retry(store: &CheckpointStore, config: &Config, task: &TaskId) -> Result<i32> {
    let Some(mut checkpoint) = store.restore_sync()? else {
        eprintln!("relay: no checkpoint to retry from");
        return Ok(1);
    };
    let mut graph = checkpoint.graph()?;
    let reopened = graph.retry(task, config.runner.explicit_retries)?;
    checkpoint.tasks = graph.to_nodes();
    let written = store.write_sync(checkpoint)?;
    println!("{} re-opened (checkpoint {})", task, written.seq);
    for id in reopened {
        println!("  unblocked {}", id);
    }
    Ok(0)
}
