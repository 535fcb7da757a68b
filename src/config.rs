use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::DisposalPolicy;
use crate::util::expand_tilde;
use crate::{rlog_debug, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on tasks dispatched in one group.
    pub max_parallelism: usize,
    /// Groups with at most this many tasks share one context and run
    /// one after another.
    pub sequential_threshold: usize,
    /// Extra attempts for a failed context acquisition.
    pub context_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            sequential_threshold: 1,
            context_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Retries after the first attempt; total attempts is one more.
    pub max_retries: u32,
    /// Per-phase limit for execute and verify.
    pub task_timeout_secs: u64,
    /// `relay retry` calls allowed per task once it has Failed.
    pub explicit_retries: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            task_timeout_secs: 900,
            explicit_retries: 3,
        }
    }
}

impl RunnerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckpointConfig {
    pub dir: Option<String>,
    pub interval_secs: u64,
    pub write_retries: u32,
    /// Superseded checkpoint files kept next to the current one.
    pub keep: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: None,
            interval_secs: 300,
            write_retries: 2,
            keep: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    pub session_limit_secs: Option<u64>,
    /// Fraction of the session limit at which the run checkpoints and hands off.
    pub handoff_ratio: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            session_limit_secs: None,
            handoff_ratio: 0.85,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Worktree,
    Scratch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub backend: BackendKind,
    pub worktree_dir: Option<String>,
    pub integration_branch: String,
    pub branch_prefix: String,
    pub disposal: DisposalPolicy,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Worktree,
            worktree_dir: None,
            integration_branch: "relay/integration".to_string(),
            branch_prefix: "relay/task".to_string(),
            disposal: DisposalPolicy::DeleteOnSuccess,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPolicy {
    #[default]
    Prompt,
    Baseline,
    Defer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CommandsConfig {
    pub execute: Option<String>,
    pub verify: Option<String>,
    pub escalation: EscalationPolicy,
}

impl Config {
    pub fn relay_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".relay"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::relay_dir()?.join("relay.toml"))
    }

    pub fn checkpoint_dir(&self) -> Result<PathBuf> {
        match &self.checkpoint.dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::relay_dir()?.join("checkpoints")),
        }
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.workspace.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::relay_dir()?.join("worktrees")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        rlog_debug!(
            "Config loaded: max_parallelism={}, max_retries={}, backend={:?}",
            config.scheduler.max_parallelism,
            config.runner.max_retries,
            config.workspace.backend
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_parallelism == 0 {
            return Err(Error::Validation(
                "scheduler.max_parallelism must be at least 1".to_string(),
            ));
        }
        if !(self.budget.handoff_ratio > 0.0 && self.budget.handoff_ratio <= 1.0) {
            return Err(Error::Validation(format!(
                "budget.handoff_ratio must be in (0, 1], got {}",
                self.budget.handoff_ratio
            )));
        }
        if self.runner.task_timeout_secs == 0 {
            return Err(Error::Validation(
                "runner.task_timeout_secs must be positive".to_string(),
            ));
        }
        if self.workspace.integration_branch.trim().is_empty() {
            return Err(Error::Validation(
                "workspace.integration_branch must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
