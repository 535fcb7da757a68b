//! Execution contexts: isolated workspaces a task or group runs in.
//!
//! The `ContextManager` owns allocation, branch ownership and disposal.
//! Storage is delegated to a `WorkspaceBackend`: git worktrees for real
//! projects, plain directory copies for everything else.

pub mod scratch;
pub mod worktree;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::core::TaskId;
use crate::util::blocking;
use crate::{rlog_debug, rlog_warn, Error, Result};

pub use scratch::ScratchBackend;
pub use worktree::GitWorktreeBackend;

/// New content per changed path; `None` means the file was deleted.
pub type ChangeSet = BTreeMap<PathBuf, Option<String>>;

/// Main-line content for a set of paths; `None` means absent.
pub type Snapshot = BTreeMap<PathBuf, Option<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a context was acquired for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextScope {
    Task(TaskId),
    /// A small group sharing one context, run sequentially.
    Group(Vec<TaskId>),
}

impl ContextScope {
    pub fn tasks(&self) -> Vec<TaskId> {
        match self {
            ContextScope::Task(id) => vec![id.clone()],
            ContextScope::Group(ids) => ids.clone(),
        }
    }

    /// Short label used in branch names.
    fn label(&self) -> String {
        let raw = match self {
            ContextScope::Task(id) => id.to_string(),
            ContextScope::Group(ids) => format!(
                "group-{}",
                ids.first().map(|id| id.to_string()).unwrap_or_default()
            ),
        };
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

impl std::fmt::Display for ContextScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextScope::Task(id) => write!(f, "task {}", id),
            ContextScope::Group(ids) => {
                let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                write!(f, "group [{}]", ids.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisposalPolicy {
    /// Remove the workspace once its work is merged; keep failures around.
    #[default]
    DeleteOnSuccess,
    /// Never remove workspaces.
    KeepForAudit,
}

/// Why a context is being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Work integrated into the main line.
    Merged,
    /// A terminal failure was recorded for its task(s).
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl DisposalPolicy {
    /// Whether a workspace released for `reason` should be kept on disk.
    pub fn keeps(&self, reason: Release) -> bool {
        match self {
            DisposalPolicy::KeepForAudit => true,
            DisposalPolicy::DeleteOnSuccess => reason == Release::Failed,
        }
    }
}

/// An isolated workspace bound to exactly one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub id: ContextId,
    pub branch: String,
    pub root: PathBuf,
    pub scope: ContextScope,
    pub created_at: DateTime<Utc>,
    pub disposal: DisposalPolicy,
    /// Backend-specific marker of the main-line state the context was cut
    /// from (a commit id for git worktrees).
    pub base: Option<String>,
}

/// Storage for execution contexts and the main integration line.
///
/// All methods block; the manager calls them through `util::blocking`.
pub trait WorkspaceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Make sure the main line exists. Idempotent.
    fn prepare(&self) -> Result<()>;

    /// Materialise the workspace at `context.root` on `context.branch`,
    /// recording `context.base`.
    fn create(&self, context: &mut ExecutionContext) -> Result<()>;

    /// Accept everything currently in the workspace as the context's work.
    fn seal(&self, context: &ExecutionContext, message: &str) -> Result<()>;

    /// Roll the workspace back to its last sealed state.
    fn discard(&self, context: &ExecutionContext) -> Result<()>;

    /// Sealed changes relative to `context.base`.
    fn changes(&self, context: &ExecutionContext) -> Result<ChangeSet>;

    fn read_main(&self, paths: &[PathBuf]) -> Result<Snapshot>;

    /// Apply a merged change set to the main line.
    fn commit_main(&self, changes: &ChangeSet, message: &str) -> Result<()>;

    /// Remove the workspace and its branch unless `keep`. Must tolerate
    /// partially created contexts.
    fn dispose(&self, context: &ExecutionContext, keep: bool) -> Result<()>;
}

/// Allocates and tears down execution contexts.
pub struct ContextManager {
    backend: Arc<dyn WorkspaceBackend>,
    contexts_dir: PathBuf,
    branch_prefix: String,
    disposal: DisposalPolicy,
    retries: u32,
    /// branch -> owning context
    owners: Mutex<HashMap<String, ContextId>>,
    open: Mutex<HashMap<ContextId, ExecutionContext>>,
}

impl ContextManager {
    pub fn new(
        backend: Arc<dyn WorkspaceBackend>,
        contexts_dir: &Path,
        branch_prefix: &str,
        disposal: DisposalPolicy,
        retries: u32,
    ) -> Self {
        Self {
            backend,
            contexts_dir: contexts_dir.to_path_buf(),
            branch_prefix: branch_prefix.trim_end_matches('/').to_string(),
            disposal,
            retries,
            owners: Mutex::new(HashMap::new()),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn prepare(&self) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        blocking(move || backend.prepare()).await
    }

    /// Acquire a fully usable workspace for `scope`, retrying infrastructure
    /// failures a bounded number of times. A failed attempt leaves nothing
    /// registered or on disk.
    pub async fn acquire(&self, scope: ContextScope) -> Result<ExecutionContext> {
        let attempts = self.retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let id = ContextId::new();
            let context = ExecutionContext {
                id,
                branch: format!("{}/{}-{}", self.branch_prefix, scope.label(), id.short()),
                root: self.contexts_dir.join(id.to_string()),
                scope: scope.clone(),
                created_at: Utc::now(),
                disposal: self.disposal,
                base: None,
            };
            self.claim_branch(&context)?;

            let backend = Arc::clone(&self.backend);
            let mut pending = context.clone();
            let created = blocking(move || {
                backend.create(&mut pending)?;
                Ok(pending)
            })
            .await;

            match created {
                Ok(context) => {
                    rlog_debug!(
                        "Context {} acquired for {} on {} (attempt {})",
                        context.id.short(),
                        scope,
                        context.branch,
                        attempt
                    );
                    self.lock_open().insert(context.id, context.clone());
                    return Ok(context);
                }
                Err(e) => {
                    rlog_warn!(
                        "Context acquisition for {} failed (attempt {}/{}): {}",
                        scope,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e.to_string();
                    let backend = Arc::clone(&self.backend);
                    let partial = context.clone();
                    if let Err(cleanup) = blocking(move || backend.dispose(&partial, false)).await
                    {
                        rlog_warn!("Cleanup of partial context failed: {}", cleanup);
                    }
                    self.release_branch(&context);
                }
            }
        }

        Err(Error::ContextAcquisition {
            scope: scope.to_string(),
            attempts,
            reason: last_error,
        })
    }

    /// Dispose of a context per the disposal policy and forget it.
    pub async fn release(&self, context: &ExecutionContext, reason: Release) -> Result<()> {
        if self.lock_open().remove(&context.id).is_none() {
            return Err(Error::ContextNotFound(context.id.to_string()));
        }
        self.release_branch(context);

        let keep = context.disposal.keeps(reason);
        rlog_debug!(
            "Releasing context {} ({:?}, keep={})",
            context.id.short(),
            reason,
            keep
        );
        let backend = Arc::clone(&self.backend);
        let context = context.clone();
        blocking(move || backend.dispose(&context, keep)).await
    }

    /// Best-effort release of every open context. Returns how many were
    /// released cleanly.
    pub async fn release_all(&self, reason: Release) -> usize {
        let open: Vec<ExecutionContext> = self.lock_open().values().cloned().collect();
        let mut released = 0;
        for context in open {
            match self.release(&context, reason).await {
                Ok(()) => released += 1,
                Err(e) => rlog_warn!("Failed to dispose context {}: {}", context.id.short(), e),
            }
        }
        released
    }

    pub fn open_contexts(&self) -> Vec<ExecutionContext> {
        self.lock_open().values().cloned().collect()
    }

    /// Context currently owning `branch`, if any.
    pub fn owner_of(&self, branch: &str) -> Option<ContextId> {
        self.lock_owners().get(branch).copied()
    }

    pub async fn seal(&self, context: &ExecutionContext, message: &str) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let context = context.clone();
        let message = message.to_string();
        blocking(move || backend.seal(&context, &message)).await
    }

    pub async fn discard(&self, context: &ExecutionContext) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let context = context.clone();
        blocking(move || backend.discard(&context)).await
    }

    pub async fn changes(&self, context: &ExecutionContext) -> Result<ChangeSet> {
        let backend = Arc::clone(&self.backend);
        let context = context.clone();
        blocking(move || backend.changes(&context)).await
    }

    pub async fn read_main(&self, paths: Vec<PathBuf>) -> Result<Snapshot> {
        let backend = Arc::clone(&self.backend);
        blocking(move || backend.read_main(&paths)).await
    }

    pub async fn commit_main(&self, changes: ChangeSet, message: &str) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let backend = Arc::clone(&self.backend);
        let message = message.to_string();
        blocking(move || backend.commit_main(&changes, &message)).await
    }

    fn claim_branch(&self, context: &ExecutionContext) -> Result<()> {
        let mut owners = self.lock_owners();
        if let Some(owner) = owners.get(&context.branch) {
            return Err(Error::Validation(format!(
                "branch {} already owned by context {}",
                context.branch, owner
            )));
        }
        owners.insert(context.branch.clone(), context.id);
        Ok(())
    }

    fn release_branch(&self, context: &ExecutionContext) {
        let mut owners = self.lock_owners();
        if owners.get(&context.branch) == Some(&context.id) {
            owners.remove(&context.branch);
        }
    }

    fn lock_owners(&self) -> std::sync::MutexGuard<'_, HashMap<String, ContextId>> {
        self.owners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_open(&self) -> std::sync::MutexGuard<'_, HashMap<ContextId, ExecutionContext>> {
        self.open
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Read `paths` relative to `root`, `None` for missing files.
pub(crate) fn read_paths(root: &Path, paths: &[PathBuf]) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    for path in paths {
        let full = root.join(path);
        let content = match std::fs::read(&full) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        snapshot.insert(path.clone(), content);
    }
    Ok(snapshot)
}

/// Write a change set into `root`, creating and deleting files as needed.
pub(crate) fn write_changes(root: &Path, changes: &ChangeSet) -> Result<()> {
    for (path, content) in changes {
        let full = root.join(path);
        match content {
            Some(content) => {
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&full, content)?;
            }
            None => {
                if full.exists() {
                    std::fs::remove_file(&full)?;
                }
            }
        }
    }
    Ok(())
}
