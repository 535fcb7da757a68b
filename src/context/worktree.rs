//! Git worktree backend: one branch plus worktree per context, cut from an
//! integration branch that is itself checked out in a dedicated worktree.

use std::path::{Path, PathBuf};

use super::{read_paths, write_changes, ChangeSet, ExecutionContext, Snapshot, WorkspaceBackend};
use crate::git::GitOps;
use crate::{rlog, rlog_debug, Error, Result};

pub struct GitWorktreeBackend {
    git: GitOps,
    integration_branch: String,
    integration_root: PathBuf,
}

impl GitWorktreeBackend {
    pub fn new(repo_path: &Path, worktrees_dir: &Path, integration_branch: &str) -> Result<Self> {
        Ok(Self {
            git: GitOps::new(repo_path)?,
            integration_branch: integration_branch.to_string(),
            integration_root: worktrees_dir.join("integration"),
        })
    }
}

impl WorkspaceBackend for GitWorktreeBackend {
    fn name(&self) -> &'static str {
        "worktree"
    }

    fn prepare(&self) -> Result<()> {
        self.git.ensure_branch(&self.integration_branch)?;
        if !self.integration_root.exists() {
            if let Some(parent) = self.integration_root.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.git
                .create_worktree_from_branch(&self.integration_branch, &self.integration_root)?;
            rlog!(
                "Integration branch {} checked out at {}",
                self.integration_branch,
                self.integration_root.display()
            );
        }
        Ok(())
    }

    fn create(&self, context: &mut ExecutionContext) -> Result<()> {
        if let Some(parent) = context.root.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let base = self
            .git
            .create_worktree(&context.branch, &self.integration_branch, &context.root)?;
        context.base = Some(base);
        Ok(())
    }

    fn seal(&self, context: &ExecutionContext, message: &str) -> Result<()> {
        GitOps::commit_all(&context.root, message)?;
        Ok(())
    }

    fn discard(&self, context: &ExecutionContext) -> Result<()> {
        GitOps::reset_hard(&context.root)
    }

    fn changes(&self, context: &ExecutionContext) -> Result<ChangeSet> {
        let base = context.base.as_deref().ok_or_else(|| {
            Error::Validation(format!("context {} has no base commit", context.id))
        })?;
        GitOps::changed_files(&context.root, base)
    }

    fn read_main(&self, paths: &[PathBuf]) -> Result<Snapshot> {
        read_paths(&self.integration_root, paths)
    }

    fn commit_main(&self, changes: &ChangeSet, message: &str) -> Result<()> {
        write_changes(&self.integration_root, changes)?;
        if let Some(commit) = GitOps::commit_all(&self.integration_root, message)? {
            rlog_debug!("Integration advanced to {}", commit);
        }
        Ok(())
    }

    fn dispose(&self, context: &ExecutionContext, keep: bool) -> Result<()> {
        if keep {
            rlog_debug!(
                "Keeping worktree {} on {}",
                context.root.display(),
                context.branch
            );
            return Ok(());
        }
        self.git.remove_worktree(&context.root)?;
        self.git.delete_branch(&context.branch)
    }
}
