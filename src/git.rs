use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use git2::{
    Delta, DiffOptions, ErrorCode, IndexAddOption, Oid, Repository, ResetType, Signature,
    StatusOptions,
};

use crate::{rlog_debug, rlog_warn, Result};

/// Thin wrapper over git2 for the worktree and branch handling execution
/// contexts need. Every call opens the repository fresh, so a `GitOps` can be
/// moved into blocking closures freely.
#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        rlog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let result = repo.find_branch(branch, git2::BranchType::Local);
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create `branch` at HEAD unless it already exists.
    pub fn ensure_branch(&self, branch: &str) -> Result<()> {
        if self.branch_exists(branch)? {
            return Ok(());
        }
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        rlog_debug!("Creating branch {} from commit {}", branch, commit.id());
        repo.branch(branch, &commit, false)?;
        Ok(())
    }

    /// Create `branch` from the tip of `from` and check it out in a new
    /// worktree at `worktree_path`. Returns the base commit.
    pub fn create_worktree(&self, branch: &str, from: &str, worktree_path: &Path) -> Result<String> {
        rlog_debug!(
            "GitOps::create_worktree branch={} from={} path={}",
            branch,
            from,
            worktree_path.display()
        );
        let repo = self.repo()?;
        let base = repo
            .find_branch(from, git2::BranchType::Local)?
            .get()
            .peel_to_commit()?;
        let branch_obj = repo.branch(branch, &base, false)?;
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the worktree is named after its folder.
        let worktree_name = worktree_name(worktree_path, branch);
        repo.worktree(&worktree_name, worktree_path, Some(&opts))?;
        rlog_debug!("Worktree {} created at base {}", worktree_name, base.id());
        Ok(base.id().to_string())
    }

    /// Check out an existing branch in a new worktree.
    pub fn create_worktree_from_branch(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        let repo = self.repo()?;
        let reference = repo
            .find_branch(branch, git2::BranchType::Local)?
            .into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        let name = worktree_name(worktree_path, branch);
        repo.worktree(&name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Remove a worktree and everything git keeps about it. Keeps going when
    /// individual steps fail; the branch must end up free for deletion.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        rlog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());

        let by_path = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
            })
            .map(|s| s.to_string());
        let name = by_path.or_else(|| {
            folder_name.as_ref().and_then(|fname| {
                worktrees
                    .iter()
                    .flatten()
                    .find(|name| *name == fname.as_str())
                    .map(|s| s.to_string())
            })
        });

        if let Some(ref name) = name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    rlog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // A leftover .git/worktrees/<name> keeps the branch checked out.
        let git_dir = repo.path().to_path_buf();
        for candidate in name.iter().chain(folder_name.iter()) {
            let admin_dir = git_dir.join("worktrees").join(candidate);
            if admin_dir.exists() {
                rlog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Delete a local branch. Missing branches are fine; other failures are
    /// logged, not returned.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        rlog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    rlog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                rlog_debug!("Branch '{}' not found (already deleted?)", branch);
            }
            Err(e) => {
                rlog_warn!("Error looking up branch '{}': {}", branch, e);
            }
        }
        Ok(())
    }

    /// Stage everything in the worktree and commit it. Returns `None` when
    /// the tree is unchanged.
    pub fn commit_all(worktree_path: &Path, message: &str) -> Result<Option<String>> {
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        if parent.as_ref().map(|p| p.tree_id()) == Some(tree_id) {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("relay", "relay@localhost"))?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        rlog_debug!(
            "Commit {} in {}: {}",
            commit_id,
            worktree_path.display(),
            message
        );
        Ok(Some(commit_id.to_string()))
    }

    /// Throw away uncommitted work: hard reset to HEAD and delete untracked
    /// files.
    pub fn reset_hard(worktree_path: &Path) -> Result<()> {
        let repo = Repository::open(worktree_path)?;
        let head = repo.head()?.peel_to_commit()?;
        repo.reset(head.as_object(), ResetType::Hard, None)?;

        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(false);
        let untracked: Vec<PathBuf> = repo
            .statuses(Some(&mut opts))?
            .iter()
            .filter(|entry| entry.status().is_wt_new())
            .filter_map(|entry| entry.path().map(PathBuf::from))
            .collect();
        for path in untracked {
            let full = worktree_path.join(&path);
            if full.is_dir() {
                std::fs::remove_dir_all(&full)?;
            } else if full.exists() {
                std::fs::remove_file(&full)?;
            }
        }
        Ok(())
    }

    /// Files changed between `base` and the worktree's HEAD, with their new
    /// content (`None` for deletions). Binary blobs are skipped.
    pub fn changed_files(
        worktree_path: &Path,
        base: &str,
    ) -> Result<BTreeMap<PathBuf, Option<String>>> {
        let repo = Repository::open(worktree_path)?;
        let base_tree = repo.find_commit(Oid::from_str(base)?)?.tree()?;
        let head_tree = repo.head()?.peel_to_tree()?;
        let mut opts = DiffOptions::new();
        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), Some(&mut opts))?;

        let mut changes = BTreeMap::new();
        for delta in diff.deltas() {
            match delta.status() {
                Delta::Deleted => {
                    if let Some(path) = delta.old_file().path() {
                        changes.insert(path.to_path_buf(), None);
                    }
                }
                Delta::Added | Delta::Modified | Delta::Renamed | Delta::Copied => {
                    let Some(path) = delta.new_file().path() else {
                        continue;
                    };
                    let blob = repo.find_blob(delta.new_file().id())?;
                    if blob.is_binary() {
                        rlog_warn!("Skipping binary file {}", path.display());
                        continue;
                    }
                    let content = String::from_utf8_lossy(blob.content()).into_owned();
                    changes.insert(path.to_path_buf(), Some(content));
                    if delta.status() == Delta::Renamed {
                        if let Some(old) = delta.old_file().path() {
                            changes.insert(old.to_path_buf(), None);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(changes)
    }
}

fn worktree_name(worktree_path: &Path, fallback: &str) -> String {
    worktree_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| fallback.replace('/', "-"))
}
