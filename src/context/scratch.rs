//! Directory-copy backend for projects without git.
//!
//! Each context is a full copy of the main directory. Base and sealed file
//! sets are kept in memory so a shared context can roll back a failed task.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{
    read_paths, write_changes, ChangeSet, ContextId, ExecutionContext, Snapshot, WorkspaceBackend,
};
use crate::{rlog_debug, rlog_trace, Error, Result};

type Files = BTreeMap<PathBuf, String>;

struct ScratchState {
    base: Files,
    sealed: Files,
}

pub struct ScratchBackend {
    main_dir: PathBuf,
    states: Mutex<HashMap<ContextId, ScratchState>>,
}

impl ScratchBackend {
    pub fn new(main_dir: &Path) -> Self {
        Self {
            main_dir: main_dir.to_path_buf(),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn main_dir(&self) -> &Path {
        &self.main_dir
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ContextId, ScratchState>> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Every text file under `root`, skipping `.git`.
fn read_tree(root: &Path) -> Result<Files> {
    let mut files = Files::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_name() == ".git" {
                continue;
            }
            if entry.file_type()?.is_dir() {
                stack.push(path);
                continue;
            }
            let relative = path
                .strip_prefix(root)
                .map_err(|e| Error::Validation(e.to_string()))?
                .to_path_buf();
            match String::from_utf8(std::fs::read(&path)?) {
                Ok(content) => {
                    files.insert(relative, content);
                }
                Err(_) => rlog_trace!("Skipping non-text file {}", path.display()),
            }
        }
    }
    Ok(files)
}

fn diff_files(from: &Files, to: &Files) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for (path, content) in to {
        if from.get(path) != Some(content) {
            changes.insert(path.clone(), Some(content.clone()));
        }
    }
    for path in from.keys() {
        if !to.contains_key(path) {
            changes.insert(path.clone(), None);
        }
    }
    changes
}

impl WorkspaceBackend for ScratchBackend {
    fn name(&self) -> &'static str {
        "scratch"
    }

    fn prepare(&self) -> Result<()> {
        std::fs::create_dir_all(&self.main_dir)?;
        Ok(())
    }

    fn create(&self, context: &mut ExecutionContext) -> Result<()> {
        let base = read_tree(&self.main_dir)?;
        std::fs::create_dir_all(&context.root)?;
        for (path, content) in &base {
            let full = context.root.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(full, content)?;
        }
        rlog_debug!(
            "Scratch context {} copied {} files",
            context.id.short(),
            base.len()
        );
        self.lock().insert(
            context.id,
            ScratchState {
                sealed: base.clone(),
                base,
            },
        );
        Ok(())
    }

    fn seal(&self, context: &ExecutionContext, _message: &str) -> Result<()> {
        let current = read_tree(&context.root)?;
        let mut states = self.lock();
        let state = states
            .get_mut(&context.id)
            .ok_or_else(|| Error::ContextNotFound(context.id.to_string()))?;
        state.sealed = current;
        Ok(())
    }

    fn discard(&self, context: &ExecutionContext) -> Result<()> {
        let sealed = self
            .lock()
            .get(&context.id)
            .map(|s| s.sealed.clone())
            .ok_or_else(|| Error::ContextNotFound(context.id.to_string()))?;
        let current = read_tree(&context.root)?;
        let rollback: ChangeSet = diff_files(&current, &sealed);
        write_changes(&context.root, &rollback)
    }

    fn changes(&self, context: &ExecutionContext) -> Result<ChangeSet> {
        let states = self.lock();
        let state = states
            .get(&context.id)
            .ok_or_else(|| Error::ContextNotFound(context.id.to_string()))?;
        Ok(diff_files(&state.base, &state.sealed))
    }

    fn read_main(&self, paths: &[PathBuf]) -> Result<Snapshot> {
        read_paths(&self.main_dir, paths)
    }

    fn commit_main(&self, changes: &ChangeSet, _message: &str) -> Result<()> {
        write_changes(&self.main_dir, changes)
    }

    fn dispose(&self, context: &ExecutionContext, keep: bool) -> Result<()> {
        self.lock().remove(&context.id);
        if !keep && context.root.exists() {
            std::fs::remove_dir_all(&context.root)?;
        }
        Ok(())
    }
}
