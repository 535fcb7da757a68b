//! Crash-consistent checkpoints.
//!
//! Each checkpoint is a fresh `checkpoint-<seq>.json` file written through a
//! uniquely named temporary file that is synced before the rename. Only after
//! it is complete does the `CURRENT` pointer switch to it the same way, so a
//! crash at any point leaves the previous checkpoint restorable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::core::{ScoreHistory, TaskGraph, TaskId, TaskNode};
use crate::error::GraphError;
use crate::orchestration::escalation::Escalation;
use crate::orchestration::resolver::ConflictRecord;
use crate::util::{blocking, blocking_with_timeout};
use crate::{rlog, rlog_debug, rlog_warn, Error, Result};

pub const CHECKPOINT_VERSION: u32 = 1;

const POINTER_FILE: &str = "CURRENT";
const FILE_PREFIX: &str = "checkpoint-";

/// Where scheduling picks up after a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePointer {
    pub round: u32,
    /// The group that would have run next.
    pub next_group: Vec<TaskId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    GroupComplete,
    Interval,
    Budget,
    Requested,
    Cancelled,
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub seq: u64,
    pub taken_at: DateTime<Utc>,
    pub reason: CheckpointReason,
    /// Every node with status, evidence and retry counter.
    pub tasks: Vec<TaskNode>,
    #[serde(default)]
    pub conflicts: Vec<ConflictRecord>,
    /// Escalations still waiting for a decision; re-issued on resume.
    #[serde(default)]
    pub pending_escalations: Vec<Escalation>,
    pub resume: ResumePointer,
    /// Wall-clock seconds spent across all sessions so far.
    #[serde(default)]
    pub elapsed_secs: f64,
    #[serde(default)]
    pub history: ScoreHistory,
}

impl Checkpoint {
    pub fn capture(graph: &TaskGraph, resume: ResumePointer, reason: CheckpointReason) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            seq: 0,
            taken_at: Utc::now(),
            reason,
            tasks: graph.to_nodes(),
            conflicts: Vec::new(),
            pending_escalations: Vec::new(),
            resume,
            elapsed_secs: 0.0,
            history: ScoreHistory::default(),
        }
    }

    pub fn with_conflicts(
        mut self,
        conflicts: Vec<ConflictRecord>,
        pending_escalations: Vec<Escalation>,
    ) -> Self {
        self.conflicts = conflicts;
        self.pending_escalations = pending_escalations;
        self
    }

    pub fn with_elapsed(mut self, elapsed_secs: f64) -> Self {
        self.elapsed_secs = elapsed_secs;
        self
    }

    pub fn with_history(mut self, history: ScoreHistory) -> Self {
        self.history = history;
        self
    }

    /// Rebuild and revalidate the task graph.
    pub fn graph(&self) -> std::result::Result<TaskGraph, GraphError> {
        TaskGraph::from_nodes(self.tasks.clone())
    }

    pub fn file_name(&self) -> String {
        file_name(self.seq)
    }
}

fn file_name(seq: u64) -> String {
    format!("{}{:06}.json", FILE_PREFIX, seq)
}

/// Write through a temp file of its own, so a writer that outlived its
/// timeout never shares one with the next attempt.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    let written = fs::File::create(&temp_path).and_then(|mut file| {
        file.write_all(contents)?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|()| fs::rename(&temp_path, path)) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}

fn parse_seq(name: &str) -> Option<u64> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Checkpoint files in a directory, keyed by sequence number.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    keep: usize,
}

impl CheckpointStore {
    /// `keep` older checkpoints are retained next to the current one.
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            keep,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, seq: u64) -> PathBuf {
        self.dir.join(file_name(seq))
    }

    /// Capture `graph` and write it as the new current checkpoint.
    pub async fn snapshot(
        &self,
        graph: &TaskGraph,
        resume: ResumePointer,
        reason: CheckpointReason,
    ) -> Result<Checkpoint> {
        self.write(Checkpoint::capture(graph, resume, reason)).await
    }

    /// Write `checkpoint` under the next sequence number and switch the
    /// pointer to it.
    pub async fn write(&self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        let store = self.clone();
        blocking(move || store.write_sync(checkpoint)).await
    }

    /// `write` that gives up after `limit`, e.g. on a hung network mount.
    pub async fn write_within(&self, checkpoint: Checkpoint, limit: Duration) -> Result<Checkpoint> {
        let store = self.clone();
        blocking_with_timeout(limit, move || store.write_sync(checkpoint)).await
    }

    pub fn write_sync(&self, mut checkpoint: Checkpoint) -> Result<Checkpoint> {
        fs::create_dir_all(&self.dir)?;
        checkpoint.seq = self.sequences()?.last().map_or(1, |s| s + 1);
        checkpoint.version = CHECKPOINT_VERSION;

        let contents = serde_json::to_string_pretty(&checkpoint)?;
        write_atomic(&self.path_of(checkpoint.seq), contents.as_bytes())?;
        write_atomic(
            &self.dir.join(POINTER_FILE),
            format!("{}\n", checkpoint.file_name()).as_bytes(),
        )?;
        rlog!(
            "Checkpoint {} written ({:?}, {} tasks)",
            checkpoint.seq,
            checkpoint.reason,
            checkpoint.tasks.len()
        );

        self.prune(checkpoint.seq);
        Ok(checkpoint)
    }

    /// Load the current checkpoint, or `None` on a cold start.
    ///
    /// In-flight tasks come back as Pending. A missing, unreadable or invalid
    /// pointer target falls back to the newest file that loads.
    pub async fn restore(&self) -> Result<Option<Checkpoint>> {
        let store = self.clone();
        blocking(move || store.restore_sync()).await
    }

    pub fn restore_sync(&self) -> Result<Option<Checkpoint>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(name) = fs::read_to_string(self.dir.join(POINTER_FILE)) {
            candidates.push(self.dir.join(name.trim()));
        }
        for seq in self.sequences()?.into_iter().rev() {
            let path = self.path_of(seq);
            if !candidates.contains(&path) {
                candidates.push(path);
            }
        }

        for path in candidates {
            match Self::load(&path) {
                Ok(checkpoint) => {
                    rlog_debug!("Restored checkpoint {} from {}", checkpoint.seq, path.display());
                    return Ok(Some(checkpoint));
                }
                Err(e) => rlog_warn!("Skipping checkpoint {}: {}", path.display(), e),
            }
        }
        Ok(None)
    }

    /// Parse and validate one file, resetting in-flight tasks.
    fn load(path: &Path) -> Result<Checkpoint> {
        let contents = fs::read_to_string(path)?;
        let mut checkpoint: Checkpoint = serde_json::from_str(&contents)?;
        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(Error::Validation(format!(
                "checkpoint version {} is newer than supported {}",
                checkpoint.version, CHECKPOINT_VERSION
            )));
        }
        let mut graph = checkpoint.graph()?;
        let reset = graph.reset_in_flight();
        if !reset.is_empty() {
            rlog!("Restored checkpoint reset in-flight tasks: {:?}", reset);
        }
        checkpoint.tasks = graph.to_nodes();
        Ok(checkpoint)
    }

    /// Sequence numbers of complete checkpoint files, ascending.
    fn sequences(&self) -> Result<Vec<u64>> {
        let mut seqs = Vec::new();
        if !self.dir.exists() {
            return Ok(seqs);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(seq) = entry.file_name().to_str().and_then(parse_seq) {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    fn prune(&self, current: u64) {
        let Ok(seqs) = self.sequences() else {
            return;
        };
        let older: Vec<u64> = seqs.into_iter().filter(|s| *s < current).collect();
        let excess = older.len().saturating_sub(self.keep);
        for seq in &older[..excess] {
            if let Err(e) = fs::remove_file(self.path_of(*seq)) {
                rlog_warn!("Failed to prune checkpoint {}: {}", seq, e);
            }
        }
    }
}
