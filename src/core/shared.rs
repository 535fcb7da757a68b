//! Concurrent view of a task graph used while a group is running.
//!
//! Structure is shared read-only; each node's mutable state sits behind its
//! own mutex, so workers on different nodes never contend and two workers can
//! never both move the same node.

use crate::core::dag::TaskGraph;
use crate::core::task::{EvidenceEntry, TaskId, TaskNode, TaskStatus};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

pub struct SharedGraph {
    base: TaskGraph,
    cells: HashMap<TaskId, Mutex<TaskNode>>,
}

impl SharedGraph {
    pub fn new(graph: TaskGraph) -> Self {
        let cells = graph
            .to_nodes()
            .into_iter()
            .map(|node| (node.id.clone(), Mutex::new(node)))
            .collect();
        Self { base: graph, cells }
    }

    fn cell(&self, id: &TaskId) -> Result<MutexGuard<'_, TaskNode>> {
        let cell = self
            .cells
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        Ok(cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Transition one node under its own lock.
    pub fn apply(
        &self,
        id: &TaskId,
        status: TaskStatus,
        evidence: Option<EvidenceEntry>,
    ) -> Result<()> {
        let mut node = self.cell(id)?;
        if !node.status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from: node.status,
                to: status,
            });
        }
        node.set_status(status);
        if let Some(entry) = evidence {
            node.evidence.push(entry);
        }
        Ok(())
    }

    /// Move a node to Blocked, keeping the reason.
    pub fn block(&self, id: &TaskId, reason: &str) -> Result<()> {
        let mut node = self.cell(id)?;
        if !node.status.can_transition_to(TaskStatus::Blocked) {
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from: node.status,
                to: TaskStatus::Blocked,
            });
        }
        node.set_status(TaskStatus::Blocked);
        node.blocked_reason = Some(reason.to_string());
        node.evidence
            .push(EvidenceEntry::note(format!("blocked: {}", reason)));
        Ok(())
    }

    pub fn record(&self, id: &TaskId, entry: EvidenceEntry) -> Result<()> {
        self.cell(id)?.evidence.push(entry);
        Ok(())
    }

    pub fn status(&self, id: &TaskId) -> Result<TaskStatus> {
        Ok(self.cell(id)?.status)
    }

    /// Clone of the node's current state.
    pub fn node(&self, id: &TaskId) -> Result<TaskNode> {
        Ok(self.cell(id)?.clone())
    }

    /// Fold every node's current state back into a plain graph.
    pub fn snapshot(&self) -> Result<TaskGraph> {
        let mut graph = self.base.clone();
        for cell in self.cells.values() {
            let node = cell
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            graph.replace_node_state(node)?;
        }
        Ok(graph)
    }
}
