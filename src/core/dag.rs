//! Task graph: the scheduling substrate.
//!
//! `TaskGraph` stores task nodes in a petgraph `DiGraph` with an edge from
//! every dependency to its dependent. Structure is fixed at `build`; only
//! per-node status, evidence and retry bookkeeping change afterwards, and
//! only through `apply`, `record`, `retry` and `block_dependents`.

use crate::core::scoring::{ComplexityScorer, ScoreHistory, TargetCountScorer};
use crate::core::task::{EvidenceEntry, TaskDescriptor, TaskId, TaskNode, TaskStatus};
use crate::error::{Error, GraphError, Result};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// The task dependency graph.
#[derive(Clone)]
pub struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Build a graph from decomposition output.
    ///
    /// Missing complexities are scored by `TargetCountScorer` with empty
    /// history; use `build_with_scorer` to supply another scorer.
    pub fn build(descriptors: Vec<TaskDescriptor>) -> std::result::Result<Self, GraphError> {
        Self::build_with_scorer(descriptors, &TargetCountScorer, &ScoreHistory::default())
    }

    /// Build a graph, asking `scorer` for any complexity the decomposition
    /// left out.
    ///
    /// # Errors
    /// Rejects duplicate ids, out-of-range complexities, dangling dependency
    /// references, cycles (naming one), and nodes unreachable from a root.
    pub fn build_with_scorer(
        descriptors: Vec<TaskDescriptor>,
        scorer: &dyn ComplexityScorer,
        history: &ScoreHistory,
    ) -> std::result::Result<Self, GraphError> {
        let mut nodes = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let complexity = match descriptor.complexity {
                Some(value) if (1..=5).contains(&value) => value,
                Some(value) => {
                    return Err(GraphError::InvalidComplexity {
                        task: descriptor.id,
                        value,
                    })
                }
                None => scorer.score(&descriptor, history).clamp(1, 5),
            };
            nodes.push(TaskNode::from_descriptor(descriptor, complexity));
        }
        Self::from_nodes(nodes)
    }

    /// Rebuild a graph from nodes carrying their own state, e.g. a
    /// checkpoint. Performs the same validation as `build`.
    pub fn from_nodes(nodes: Vec<TaskNode>) -> std::result::Result<Self, GraphError> {
        let mut graph = DiGraph::with_capacity(nodes.len(), nodes.len());
        let mut task_index = HashMap::with_capacity(nodes.len());

        for node in nodes {
            if task_index.contains_key(&node.id) {
                return Err(GraphError::DuplicateTask(node.id));
            }
            let id = node.id.clone();
            let index = graph.add_node(node);
            task_index.insert(id, index);
        }

        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let node = &graph[index];
            for dep in &node.dependencies {
                let dep_index =
                    task_index
                        .get(dep)
                        .ok_or_else(|| GraphError::DanglingDependency {
                            task: node.id.clone(),
                            missing: dep.clone(),
                        })?;
                edges.push((*dep_index, index));
            }
        }
        for (from, to) in edges {
            graph.update_edge(from, to, ());
        }

        let dag = Self { graph, task_index };
        dag.check_acyclic()?;
        dag.check_reachable()?;
        Ok(dag)
    }

    fn check_acyclic(&self) -> std::result::Result<(), GraphError> {
        for scc in tarjan_scc(&self.graph) {
            let self_loop = scc.len() == 1 && self.graph.contains_edge(scc[0], scc[0]);
            if scc.len() > 1 || self_loop {
                return Err(GraphError::Cycle {
                    path: self.cycle_path(&scc),
                });
            }
        }
        Ok(())
    }

    /// Walk edges inside a strongly connected component until a node repeats.
    /// The repeated stretch is a real cycle.
    fn cycle_path(&self, scc: &[NodeIndex]) -> Vec<TaskId> {
        let members: HashSet<NodeIndex> = scc.iter().copied().collect();
        let Some(mut current) = scc.iter().copied().min_by(|a, b| {
            self.graph[*a].id.cmp(&self.graph[*b].id)
        }) else {
            return Vec::new();
        };

        let mut walk: Vec<NodeIndex> = Vec::new();
        loop {
            if let Some(pos) = walk.iter().position(|n| *n == current) {
                return walk[pos..]
                    .iter()
                    .map(|n| self.graph[*n].id.clone())
                    .collect();
            }
            walk.push(current);
            let next = self
                .graph
                .neighbors_directed(current, Direction::Outgoing)
                .filter(|n| members.contains(n))
                .min_by(|a, b| self.graph[*a].id.cmp(&self.graph[*b].id));
            match next {
                Some(n) => current = n,
                None => {
                    return walk.iter().map(|n| self.graph[*n].id.clone()).collect();
                }
            }
        }
    }

    fn check_reachable(&self) -> std::result::Result<(), GraphError> {
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|i| {
                self.graph
                    .neighbors_directed(*i, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect();

        while let Some(index) = queue.pop_front() {
            if seen.insert(index) {
                queue.extend(self.graph.neighbors_directed(index, Direction::Outgoing));
            }
        }

        if seen.len() == self.graph.node_count() {
            return Ok(());
        }
        let mut unreachable: Vec<TaskId> = self
            .graph
            .node_indices()
            .filter(|i| !seen.contains(i))
            .map(|i| self.graph[i].id.clone())
            .collect();
        unreachable.sort();
        Err(GraphError::Unreachable(unreachable))
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.get(id).map(|n| n.status)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All nodes, ordered by id.
    pub fn nodes(&self) -> Vec<&TaskNode> {
        let mut nodes: Vec<&TaskNode> = self.graph.node_weights().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.nodes().into_iter().map(|n| n.id.clone()).collect()
    }

    /// Direct dependents of a task.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|n| self.graph[n].id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every task reachable downstream of `id`, excluding `id`.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .neighbors_directed(start, Direction::Outgoing)
            .collect();
        while let Some(index) = queue.pop_front() {
            if seen.insert(index) {
                queue.extend(self.graph.neighbors_directed(index, Direction::Outgoing));
            }
        }
        let mut ids: Vec<TaskId> = seen.into_iter().map(|i| self.graph[i].id.clone()).collect();
        ids.sort();
        ids
    }

    /// Pending tasks whose every dependency is Done, ordered by id.
    pub fn ready_nodes(&self) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .graph
            .node_indices()
            .filter(|&index| {
                self.graph[index].status == TaskStatus::Pending
                    && self
                        .graph
                        .neighbors_directed(index, Direction::Incoming)
                        .all(|dep| self.graph[dep].status == TaskStatus::Done)
            })
            .map(|index| self.graph[index].id.clone())
            .collect();
        ready.sort();
        ready
    }

    /// Dependencies of `id` that are not Done.
    pub fn unmet_dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut unmet: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .filter(|dep| self.graph[*dep].status != TaskStatus::Done)
            .map(|dep| self.graph[dep].id.clone())
            .collect();
        unmet.sort();
        unmet
    }

    /// Pure transition: returns a new graph with `id` moved to `status` and
    /// `evidence` appended.
    ///
    /// # Errors
    /// `InvalidTransition` unless the move is a legal forward transition.
    pub fn apply(
        &self,
        id: &TaskId,
        status: TaskStatus,
        evidence: Option<EvidenceEntry>,
    ) -> Result<TaskGraph> {
        let mut next = self.clone();
        next.apply_in_place(id, status, evidence)?;
        Ok(next)
    }

    pub(crate) fn apply_in_place(
        &mut self,
        id: &TaskId,
        status: TaskStatus,
        evidence: Option<EvidenceEntry>,
    ) -> Result<()> {
        let index = self.index_of(id)?;
        let node = &mut self.graph[index];
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

    /// Append evidence without changing status.
    pub fn record(&mut self, id: &TaskId, entry: EvidenceEntry) -> Result<()> {
        let index = self.index_of(id)?;
        self.graph[index].evidence.push(entry);
        Ok(())
    }

    /// Overwrite a node's state wholesale. Used when merging per-node
    /// state maintained elsewhere back into the graph.
    pub(crate) fn replace_node_state(&mut self, state: TaskNode) -> Result<()> {
        let index = self.index_of(&state.id)?;
        let node = &mut self.graph[index];
        node.status = state.status;
        node.evidence = state.evidence;
        node.retry_count = state.retry_count;
        node.blocked_reason = state.blocked_reason;
        node.updated_at = state.updated_at;
        Ok(())
    }

    /// Explicit retry: Failed -> Pending, bounded by `limit` retries per node.
    ///
    /// Blocked dependents are re-opened to Pending unless another of their
    /// dependencies is still Failed or Blocked. Returns the re-opened ids.
    pub fn retry(&mut self, id: &TaskId, limit: u32) -> Result<Vec<TaskId>> {
        let index = self.index_of(id)?;
        let order = self.topological_order()?;
        let node = &mut self.graph[index];
        if node.status != TaskStatus::Failed {
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from: node.status,
                to: TaskStatus::Pending,
            });
        }
        if node.retry_count >= limit {
            return Err(Error::RetryLimit {
                task: id.clone(),
                limit,
            });
        }
        node.retry_count += 1;
        let count = node.retry_count;
        node.set_status(TaskStatus::Pending);
        node.evidence
            .push(EvidenceEntry::note(format!("explicit retry {} of {}", count, limit)));

        // Upstream before downstream, so a re-opened dependency no longer holds
        // back the tasks below it.
        let downstream: HashSet<TaskId> = self.transitive_dependents(id).into_iter().collect();
        let mut reopened = Vec::new();
        for dep_id in order.into_iter().filter(|t| downstream.contains(t)) {
            let index = self.task_index[&dep_id];
            if self.graph[index].status != TaskStatus::Blocked {
                continue;
            }
            let held = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .any(|up| {
                    matches!(
                        self.graph[up].status,
                        TaskStatus::Failed | TaskStatus::Blocked
                    )
                });
            if held {
                continue;
            }
            let dependent = &mut self.graph[index];
            dependent.set_status(TaskStatus::Pending);
            dependent
                .evidence
                .push(EvidenceEntry::note(format!("unblocked by retry of {}", id)));
            reopened.push(dep_id);
        }
        reopened.sort();
        Ok(reopened)
    }

    /// Mark every non-terminal downstream task Blocked. Returns the ids
    /// that changed.
    pub fn block_dependents(&mut self, id: &TaskId, reason: &str) -> Vec<TaskId> {
        let mut blocked = Vec::new();
        for dep_id in self.transitive_dependents(id) {
            if self.block(&dep_id, reason) {
                blocked.push(dep_id);
            }
        }
        blocked
    }

    /// Move one task to Blocked if its status allows it.
    pub fn block(&mut self, id: &TaskId, reason: &str) -> bool {
        let Some(&index) = self.task_index.get(id) else {
            return false;
        };
        let node = &mut self.graph[index];
        if !node.status.can_transition_to(TaskStatus::Blocked) {
            return false;
        }
        node.set_status(TaskStatus::Blocked);
        node.blocked_reason = Some(reason.to_string());
        node.evidence.push(EvidenceEntry::note(format!("blocked: {}", reason)));
        true
    }

    /// Re-open a Blocked task whose cause went away. Returns false when the
    /// task is not Blocked.
    pub fn unblock(&mut self, id: &TaskId, note: &str) -> bool {
        let Some(&index) = self.task_index.get(id) else {
            return false;
        };
        let node = &mut self.graph[index];
        if node.status != TaskStatus::Blocked {
            return false;
        }
        node.set_status(TaskStatus::Pending);
        node.evidence.push(EvidenceEntry::note(note.to_string()));
        true
    }

    /// Reset every task caught in flight (Ready, Running, Verifying) back to
    /// Pending. Partial work inside an execution context is never trusted.
    pub fn reset_in_flight(&mut self) -> Vec<TaskId> {
        let mut reset = Vec::new();
        for node in self.graph.node_weights_mut() {
            if matches!(
                node.status,
                TaskStatus::Ready | TaskStatus::Running | TaskStatus::Verifying
            ) {
                node.evidence.push(EvidenceEntry::note(format!(
                    "reset from {} on restore",
                    node.status
                )));
                node.set_status(TaskStatus::Pending);
                reset.push(node.id.clone());
            }
        }
        reset.sort();
        reset
    }

    pub fn all_done(&self) -> bool {
        self.graph
            .node_weights()
            .all(|n| n.status == TaskStatus::Done)
    }

    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.nodes()
            .into_iter()
            .filter(|n| n.status == status)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Tasks in dependency order.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self.graph[cycle.node_id()].id.clone();
            Error::Graph(GraphError::Cycle { path: vec![id] })
        })?;
        Ok(sorted
            .into_iter()
            .map(|index| self.graph[index].id.clone())
            .collect())
    }

    /// Owned copies of every node, ordered by id; the persisted form.
    pub fn to_nodes(&self) -> Vec<TaskNode> {
        self.nodes().into_iter().cloned().collect()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.edge_count())
            .finish()
    }
}
