//! Dependency graph for task scheduling.
//!
//! This module provides the [`DependencyGraph`] which tracks the live task
//! DAG, the monotonically growing set of completed tasks, and computes which
//! tasks become runnable when others finish or fail.
//!
//! Edges point from a dependency to its dependent: `a -> b` means `b`
//! cannot start before `a` completes. Completed tasks leave the live graph;
//! only their ids are remembered.

use crate::core::agent::AgentId;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// A task plus its insertion sequence, used for deterministic ordering.
#[derive(Debug, Clone)]
struct TaskNode {
    task: Task,
    seq: u64,
}

/// The task dependency graph.
pub struct DependencyGraph {
    /// Live tasks; completed tasks are removed.
    graph: StableDiGraph<TaskNode, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Every task ever completed in this graph. Never shrinks.
    completed: HashSet<TaskId>,
    next_seq: u64,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            task_index: HashMap::new(),
            completed: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Register a task.
    ///
    /// # Errors
    /// - `DuplicateTask` if the id is live or already completed
    /// - `Cycle` if the task lists itself as a dependency
    /// - `Dependency` listing every dependency that is neither completed
    ///   nor present in the graph
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.task_index.contains_key(&task.id) || self.completed.contains(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        if task.dependencies.contains(&task.id) {
            return Err(Error::Cycle {
                cycles: vec![vec![task.id]],
            });
        }

        let missing: Vec<TaskId> = task
            .dependencies
            .iter()
            .filter(|dep| !self.completed.contains(*dep) && !self.task_index.contains_key(*dep))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Error::Dependency {
                task: task.id,
                missing,
            });
        }

        self.insert(task);
        Ok(())
    }

    /// Register a task without validating its dependencies.
    ///
    /// Dependencies may reference tasks added later, and self or mutual
    /// dependencies are kept, so externally supplied plans can be loaded
    /// whole and then checked with [`detect_cycles`](Self::detect_cycles).
    /// A duplicate id replaces the existing task's payload in place.
    pub fn add_task_unchecked(&mut self, task: Task) {
        if let Some(&index) = self.task_index.get(&task.id) {
            warn!("Replacing task {} in dependency graph", task.id);
            let deps = task.dependencies.clone();
            if let Some(node) = self.graph.node_weight_mut(index) {
                node.task = task;
            }
            self.link_dependencies(index, &deps);
            self.refresh_readiness(index);
            return;
        }

        let index = self.insert(task);
        // Wire tasks that named this one before it existed.
        let id = self.graph[index].task.id.clone();
        let waiting: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&other| other != index && self.graph[other].task.dependencies.contains(&id))
            .collect();
        for other in waiting {
            if self.graph.find_edge(index, other).is_none() {
                self.graph.add_edge(index, other, ());
            }
            self.refresh_readiness(other);
        }
    }

    fn insert(&mut self, task: Task) -> NodeIndex {
        let id = task.id.clone();
        let deps = task.dependencies.clone();
        let seq = self.next_seq;
        self.next_seq += 1;

        let index = self.graph.add_node(TaskNode { task, seq });
        self.task_index.insert(id.clone(), index);
        self.link_dependencies(index, &deps);

        let failed_dep = deps.iter().find(|dep| {
            self.task_index
                .get(*dep)
                .and_then(|&i| self.graph.node_weight(i))
                .map(|n| matches!(n.task.status, TaskStatus::Failed { .. }))
                .unwrap_or(false)
        });
        if let Some(dep) = failed_dep {
            let reason = format!("dependency {} failed", dep);
            debug!("Task {} registered as failed: {}", id, reason);
            self.graph[index].task.fail(&reason);
        } else {
            self.refresh_readiness(index);
        }
        index
    }

    fn link_dependencies(&mut self, index: NodeIndex, deps: &[TaskId]) {
        for dep in deps {
            if let Some(&dep_index) = self.task_index.get(dep) {
                if self.graph.find_edge(dep_index, index).is_none() {
                    self.graph.add_edge(dep_index, index, ());
                }
            }
        }
    }

    /// Promote a pending task to ready when all its dependencies completed.
    fn refresh_readiness(&mut self, index: NodeIndex) -> bool {
        let ready = match self.graph.node_weight(index) {
            Some(node) => {
                node.task.status == TaskStatus::Pending
                    && node
                        .task
                        .dependencies
                        .iter()
                        .all(|dep| self.completed.contains(dep))
            }
            None => false,
        };
        if ready {
            self.graph[index].task.mark_ready();
        }
        ready
    }

    /// Neighbors of a node in insertion order.
    fn sorted_neighbors(&self, index: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> =
            self.graph.neighbors_directed(index, direction).collect();
        neighbors.sort_by_key(|&n| self.graph[n].seq);
        neighbors.dedup();
        neighbors
    }

    fn indices_in_order(&self) -> Vec<NodeIndex> {
        let mut indices: Vec<NodeIndex> = self.graph.node_indices().collect();
        indices.sort_by_key(|&n| self.graph[n].seq);
        indices
    }

    // ========== Scheduling Operations ==========

    /// Mark a task as completed.
    ///
    /// The task leaves the live graph and joins the completed set. Returns
    /// the dependents that just became ready. Only ready or running tasks
    /// can complete; unknown ids, pending tasks and failed tasks yield an
    /// empty list.
    pub fn mark_completed(&mut self, id: &TaskId) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let status = &self.graph[index].task.status;
        if !matches!(status, TaskStatus::Ready | TaskStatus::Running) {
            warn!("Ignoring completion of {} task {}", status, id);
            return Vec::new();
        }

        let dependents = self.sorted_neighbors(index, Direction::Outgoing);
        self.graph.remove_node(index);
        self.task_index.remove(id);
        self.completed.insert(id.clone());

        let mut unlocked = Vec::new();
        for dep in dependents {
            if self.refresh_readiness(dep) {
                unlocked.push(self.graph[dep].task.id.clone());
            }
        }

        debug!("Task {} completed, unlocked {:?}", id, unlocked);
        unlocked
    }

    /// Mark a task as failed and cascade to every transitive dependent.
    ///
    /// Returns the dependent closure (not including `id` itself) in
    /// breadth-first order. Unknown ids yield an empty list.
    pub fn mark_failed(&mut self, id: &TaskId) -> Vec<TaskId> {
        self.mark_failed_with(id, "task failed")
    }

    /// Like [`mark_failed`](Self::mark_failed) with an explicit reason.
    pub fn mark_failed_with(&mut self, id: &TaskId, reason: &str) -> Vec<TaskId> {
        let Some(&root) = self.task_index.get(id) else {
            return Vec::new();
        };
        self.graph[root].task.fail(reason);

        let mut seen: HashSet<NodeIndex> = HashSet::from([root]);
        let mut queue: VecDeque<NodeIndex> = VecDeque::from([root]);
        let mut cascaded = Vec::new();

        while let Some(current) = queue.pop_front() {
            for next in self.sorted_neighbors(current, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                    cascaded.push(next);
                }
            }
        }

        let cascade_reason = format!("dependency {} failed", id);
        let ids = cascaded
            .into_iter()
            .map(|index| {
                let task = &mut self.graph[index].task;
                task.fail(&cascade_reason);
                task.id.clone()
            })
            .collect::<Vec<_>>();

        if !ids.is_empty() {
            warn!("Task {} failed, cascading to {} dependents", id, ids.len());
        }
        ids
    }

    /// Mark a ready task as running on an agent.
    ///
    /// # Errors
    /// `TaskNotFound` for unknown ids, `TaskNotReady` unless the task is ready.
    pub fn mark_running(&mut self, id: &TaskId, agent: Option<AgentId>) -> Result<()> {
        let index = *self
            .task_index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        if !self.graph[index].task.is_ready() {
            return Err(Error::TaskNotReady(id.clone()));
        }
        self.graph[index].task.start(agent);
        Ok(())
    }

    /// Move a running task to another agent without restarting it.
    pub fn reassign(&mut self, id: &TaskId, agent: AgentId) -> Result<()> {
        let index = *self
            .task_index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        self.graph[index].task.assigned_agent = Some(agent);
        Ok(())
    }

    /// Put a running task back in the ready set, dropping its agent.
    ///
    /// Returns false if the task was not running.
    pub fn release(&mut self, id: &TaskId) -> Result<bool> {
        let index = *self
            .task_index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let task = &mut self.graph[index].task;
        if task.status != TaskStatus::Running {
            return Ok(false);
        }
        task.mark_ready();
        task.assigned_agent = None;
        task.started_at = None;
        Ok(true)
    }

    /// Find every cycle reachable from unvisited roots.
    ///
    /// Each cycle is the stack slice from the node a back edge points at
    /// to the node it was found from, walking dependency edges.
    pub fn detect_cycles(&self) -> Vec<Vec<TaskId>> {
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut on_stack: HashSet<NodeIndex> = HashSet::new();
        let mut stack: Vec<NodeIndex> = Vec::new();
        let mut cycles = Vec::new();

        for root in self.indices_in_order() {
            if !visited.contains(&root) {
                self.cycle_dfs(root, &mut visited, &mut on_stack, &mut stack, &mut cycles);
            }
        }
        cycles
    }

    fn cycle_dfs(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        on_stack: &mut HashSet<NodeIndex>,
        stack: &mut Vec<NodeIndex>,
        cycles: &mut Vec<Vec<TaskId>>,
    ) {
        visited.insert(node);
        on_stack.insert(node);
        stack.push(node);

        for dep in self.sorted_neighbors(node, Direction::Incoming) {
            if on_stack.contains(&dep) {
                if let Some(start) = stack.iter().position(|&n| n == dep) {
                    cycles.push(
                        stack[start..]
                            .iter()
                            .map(|&n| self.graph[n].task.id.clone())
                            .collect(),
                    );
                }
            } else if !visited.contains(&dep) {
                self.cycle_dfs(dep, visited, on_stack, stack, cycles);
            }
        }

        stack.pop();
        on_stack.remove(&node);
    }

    /// Cheap cycle check without path reconstruction.
    pub fn has_cycles(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Linearize live tasks so every dependency precedes its dependents.
    ///
    /// Returns `None` if the graph contains a cycle.
    pub fn topological_sort(&self) -> Option<Vec<TaskId>> {
        if !self.detect_cycles().is_empty() {
            return None;
        }

        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut order = Vec::with_capacity(self.graph.node_count());
        for root in self.indices_in_order() {
            self.postorder(root, &mut visited, &mut order);
        }
        Some(order)
    }

    fn postorder(&self, node: NodeIndex, visited: &mut HashSet<NodeIndex>, order: &mut Vec<TaskId>) {
        if !visited.insert(node) {
            return;
        }
        for dep in self.sorted_neighbors(node, Direction::Incoming) {
            self.postorder(dep, visited, order);
        }
        order.push(self.graph[node].task.id.clone());
    }

    /// Topological order, or a `Cycle` error carrying every cycle path.
    pub fn sorted_or_cycle_error(&self) -> Result<Vec<TaskId>> {
        let cycles = self.detect_cycles();
        if !cycles.is_empty() {
            return Err(Error::Cycle { cycles });
        }
        Ok(self.topological_sort().unwrap_or_default())
    }

    // ========== Queries ==========

    /// Ids of tasks currently in `Ready` status, in insertion order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.indices_in_order()
            .into_iter()
            .filter(|&i| self.graph[i].task.is_ready())
            .map(|i| self.graph[i].task.id.clone())
            .collect()
    }

    /// Ids of tasks that failed directly or by cascade.
    pub fn failed_tasks(&self) -> Vec<TaskId> {
        self.indices_in_order()
            .into_iter()
            .filter(|&i| matches!(self.graph[i].task.status, TaskStatus::Failed { .. }))
            .map(|i| self.graph[i].task.id.clone())
            .collect()
    }

    /// Status of a task; completed tasks report `Completed` after leaving
    /// the live graph.
    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        if self.completed.contains(id) {
            return Some(TaskStatus::Completed);
        }
        self.get_task(id).map(|t| t.status.clone())
    }

    /// Get a reference to a live task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
            .map(|node| &node.task)
    }

    /// Ids of live tasks that directly depend on `id`.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .sorted_neighbors(index, Direction::Outgoing)
                .into_iter()
                .map(|n| self.graph[n].task.id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn is_completed(&self, id: &TaskId) -> bool {
        self.completed.contains(id)
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Number of live (not completed) tasks.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// True when no task is left that could still run.
    pub fn all_complete(&self) -> bool {
        self.graph
            .node_weights()
            .all(|node| matches!(node.task.status, TaskStatus::Failed { .. }))
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.graph.edge_count())
            .field("completed", &self.completed_count())
            .finish()
    }
}
