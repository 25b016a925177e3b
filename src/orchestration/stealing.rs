//! Work stealing between agents.
//!
//! The [`WorkStealingCoordinator`] tracks per-agent workload and, when asked
//! on each steal tick, emits a [`StealRequest`] moving queued work from the
//! most loaded agent to the least loaded one. It never moves tasks itself;
//! [`AgentQueues::apply_steal`] performs the FIFO move for the engine.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::core::agent::{AgentId, AgentProfile};
use crate::core::task::{Task, TaskId};

/// Number of duration samples kept per agent.
pub const DURATION_WINDOW: usize = 100;

/// Default imbalance (in tasks) that triggers a steal.
pub const DEFAULT_STEAL_THRESHOLD: usize = 3;

/// Default cap on tasks moved by one steal.
pub const DEFAULT_MAX_STEAL_BATCH: usize = 5;

/// Default steal tick period.
pub const DEFAULT_STEAL_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkStealingConfig {
    pub enabled: bool,
    /// Minimum task-count gap between the busiest and idlest agent.
    pub steal_threshold: usize,
    /// Upper bound on tasks moved per steal.
    pub max_steal_batch: usize,
    /// Period of the steal ticker, in milliseconds.
    pub steal_interval_ms: u64,
}

impl Default for WorkStealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            steal_threshold: DEFAULT_STEAL_THRESHOLD,
            max_steal_batch: DEFAULT_MAX_STEAL_BATCH,
            steal_interval_ms: DEFAULT_STEAL_INTERVAL_MS,
        }
    }
}

impl WorkStealingConfig {
    pub fn steal_interval(&self) -> Duration {
        Duration::from_millis(self.steal_interval_ms)
    }
}

/// Live load of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentWorkload {
    pub agent_id: AgentId,
    pub task_count: usize,
    /// CPU usage in percent (0-100).
    pub cpu_usage: f64,
    /// Memory usage in percent (0-100).
    pub memory_usage: f64,
    /// Mean of the last [`DURATION_WINDOW`] task durations, in milliseconds.
    pub avg_task_duration: f64,
    pub affinity_score: f64,
}

impl AgentWorkload {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            task_count: 0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            avg_task_duration: 0.0,
            affinity_score: 0.5,
        }
    }
}

/// Instruction to move `count` queued tasks from one agent to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StealRequest {
    pub from: AgentId,
    pub to: AgentId,
    pub count: usize,
}

/// Aggregate view for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkStealingStats {
    pub agents: usize,
    pub total_tasks: usize,
    /// Gap between the busiest and idlest agent.
    pub imbalance: usize,
    pub steals_emitted: u64,
}

pub struct WorkStealingCoordinator {
    config: WorkStealingConfig,
    workloads: HashMap<AgentId, AgentWorkload>,
    /// Registration order, used for stable tie-breaking.
    order: Vec<AgentId>,
    durations: HashMap<AgentId, VecDeque<f64>>,
    steals_emitted: u64,
}

impl WorkStealingCoordinator {
    pub fn new(config: WorkStealingConfig) -> Self {
        Self {
            config,
            workloads: HashMap::new(),
            order: Vec::new(),
            durations: HashMap::new(),
            steals_emitted: 0,
        }
    }

    pub fn config(&self) -> &WorkStealingConfig {
        &self.config
    }

    /// Start tracking an agent. Re-registering keeps its current workload.
    pub fn register_agent(&mut self, agent_id: AgentId) {
        if !self.workloads.contains_key(&agent_id) {
            self.order.push(agent_id.clone());
            self.workloads
                .insert(agent_id.clone(), AgentWorkload::new(agent_id));
        }
    }

    pub fn unregister_agent(&mut self, agent_id: &AgentId) -> Option<AgentWorkload> {
        self.order.retain(|id| id != agent_id);
        self.durations.remove(agent_id);
        self.workloads.remove(agent_id)
    }

    /// Replace an agent's resource telemetry, registering it if needed.
    pub fn update_workload(&mut self, agent_id: &AgentId, cpu_usage: f64, memory_usage: f64) {
        self.register_agent(agent_id.clone());
        if let Some(workload) = self.workloads.get_mut(agent_id) {
            workload.cpu_usage = cpu_usage;
            workload.memory_usage = memory_usage;
        }
    }

    pub fn set_task_count(&mut self, agent_id: &AgentId, task_count: usize) {
        self.register_agent(agent_id.clone());
        if let Some(workload) = self.workloads.get_mut(agent_id) {
            workload.task_count = task_count;
        }
    }

    /// Increase an agent's task count. Unknown agents are ignored.
    pub fn increment_task_count(&mut self, agent_id: &AgentId, by: usize) {
        if let Some(workload) = self.workloads.get_mut(agent_id) {
            workload.task_count += by;
        }
    }

    /// Decrease an agent's task count, clamping at zero.
    pub fn decrement_task_count(&mut self, agent_id: &AgentId, by: usize) {
        if let Some(workload) = self.workloads.get_mut(agent_id) {
            workload.task_count = workload.task_count.saturating_sub(by);
        }
    }

    pub fn workload(&self, agent_id: &AgentId) -> Option<&AgentWorkload> {
        self.workloads.get(agent_id)
    }

    /// Workloads in registration order.
    pub fn workloads(&self) -> Vec<&AgentWorkload> {
        self.order
            .iter()
            .filter_map(|id| self.workloads.get(id))
            .collect()
    }

    /// Compare the busiest and idlest agents and emit a steal if the gap
    /// reaches the threshold.
    pub fn check_and_steal(&mut self) -> Option<StealRequest> {
        self.check_and_steal_by(|workload| workload.task_count)
    }

    /// Like [`check_and_steal`](Self::check_and_steal), but measures each
    /// agent with `load` instead of its task count.
    ///
    /// The engine passes queue lengths here so tasks an agent has already
    /// started never count towards the imbalance.
    pub fn check_and_steal_by<F>(&mut self, load: F) -> Option<StealRequest>
    where
        F: Fn(&AgentWorkload) -> usize,
    {
        if !self.config.enabled || self.workloads.len() < 2 {
            return None;
        }

        let ((min, min_load), (max, max_load)) = {
            // Stable sort keeps registration order among equal loads.
            let mut sorted: Vec<(&AgentWorkload, usize)> =
                self.workloads().into_iter().map(|w| (w, load(w))).collect();
            sorted.sort_by_key(|(_, n)| *n);
            let (min, min_load) = *sorted.first()?;
            let (max, max_load) = *sorted.last()?;
            ((min.agent_id.clone(), min_load), (max.agent_id.clone(), max_load))
        };
        let diff = max_load - min_load;
        if diff < self.config.steal_threshold {
            trace!(
                "No steal: imbalance {} below threshold {}",
                diff,
                self.config.steal_threshold
            );
            return None;
        }

        let count = (diff / 2).min(self.config.max_steal_batch);
        if count == 0 {
            return None;
        }

        let request = StealRequest {
            from: max,
            to: min,
            count,
        };
        self.steals_emitted += 1;
        info!(
            "Work steal: {} tasks from {} ({}) to {} ({})",
            count, request.from, max_load, request.to, min_load
        );
        Some(request)
    }

    /// Score agents for a task and return the best one.
    ///
    /// Ties go to the first agent in `agents`.
    pub fn find_best_agent(&self, task: &Task, agents: &[AgentProfile]) -> Option<AgentId> {
        let mut best: Option<(&AgentProfile, f64)> = None;
        for agent in agents {
            let score = self.agent_score(task, agent);
            trace!("Agent {} scored {:.2} for task {}", agent.id, score, task.id);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((agent, score)),
            }
        }
        best.map(|(agent, _)| agent.id.clone())
    }

    /// Six-factor additive score used by [`find_best_agent`](Self::find_best_agent).
    pub fn agent_score(&self, task: &Task, agent: &AgentProfile) -> f64 {
        let fallback = AgentWorkload {
            cpu_usage: agent.metrics.cpu_usage,
            memory_usage: agent.metrics.memory_usage,
            ..AgentWorkload::new(agent.id.clone())
        };
        let workload = self.workloads.get(&agent.id).unwrap_or(&fallback);
        let task_count = workload.task_count as f64;

        let mut score = 100.0;
        score -= task_count * 10.0;
        score -= workload.cpu_usage * 0.5;
        score -= workload.memory_usage * 0.3;
        score += f64::from(agent.priority) * 5.0;
        if agent.capabilities.supports_type(&task.task_type) {
            score += 20.0;
        }
        // Agents with long tasks queued will take longer to get to this one.
        score -= (workload.avg_task_duration * task_count) / 1000.0;
        score
    }

    /// Add a duration sample and refresh the agent's average.
    ///
    /// Samples for agents that are not registered are dropped.
    pub fn record_task_duration(&mut self, agent_id: &AgentId, duration: Duration) {
        if !self.workloads.contains_key(agent_id) {
            trace!("Dropping duration sample for unknown agent {}", agent_id);
            return;
        }
        let window = self.durations.entry(agent_id.clone()).or_default();
        window.push_back(duration.as_secs_f64() * 1000.0);
        while window.len() > DURATION_WINDOW {
            window.pop_front();
        }
        let avg = window.iter().sum::<f64>() / window.len() as f64;

        if let Some(workload) = self.workloads.get_mut(agent_id) {
            workload.avg_task_duration = avg;
        }
        debug!("Agent {} average task duration now {:.1}ms", agent_id, avg);
    }

    pub fn duration_samples(&self, agent_id: &AgentId) -> usize {
        self.durations.get(agent_id).map(VecDeque::len).unwrap_or(0)
    }

    pub fn stats(&self) -> WorkStealingStats {
        let counts: Vec<usize> = self.workloads.values().map(|w| w.task_count).collect();
        let max = counts.iter().copied().max().unwrap_or(0);
        let min = counts.iter().copied().min().unwrap_or(0);
        WorkStealingStats {
            agents: self.workloads.len(),
            total_tasks: counts.iter().sum(),
            imbalance: max - min,
            steals_emitted: self.steals_emitted,
        }
    }
}

impl Default for WorkStealingCoordinator {
    fn default() -> Self {
        Self::new(WorkStealingConfig::default())
    }
}

/// Per-agent FIFO queues of dispatched but not yet started tasks.
#[derive(Debug, Default)]
pub struct AgentQueues {
    queues: HashMap<AgentId, VecDeque<TaskId>>,
}

impl AgentQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, agent_id: &AgentId, task_id: TaskId) {
        self.queues
            .entry(agent_id.clone())
            .or_default()
            .push_back(task_id);
    }

    /// Remove a task wherever it is queued. Returns the agent it was on.
    pub fn remove(&mut self, task_id: &TaskId) -> Option<AgentId> {
        for (agent_id, queue) in self.queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|id| id == task_id) {
                queue.remove(pos);
                return Some(agent_id.clone());
            }
        }
        None
    }

    /// Pop the oldest queued task of an agent.
    pub fn next_for(&mut self, agent_id: &AgentId) -> Option<TaskId> {
        self.queues.get_mut(agent_id)?.pop_front()
    }

    pub fn queued(&self, agent_id: &AgentId) -> Vec<TaskId> {
        self.queues
            .get(agent_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, agent_id: &AgentId) -> usize {
        self.queues.get(agent_id).map(VecDeque::len).unwrap_or(0)
    }

    pub fn drop_agent(&mut self, agent_id: &AgentId) -> Vec<TaskId> {
        self.queues
            .remove(agent_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Move up to `request.count` of the oldest tasks, preserving their
    /// relative order at the back of the target queue.
    pub fn apply_steal(&mut self, request: &StealRequest) -> Vec<TaskId> {
        let moved: Vec<TaskId> = match self.queues.get_mut(&request.from) {
            Some(source) => {
                let n = request.count.min(source.len());
                source.drain(..n).collect()
            }
            None => Vec::new(),
        };
        if !moved.is_empty() {
            self.queues
                .entry(request.to.clone())
                .or_default()
                .extend(moved.iter().cloned());
        }
        moved
    }
}
