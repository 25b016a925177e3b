//! The coordination engine.
//!
//! [`CoordinationEngine`] ties the components together: tasks enter the
//! [`DependencyGraph`], ready tasks are placed on agents by the
//! [`LoadBalancer`] (skipping agents whose circuit breaker is open),
//! completions and failures flow back into the graph and the workload
//! trackers, and a [`StealTicker`] periodically rebalances queued work.
//!
//! Each component sits behind its own lock. Operations that need several
//! take them in the order graph, agents, stealing, balancer, queues, and
//! most release one before taking the next.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::{system_clock, SharedClock};
use crate::config::Config;
use crate::consensus::{
    AlgorithmKind, ConsensusEngine, ConsensusProposal, ConsensusResult, ProposalPayload,
    VoteSource,
};
use crate::core::agent::{AgentId, AgentProfile};
use crate::core::dag::DependencyGraph;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::balancer::{LoadBalancer, LoadBalancerStats, LoadBalancingDecision};
use crate::orchestration::breaker::{CallError, CircuitBreakerManager};
use crate::orchestration::events::{EngineEvent, EventBus, EventReceiver};
use crate::orchestration::stealing::{
    AgentQueues, AgentWorkload, StealRequest, WorkStealingCoordinator, WorkStealingStats,
};
use crate::orchestration::ticker::{StealTarget, StealTicker, TickerHandle};

/// Registered agents in registration order.
#[derive(Debug, Default)]
struct AgentRegistry {
    profiles: HashMap<AgentId, AgentProfile>,
    order: Vec<AgentId>,
}

impl AgentRegistry {
    fn upsert(&mut self, profile: AgentProfile) {
        if !self.profiles.contains_key(&profile.id) {
            self.order.push(profile.id.clone());
        }
        self.profiles.insert(profile.id.clone(), profile);
    }

    fn remove(&mut self, id: &AgentId) -> Option<AgentProfile> {
        self.order.retain(|a| a != id);
        self.profiles.remove(id)
    }

    fn list(&self) -> Vec<AgentProfile> {
        self.order
            .iter()
            .filter_map(|id| self.profiles.get(id))
            .cloned()
            .collect()
    }
}

/// How a task left its agent.
struct Finished {
    task_type: String,
    success: bool,
    duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub live_tasks: usize,
    pub completed_tasks: usize,
    pub ready_tasks: usize,
    pub failed_tasks: usize,
    pub agents: usize,
    pub work_stealing: WorkStealingStats,
    pub load_balancer: LoadBalancerStats,
}

struct EngineInner {
    config: Config,
    graph: RwLock<DependencyGraph>,
    agents: RwLock<AgentRegistry>,
    stealing: RwLock<WorkStealingCoordinator>,
    balancer: RwLock<LoadBalancer>,
    queues: Mutex<AgentQueues>,
    breakers: CircuitBreakerManager,
    consensus: ConsensusEngine,
    events: EventBus,
}

/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct CoordinationEngine {
    inner: Arc<EngineInner>,
}

impl CoordinationEngine {
    pub fn new(config: Config, votes: Arc<dyn VoteSource>) -> Self {
        Self::with_clock(config, votes, system_clock())
    }

    pub fn with_clock(config: Config, votes: Arc<dyn VoteSource>, clock: SharedClock) -> Self {
        let events = EventBus::default();
        let breakers =
            CircuitBreakerManager::with_clock(config.circuit_breaker.clone(), Arc::clone(&clock))
                .with_events(events.clone());
        let consensus = ConsensusEngine::with_clock(config.consensus.clone(), votes, clock)
            .with_events(events.clone());

        debug!("CoordinationEngine::new {:?}", config);
        Self {
            inner: Arc::new(EngineInner {
                graph: RwLock::new(DependencyGraph::new()),
                agents: RwLock::new(AgentRegistry::default()),
                stealing: RwLock::new(WorkStealingCoordinator::new(config.work_stealing.clone())),
                balancer: RwLock::new(LoadBalancer::new(config.load_balancer.clone())),
                queues: Mutex::new(AgentQueues::new()),
                breakers,
                consensus,
                events,
                config,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn breakers(&self) -> &CircuitBreakerManager {
        &self.inner.breakers
    }

    pub fn consensus(&self) -> &ConsensusEngine {
        &self.inner.consensus
    }

    // ========== Tasks ==========

    /// Add a task to the dependency graph.
    ///
    /// # Errors
    /// `Dependency` naming the missing ids, `DuplicateTask`, or `Cycle` for a
    /// self-dependency. The task is not added on error.
    pub async fn submit_task(&self, task: Task) -> Result<()> {
        let id = task.id.clone();
        let status = {
            let mut graph = self.inner.graph.write().await;
            graph.add_task(task)?;
            graph.status(&id)
        };
        info!("Task {} submitted ({:?})", id, status);
        if status == Some(TaskStatus::Ready) {
            self.inner.events.publish(EngineEvent::TaskReady { task_id: id });
        }
        Ok(())
    }

    pub async fn ready_tasks(&self) -> Vec<TaskId> {
        self.inner.graph.read().await.ready_tasks()
    }

    pub async fn task(&self, id: &TaskId) -> Option<Task> {
        self.inner.graph.read().await.get_task(id).cloned()
    }

    pub async fn task_status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.inner.graph.read().await.status(id)
    }

    /// Every live task ordered so dependencies come first.
    pub async fn execution_order(&self) -> Result<Vec<TaskId>> {
        self.inner.graph.read().await.sorted_or_cycle_error()
    }

    /// Record a finished task. Returns the dependents it unlocked.
    ///
    /// Only ready or running tasks can complete. Unknown tasks, tasks still
    /// waiting on dependencies and failed tasks yield an empty list.
    pub async fn report_completion(&self, task_id: &TaskId) -> Vec<TaskId> {
        let (task, unlocked) = {
            let mut graph = self.inner.graph.write().await;
            let Some(task) = graph.get_task(task_id).cloned() else {
                debug!("Completion of unknown task {} ignored", task_id);
                return Vec::new();
            };
            if !matches!(task.status, TaskStatus::Ready | TaskStatus::Running) {
                warn!("Completion of {} task {} ignored", task.status, task_id);
                return Vec::new();
            }
            let unlocked = graph.mark_completed(task_id);
            (task, unlocked)
        };

        if let Some(agent) = &task.assigned_agent {
            let finished = Finished {
                task_type: task.task_type.clone(),
                success: true,
                duration: elapsed(&task),
            };
            self.release_slot(agent, task_id, Some(finished)).await;
        }

        info!("Task {} completed, unlocked {}", task_id, unlocked.len());
        self.inner.events.publish(EngineEvent::TaskCompleted {
            task_id: task_id.clone(),
            unlocked: unlocked.clone(),
        });
        for id in &unlocked {
            self.inner
                .events
                .publish(EngineEvent::TaskReady { task_id: id.clone() });
        }
        unlocked
    }

    /// Fail a task and, transitively, everything depending on it.
    ///
    /// Returns the cascaded dependents (not `task_id` itself). Unknown and
    /// already failed tasks yield an empty list.
    pub async fn report_failure(&self, task_id: &TaskId, reason: &str) -> Vec<TaskId> {
        let (root, cascaded_tasks) = {
            let mut graph = self.inner.graph.write().await;
            let Some(root) = graph.get_task(task_id).cloned() else {
                debug!("Failure of unknown task {} ignored", task_id);
                return Vec::new();
            };
            if root.is_finished() {
                warn!("Failure of finished task {} ignored", task_id);
                return Vec::new();
            }
            let cascaded = graph.mark_failed_with(task_id, reason);
            let tasks: Vec<Task> = cascaded
                .iter()
                .filter_map(|id| graph.get_task(id).cloned())
                .collect();
            (root, tasks)
        };

        if let Some(agent) = &root.assigned_agent {
            let finished = Finished {
                task_type: root.task_type.clone(),
                success: false,
                duration: elapsed(&root),
            };
            self.release_slot(agent, task_id, Some(finished)).await;
        }
        for task in &cascaded_tasks {
            if let Some(agent) = &task.assigned_agent {
                self.release_slot(agent, &task.id, None).await;
            }
        }

        let cascaded: Vec<TaskId> = cascaded_tasks.into_iter().map(|t| t.id).collect();
        warn!(
            "Task {} failed ({}), {} dependents cascaded",
            task_id,
            reason,
            cascaded.len()
        );
        self.inner.events.publish(EngineEvent::TaskFailed {
            task_id: task_id.clone(),
            cascaded: cascaded.clone(),
        });
        cascaded
    }

    /// Give back the slot a task held on an agent and learn from the outcome.
    ///
    /// Agents that left the registry are not tracked again; only the task's
    /// queue entry is dropped.
    async fn release_slot(&self, agent: &AgentId, task_id: &TaskId, finished: Option<Finished>) {
        // Held throughout so the agent cannot unregister halfway.
        let mut agents = self.inner.agents.write().await;
        if !agents.profiles.contains_key(agent) {
            debug!("Agent {} left before task {} finished", agent, task_id);
            drop(agents);
            self.inner.queues.lock().await.remove(task_id);
            return;
        }
        if let Some(finished) = &finished {
            if let Some(profile) = agents.profiles.get_mut(agent) {
                let metrics = &mut profile.metrics;
                if finished.success {
                    metrics.tasks_completed += 1;
                } else {
                    metrics.tasks_failed += 1;
                }
                let total = metrics.tasks_completed + metrics.tasks_failed;
                metrics.success_rate = metrics.tasks_completed as f64 / total as f64;
            }
        }

        let workload = {
            let mut stealing = self.inner.stealing.write().await;
            stealing.decrement_task_count(agent, 1);
            if let Some(finished) = &finished {
                if finished.success {
                    stealing.record_task_duration(agent, finished.duration);
                }
            }
            stealing.workload(agent).cloned()
        };

        {
            let mut balancer = self.inner.balancer.write().await;
            if let Some(finished) = &finished {
                balancer.record_task_outcome(
                    agent,
                    &finished.task_type,
                    finished.success,
                    finished.duration,
                );
            }
            if let Some(workload) = &workload {
                balancer.update_load(workload);
            }
        }

        self.inner.queues.lock().await.remove(task_id);
    }

    // ========== Placement ==========

    /// Score `candidates` for `task` without recording anything.
    pub async fn select_agent(
        &self,
        task: &Task,
        candidates: &[AgentProfile],
    ) -> Result<LoadBalancingDecision> {
        self.inner
            .balancer
            .write()
            .await
            .select_agent(task, candidates)
    }

    /// Registered agents whose circuit breaker would accept a call now.
    pub async fn available_agents(&self) -> Vec<AgentProfile> {
        let agents = self.inner.agents.read().await.list();
        self.accepting(agents).await
    }

    async fn accepting(&self, agents: Vec<AgentProfile>) -> Vec<AgentProfile> {
        let mut available = Vec::with_capacity(agents.len());
        for agent in agents {
            let accepting = match self.inner.breakers.get(agent.id.as_str()).await {
                Some(breaker) => breaker.is_accepting().await,
                None => true,
            };
            if accepting {
                available.push(agent);
            } else {
                debug!("Skipping agent {}: breaker open", agent.id);
            }
        }
        available
    }

    /// Place a ready task on the best available agent and queue it there.
    ///
    /// # Errors
    /// `TaskNotFound`, `TaskNotReady`, or `NoEligibleAgent`.
    pub async fn assign_task(&self, task_id: &TaskId) -> Result<LoadBalancingDecision> {
        let mut graph = self.inner.graph.write().await;
        let task = graph
            .get_task(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        if !task.is_ready() {
            return Err(Error::TaskNotReady(task_id.clone()));
        }

        // The chosen agent stays registered until its queue holds the task.
        let registry = self.inner.agents.read().await;
        let candidates = self.accepting(registry.list()).await;
        let decision = self
            .inner
            .balancer
            .write()
            .await
            .select_agent(&task, &candidates)?;
        graph.mark_running(task_id, Some(decision.selected_agent.clone()))?;
        drop(graph);

        let agent = &decision.selected_agent;
        let workload = {
            let mut stealing = self.inner.stealing.write().await;
            stealing.increment_task_count(agent, 1);
            stealing.workload(agent).cloned()
        };
        if let Some(workload) = &workload {
            self.inner.balancer.write().await.update_load(workload);
        }
        self.inner
            .queues
            .lock()
            .await
            .enqueue(agent, task_id.clone());
        drop(registry);

        info!(
            "Task {} assigned to {} (score {:.3})",
            task_id, agent, decision.score
        );
        self.inner.events.publish(EngineEvent::TaskAssigned {
            task_id: task_id.clone(),
            agent_id: agent.clone(),
            score: decision.score,
        });
        Ok(decision)
    }

    /// Assign every ready task that can be placed. Tasks with no eligible
    /// agent stay ready.
    pub async fn assign_ready(&self) -> Vec<LoadBalancingDecision> {
        let mut decisions = Vec::new();
        for task_id in self.ready_tasks().await {
            match self.assign_task(&task_id).await {
                Ok(decision) => decisions.push(decision),
                Err(e) => debug!("Task {} left unassigned: {}", task_id, e),
            }
        }
        decisions
    }

    /// Take the oldest task queued on `agent`; once taken it can no longer
    /// be stolen.
    pub async fn next_task_for(&self, agent: &AgentId) -> Option<TaskId> {
        self.inner.queues.lock().await.next_for(agent)
    }

    pub async fn queued_tasks(&self, agent: &AgentId) -> Vec<TaskId> {
        self.inner.queues.lock().await.queued(agent)
    }

    /// Run `op` behind the circuit breaker called `name`.
    pub async fn protected_call<F, Fut, T, E>(
        &self,
        name: &str,
        op: F,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.inner.breakers.execute(name, op).await
    }

    // ========== Agents ==========

    /// Add or update an agent. Its reported cpu and memory usage seed the
    /// workload trackers.
    pub async fn register_agent(&self, profile: AgentProfile) {
        let id = profile.id.clone();
        let (cpu, memory) = (profile.metrics.cpu_usage, profile.metrics.memory_usage);
        let mut agents = self.inner.agents.write().await;
        agents.upsert(profile);
        let workload = {
            let mut stealing = self.inner.stealing.write().await;
            stealing.update_workload(&id, cpu, memory);
            stealing.workload(&id).cloned()
        };
        if let Some(workload) = &workload {
            self.inner.balancer.write().await.update_load(workload);
        }
        drop(agents);
        info!("Agent {} registered", id);
    }

    /// Remove an agent. Tasks still queued on it return to the ready set
    /// and are returned.
    pub async fn unregister_agent(&self, id: &AgentId) -> Result<Vec<TaskId>> {
        self.inner
            .agents
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::AgentNotFound(id.clone()))?;
        self.inner.stealing.write().await.unregister_agent(id);
        self.inner.balancer.write().await.forget_agent(id);
        let orphaned = self.inner.queues.lock().await.drop_agent(id);

        let mut released = Vec::new();
        {
            let mut graph = self.inner.graph.write().await;
            for task_id in &orphaned {
                if graph.release(task_id).unwrap_or(false) {
                    released.push(task_id.clone());
                }
            }
        }
        for task_id in &released {
            self.inner.events.publish(EngineEvent::TaskReady {
                task_id: task_id.clone(),
            });
        }

        info!("Agent {} unregistered, {} tasks released", id, released.len());
        Ok(released)
    }

    pub async fn agents(&self) -> Vec<AgentProfile> {
        self.inner.agents.read().await.list()
    }

    /// Record fresh cpu/memory telemetry for an agent.
    pub async fn update_agent_telemetry(
        &self,
        id: &AgentId,
        cpu_usage: f64,
        memory_usage: f64,
    ) -> Result<()> {
        let mut agents = self.inner.agents.write().await;
        let profile = agents
            .profiles
            .get_mut(id)
            .ok_or_else(|| Error::AgentNotFound(id.clone()))?;
        profile.metrics.cpu_usage = cpu_usage;
        profile.metrics.memory_usage = memory_usage;
        let workload = {
            let mut stealing = self.inner.stealing.write().await;
            stealing.update_workload(id, cpu_usage, memory_usage);
            stealing.workload(id).cloned()
        };
        if let Some(workload) = &workload {
            self.inner.balancer.write().await.update_load(workload);
        }
        Ok(())
    }

    pub async fn workload(&self, id: &AgentId) -> Option<AgentWorkload> {
        self.inner.stealing.read().await.workload(id).cloned()
    }

    // ========== Work stealing ==========

    /// Run one steal check and move queued tasks if it fires.
    ///
    /// Agents are compared by the tasks still waiting in their queues;
    /// started tasks are never stolen and do not count.
    pub async fn rebalance(&self) -> Option<StealRequest> {
        // Graph and registry are held so neither side of the move can
        // unregister while its queue changes.
        let mut graph = self.inner.graph.write().await;
        let _registry = self.inner.agents.read().await;
        let (request, moved, workloads) = {
            let mut stealing = self.inner.stealing.write().await;
            let mut queues = self.inner.queues.lock().await;
            let request = stealing.check_and_steal_by(|w| queues.len(&w.agent_id))?;
            let moved = queues.apply_steal(&request);
            stealing.decrement_task_count(&request.from, moved.len());
            stealing.increment_task_count(&request.to, moved.len());
            let workloads: Vec<AgentWorkload> = [&request.from, &request.to]
                .into_iter()
                .filter_map(|id| stealing.workload(id).cloned())
                .collect();
            (request, moved, workloads)
        };
        for task_id in &moved {
            if let Err(e) = graph.reassign(task_id, request.to.clone()) {
                warn!("Could not reassign stolen task {}: {}", task_id, e);
            }
        }
        drop(graph);

        self.inner
            .events
            .publish(EngineEvent::WorkStealingRequest(request.clone()));
        if moved.is_empty() {
            debug!("Steal from {} found nothing queued", request.from);
            return Some(request);
        }

        {
            let mut balancer = self.inner.balancer.write().await;
            for workload in &workloads {
                balancer.update_load(workload);
            }
        }

        info!(
            "Moved {} tasks from {} to {}",
            moved.len(),
            request.from,
            request.to
        );
        Some(request)
    }

    /// Start the periodic steal check at the configured interval.
    pub fn spawn_steal_ticker(&self) -> TickerHandle {
        let interval = self.inner.config.work_stealing.steal_interval();
        StealTicker::new(Arc::new(self.clone()), interval).spawn()
    }

    // ========== Consensus ==========

    /// Put `payload` to a vote among all registered agents.
    pub async fn propose(&self, payload: ProposalPayload) -> Result<ConsensusResult> {
        let participants = self.agents().await;
        let proposal = self.inner.consensus.proposal(payload);
        self.inner.consensus.propose(proposal, &participants).await
    }

    pub async fn propose_with(
        &self,
        algorithm: AlgorithmKind,
        proposal: ConsensusProposal,
        participants: &[AgentProfile],
    ) -> Result<ConsensusResult> {
        self.inner
            .consensus
            .propose_with(algorithm, proposal, participants)
            .await
    }

    pub async fn stats(&self) -> EngineStats {
        let (live_tasks, completed_tasks, ready_tasks, failed_tasks) = {
            let graph = self.inner.graph.read().await;
            (
                graph.task_count(),
                graph.completed_count(),
                graph.ready_tasks().len(),
                graph.failed_tasks().len(),
            )
        };
        EngineStats {
            live_tasks,
            completed_tasks,
            ready_tasks,
            failed_tasks,
            agents: self.inner.agents.read().await.order.len(),
            work_stealing: self.inner.stealing.read().await.stats(),
            load_balancer: self.inner.balancer.read().await.stats(),
        }
    }
}

#[async_trait]
impl StealTarget for CoordinationEngine {
    async fn steal_tick(&self) -> Option<StealRequest> {
        self.rebalance().await
    }
}

fn elapsed(task: &Task) -> Duration {
    task.started_at
        .and_then(|started| (Utc::now() - started).to_std().ok())
        .unwrap_or_default()
}
