//! Agent registry data model.
//!
//! An [`AgentProfile`] is what the agent-lifecycle layer reports about a
//! worker: what it can do and how it has been performing. The engine only
//! reads profiles; live load is tracked separately in the coordinators.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::task::Task;

/// Unique identifier for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What an agent is able to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCapabilities {
    pub task_types: Vec<String>,
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
    pub domains: Vec<String>,
    pub tools: Vec<String>,
    pub memory_mb: u64,
    pub cpu_cores: u32,
    /// Relative execution speed, 1.0 is nominal.
    pub speed: f64,
    /// Probability the agent finishes what it starts, in [0, 1].
    pub reliability: f64,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            task_types: Vec::new(),
            languages: Vec::new(),
            frameworks: Vec::new(),
            domains: Vec::new(),
            tools: Vec::new(),
            memory_mb: 4096,
            cpu_cores: 2,
            speed: 1.0,
            reliability: 1.0,
        }
    }
}

impl AgentCapabilities {
    pub fn supports_type(&self, task_type: &str) -> bool {
        self.task_types.iter().any(|t| t == task_type)
    }
}

/// Rolling performance figures reported for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Fraction of tasks finished successfully, in [0, 1].
    pub success_rate: f64,
    /// CPU usage in percent (0-100).
    pub cpu_usage: f64,
    /// Memory usage in percent (0-100).
    pub memory_usage: f64,
    /// Tasks per minute.
    pub throughput: f64,
    /// Useful work fraction, in [0, 1].
    pub efficiency: f64,
    pub response_time_ms: f64,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            success_rate: 1.0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            throughput: 0.0,
            efficiency: 1.0,
            response_time_ms: 0.0,
        }
    }
}

/// An agent as seen by the scheduling layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub metrics: AgentMetrics,
}

impl AgentProfile {
    pub fn new(id: impl Into<AgentId>) -> Self {
        let id = id.into();
        Self {
            name: id.0.clone(),
            id,
            capabilities: AgentCapabilities::default(),
            priority: 0,
            metrics: AgentMetrics::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: AgentCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_task_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.task_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Check the hard requirements of a task against this agent.
    ///
    /// An agent that advertises no task types accepts any type.
    pub fn meets_hard_requirements(&self, task: &Task) -> bool {
        let caps = &self.capabilities;
        let reqs = &task.requirements;

        if !caps.task_types.is_empty() && !caps.supports_type(&task.task_type) {
            return false;
        }
        if !reqs.tools.iter().all(|tool| caps.tools.contains(tool)) {
            return false;
        }
        if let Some(memory) = reqs.min_memory_mb {
            if caps.memory_mb < memory {
                return false;
            }
        }
        if let Some(cores) = reqs.min_cpu_cores {
            if caps.cpu_cores < cores {
                return false;
            }
        }
        true
    }

    /// Learning score used to weight this agent's consensus votes.
    pub fn learning_score(&self) -> f64 {
        let experience = (self.metrics.tasks_completed as f64 / 100.0).min(1.0);
        0.7 * self.metrics.success_rate.clamp(0.0, 1.0) + 0.3 * experience
    }
}
