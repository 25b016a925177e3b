//! Task data model for the dependency graph.
//!
//! Tasks are the atomic units of work dispatched to agents. Each task
//! carries its dependency list, its capability requirements and its
//! lifecycle status.

use crate::core::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Ids are supplied by the submitting layer; [`TaskId::new`] generates
/// a UUID v4 based id for callers that have none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Return at most the first 8 characters for display.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task registered but at least one dependency is outstanding.
    Pending,
    /// All dependencies completed, ready to be dispatched.
    Ready,
    /// Task is currently being executed by an agent.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed, either directly or through a failed dependency.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Hard and soft capability requirements of a task.
///
/// Empty lists mean "no requirement". The load balancer filters on the
/// hard fields (`tools`, `min_memory_mb`, `min_cpu_cores`) and scores on
/// overlap for the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityRequirements {
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
    pub domains: Vec<String>,
    pub tools: Vec<String>,
    pub min_memory_mb: Option<u64>,
    pub min_cpu_cores: Option<u32>,
}

impl CapabilityRequirements {
    /// Number of soft checks the capability score is computed over.
    pub fn check_count(&self) -> usize {
        [
            !self.languages.is_empty(),
            !self.frameworks.is_empty(),
            !self.domains.is_empty(),
            !self.tools.is_empty(),
        ]
        .iter()
        .filter(|requested| **requested)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.check_count() == 0 && self.min_memory_mb.is_none() && self.min_cpu_cores.is_none()
    }
}

/// A single task in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable name for the task.
    pub name: String,
    /// Capability tag agents advertise in `task_types` (e.g. "coding").
    pub task_type: String,
    /// Scheduling priority, higher runs first.
    pub priority: u8,
    /// Ids of tasks that must complete before this one can run.
    pub dependencies: Vec<TaskId>,
    /// What an agent needs to be eligible for this task.
    pub requirements: CapabilityRequirements,
    /// Current execution status.
    pub status: TaskStatus,
    /// ID of the agent assigned to this task.
    pub assigned_agent: Option<AgentId>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task started execution.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task completed (success or failure).
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new task with the given id.
    ///
    /// The task is created with Pending status, the id doubling as its
    /// name, a "general" task type and no dependencies.
    pub fn new(id: impl Into<TaskId>) -> Self {
        let id = id.into();
        Self {
            name: id.0.clone(),
            id,
            task_type: "general".to_string(),
            priority: 0,
            dependencies: Vec::new(),
            requirements: CapabilityRequirements::default(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_type(mut self, task_type: &str) -> Self {
        self.task_type = task_type.to_string();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requirements(mut self, requirements: CapabilityRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Add dependencies, skipping ids already listed.
    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self
    }

    /// Start the task execution.
    pub fn start(&mut self, agent: Option<AgentId>) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        if agent.is_some() {
            self.assigned_agent = agent;
        }
    }

    /// Mark the task as successfully completed.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as failed with an error message.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as ready for execution.
    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Check if the task is in a terminal state (Completed or Failed).
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed { .. }
        )
    }

    pub fn is_ready(&self) -> bool {
        self.status == TaskStatus::Ready
    }
}
