use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::agent::AgentId;
use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Task {task} has missing dependencies: {}", join_ids(.missing))]
    Dependency { task: TaskId, missing: Vec<TaskId> },

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Dependency cycle detected: {}", format_cycles(.cycles))]
    Cycle { cycles: Vec<Vec<TaskId>> },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {0} is not ready to run")]
    TaskNotReady(TaskId),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Circuit breaker '{name}' is open{}", retry_hint(.next_attempt))]
    BreakerOpen {
        name: String,
        next_attempt: Option<DateTime<Utc>>,
    },

    #[error("No eligible agent for task {task} ({considered} candidates considered)")]
    NoEligibleAgent { task: TaskId, considered: usize },

    #[error("Consensus requires at least one participant")]
    NoParticipants,
}

pub type Result<T> = std::result::Result<T, Error>;

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_cycles(cycles: &[Vec<TaskId>]) -> String {
    cycles
        .iter()
        .map(|cycle| {
            let mut path: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
            // Close the loop so the report reads a -> b -> a
            if let Some(first) = cycle.first() {
                path.push(first.to_string());
            }
            path.join(" -> ")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub(crate) fn retry_hint(next_attempt: &Option<DateTime<Utc>>) -> String {
    match next_attempt {
        Some(at) => format!(", retry after {}", at.to_rfc3339()),
        None => String::new(),
    }
}
