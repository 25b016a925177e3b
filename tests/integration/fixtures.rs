//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building engines with simulated vote sources and clocks
//! - Agent profiles with common capability shapes
//! - Predefined task graphs

use chrono::{TimeZone, Utc};
use std::sync::Arc;

use taskmesh::clock::ManualClock;
use taskmesh::consensus::StaticVoteSource;
use taskmesh::core::agent::AgentProfile;
use taskmesh::core::task::{Task, TaskId};
use taskmesh::orchestration::{EngineEvent, EventReceiver};
use taskmesh::{Config, CoordinationEngine};

/// Engine with default configuration where every agent votes yes.
pub fn engine() -> CoordinationEngine {
    CoordinationEngine::new(Config::default(), Arc::new(StaticVoteSource::new()))
}

pub fn engine_with(config: Config, votes: StaticVoteSource) -> CoordinationEngine {
    CoordinationEngine::new(config, Arc::new(votes))
}

/// Engine on a manual clock, for breaker timeouts.
pub fn engine_with_clock(config: Config) -> (CoordinationEngine, Arc<ManualClock>) {
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let engine = CoordinationEngine::with_clock(
        config,
        Arc::new(StaticVoteSource::new()),
        clock.clone(),
    );
    (engine, clock)
}

/// A generalist agent.
pub fn agent(id: &str) -> AgentProfile {
    AgentProfile::new(id)
}

/// An agent restricted to the given task types.
pub fn specialist(id: &str, types: &[&str]) -> AgentProfile {
    AgentProfile::new(id).with_task_types(types.iter().copied())
}

pub fn ids(raw: &[&str]) -> Vec<TaskId> {
    raw.iter().map(|s| TaskId::from(*s)).collect()
}

/// Sort for order-insensitive comparisons.
pub fn sorted(mut ids: Vec<TaskId>) -> Vec<TaskId> {
    ids.sort();
    ids
}

/// Build pipeline:
///
/// ```text
/// fetch ──▶ compile ──▶ test ──▶ package
///      └──▶ lint ──────────────┘
/// ```
pub fn build_pipeline() -> Vec<Task> {
    vec![
        Task::new("fetch"),
        Task::new("compile").depends_on(["fetch"]),
        Task::new("lint").depends_on(["fetch"]),
        Task::new("test").depends_on(["compile"]),
        Task::new("package").depends_on(["test", "lint"]),
    ]
}

pub async fn submit_all(engine: &CoordinationEngine, tasks: Vec<Task>) {
    for task in tasks {
        engine.submit_task(task).await.unwrap();
    }
}

/// Event topics received so far, in order.
pub fn topics(rx: &mut EventReceiver) -> Vec<&'static str> {
    rx.drain().iter().map(EngineEvent::topic).collect()
}
