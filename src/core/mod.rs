//! Core domain models for task coordination.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: tasks, agent profiles and the dependency graph.

pub mod agent;
pub mod dag;
pub mod task;

pub use agent::{AgentCapabilities, AgentId, AgentMetrics, AgentProfile};
pub use dag::DependencyGraph;
pub use task::{CapabilityRequirements, Task, TaskId, TaskStatus};
