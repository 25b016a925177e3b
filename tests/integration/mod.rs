//! Integration test suite for taskmesh.
//!
//! These tests drive a full [`CoordinationEngine`] the way an embedding
//! runtime would: submit a task graph, register agents, place and finish
//! work, and watch the events that come out the other end.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Dependency graphs run to completion
//! - `fault_isolation`: Failure cascades and circuit breakers
//! - `rebalancing`: Work stealing between agents
//! - `consensus_rounds`: Proposals decided by agent votes
//! - `configuration`: Loading engine settings from disk
//!
//! # CI Compatibility
//!
//! Agents and votes are simulated in-process; timing-sensitive tests run
//! on paused tokio time.
//!
//! [`CoordinationEngine`]: taskmesh::CoordinationEngine

mod fixtures;

mod configuration;
mod consensus_rounds;
mod fault_isolation;
mod rebalancing;
mod workflow_e2e;
