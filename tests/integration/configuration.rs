//! Configuration integration tests.
//!
//! Settings written to a TOML file must reach every component of an
//! engine built from it.

use std::fs;

use taskmesh::consensus::{AlgorithmKind, ProposalPayload, StaticVoteSource};
use taskmesh::core::task::Task;
use taskmesh::orchestration::{BreakerState, CallError, Strategy};
use taskmesh::{Config, Error};

use crate::fixtures::{agent, engine_with};

const TUNED: &str = r#"
[work_stealing]
steal_threshold = 2
max_steal_batch = 1

[load_balancer]
strategy = "load-based"

[circuit_breaker]
failure_threshold = 2

[consensus]
default_algorithm = "byzantine"
"#;

/// Test: Engine built from a config file honours it
/// Given a TOML file tuning every component
/// When an engine is built from it
/// Then stealing, breakers and consensus follow the file
#[tokio::test]
async fn test_engine_follows_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskmesh.toml");
    fs::write(&path, TUNED).unwrap();

    let config = Config::load_from(&path).unwrap();
    assert_eq!(config.load_balancer.strategy, Strategy::LoadBased);
    let engine = engine_with(config, StaticVoteSource::new());

    // Two failures open the breaker.
    for _ in 0..2 {
        let _: Result<(), CallError<&str>> = engine
            .protected_call("svc", || async { Err("down") })
            .await;
    }
    let breaker = engine.breakers().get("svc").await.unwrap();
    assert_eq!(breaker.state().await, BreakerState::Open);

    // An imbalance of two triggers a single-task steal.
    engine.register_agent(agent("busy")).await;
    for name in ["a", "b"] {
        engine.submit_task(Task::new(name)).await.unwrap();
        engine.assign_task(&name.into()).await.unwrap();
    }
    engine.register_agent(agent("idle")).await;
    let request = engine.rebalance().await.unwrap();
    assert_eq!(request.count, 1);

    let result = engine
        .propose(ProposalPayload::Plan {
            description: "tuned".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(result.algorithm, AlgorithmKind::Byzantine);
}

/// Test: Saved configuration loads back unchanged
#[test]
fn test_saved_config_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conf").join("taskmesh.toml");

    let config = Config::from_toml_str(TUNED).unwrap();
    config.save_to(&path).unwrap();

    assert_eq!(Config::load_from(&path).unwrap(), config);
}

/// Test: Invalid files are rejected with the offending key
#[test]
fn test_invalid_config_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskmesh.toml");
    fs::write(&path, "[load_balancer]\nmax_tasks_per_agent = 0\n").unwrap();

    match Config::load_from(&path) {
        Err(Error::InvalidConfig(message)) => assert!(message.contains("max_tasks_per_agent")),
        other => panic!("unexpected result: {other:?}"),
    }
}
