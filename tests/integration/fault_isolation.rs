//! Failure cascade and circuit breaker integration tests.
//!
//! A failing task takes its dependents down with it; a failing agent is
//! fenced off by its breaker until the cool-down passes.

use std::time::Duration;

use taskmesh::core::task::{Task, TaskId, TaskStatus};
use taskmesh::orchestration::{BreakerState, CallError, EngineEvent};
use taskmesh::{Config, Error};

use crate::fixtures::{agent, build_pipeline, engine, engine_with_clock, ids, sorted, submit_all};

async fn fail_through(engine: &taskmesh::CoordinationEngine, name: &str, times: usize) {
    for _ in 0..times {
        let result: Result<(), CallError<String>> = engine
            .protected_call(name, || async { Err("agent crashed".to_string()) })
            .await;
        assert!(matches!(result, Err(CallError::Inner(_))));
    }
}

/// Test: Failure cascades through the pipeline
/// Given the build pipeline with fetch completed
/// When compile fails
/// Then test and package fail with it while lint is untouched
#[tokio::test]
async fn test_failure_cascades_to_transitive_dependents() {
    let engine = engine();
    let mut rx = engine.subscribe();
    submit_all(&engine, build_pipeline()).await;
    engine.report_completion(&"fetch".into()).await;

    let cascaded = engine.report_failure(&"compile".into(), "linker error").await;
    assert_eq!(sorted(cascaded.clone()), ids(&["package", "test"]));

    match engine.task_status(&"compile".into()).await {
        Some(TaskStatus::Failed { error }) => assert_eq!(error, "linker error"),
        other => panic!("unexpected status: {other:?}"),
    }
    match engine.task_status(&"package".into()).await {
        Some(TaskStatus::Failed { error }) => assert!(error.contains("compile")),
        other => panic!("unexpected status: {other:?}"),
    }
    assert_eq!(engine.ready_tasks().await, ids(&["lint"]));

    // Completing lint no longer unlocks package.
    assert!(engine.report_completion(&"lint".into()).await.is_empty());

    let failed: Vec<_> = rx
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::TaskFailed { task_id, cascaded } => Some((task_id, cascaded)),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![(TaskId::from("compile"), cascaded)]);
}

/// Test: Failing a task frees its agent
/// Given a task running on an agent
/// When the task fails
/// Then the agent's load and success rate reflect it
#[tokio::test]
async fn test_failure_releases_agent_slot() {
    let engine = engine();
    engine.register_agent(agent("alpha")).await;
    engine.submit_task(Task::new("flaky")).await.unwrap();
    engine.assign_task(&"flaky".into()).await.unwrap();
    assert_eq!(engine.workload(&"alpha".into()).await.unwrap().task_count, 1);

    engine.report_failure(&"flaky".into(), "boom").await;

    assert_eq!(engine.workload(&"alpha".into()).await.unwrap().task_count, 0);
    assert!(engine.queued_tasks(&"alpha".into()).await.is_empty());
    let alpha = engine.agents().await.remove(0);
    assert_eq!(alpha.metrics.tasks_failed, 1);
    assert_eq!(alpha.metrics.success_rate, 0.0);
}

/// Test: Tasks depending on failed work are rejected
#[tokio::test]
async fn test_dependency_on_failed_task_fails_immediately() {
    let engine = engine();
    engine.submit_task(Task::new("root")).await.unwrap();
    engine.report_failure(&"root".into(), "nope").await;

    engine
        .submit_task(Task::new("late").depends_on(["root"]))
        .await
        .unwrap();
    assert!(matches!(
        engine.task_status(&"late".into()).await,
        Some(TaskStatus::Failed { .. })
    ));
    assert!(engine.ready_tasks().await.is_empty());
}

/// Test: Open breaker fences off an agent
/// Given two agents where alpha's calls keep failing
/// When alpha's breaker opens
/// Then new work is placed on beta and alpha's calls are rejected unrun
#[tokio::test]
async fn test_open_breaker_fences_off_agent() {
    let (engine, _clock) = engine_with_clock(Config::default());
    engine.register_agent(agent("alpha")).await;
    engine.register_agent(agent("beta")).await;

    fail_through(&engine, "alpha", 5).await;
    let breaker = engine.breakers().get("alpha").await.unwrap();
    assert_eq!(breaker.state().await, BreakerState::Open);

    let available: Vec<String> = engine
        .available_agents()
        .await
        .into_iter()
        .map(|a| a.id.to_string())
        .collect();
    assert_eq!(available, vec!["beta".to_string()]);

    engine.submit_task(Task::new("job")).await.unwrap();
    let decision = engine.assign_task(&"job".into()).await.unwrap();
    assert_eq!(decision.selected_agent.as_str(), "beta");

    let mut ran = false;
    let result: Result<(), CallError<String>> = engine
        .protected_call("alpha", || {
            ran = true;
            async { Ok(()) }
        })
        .await;
    assert!(result.unwrap_err().is_open());
    assert!(!ran);

    let err: Error = engine
        .protected_call("alpha", || async { Ok::<(), Error>(()) })
        .await
        .unwrap_err()
        .into();
    assert!(matches!(err, Error::BreakerOpen { .. }));
}

/// Test: Breaker recovers after the cool-down
/// Given an open breaker
/// When the timeout elapses and two trial calls succeed
/// Then the breaker closes and the agent is placeable again
#[tokio::test]
async fn test_breaker_recovers_after_cooldown() {
    let (engine, clock) = engine_with_clock(Config::default());
    let mut rx = engine.subscribe();
    engine.register_agent(agent("alpha")).await;

    fail_through(&engine, "alpha", 5).await;
    assert!(engine.available_agents().await.is_empty());

    clock.advance(Duration::from_secs(59));
    assert!(engine.available_agents().await.is_empty());
    clock.advance(Duration::from_secs(1));
    assert_eq!(engine.available_agents().await.len(), 1);

    for _ in 0..2 {
        let ok: Result<u8, CallError<String>> =
            engine.protected_call("alpha", || async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
    }
    let breaker = engine.breakers().get("alpha").await.unwrap();
    assert_eq!(breaker.state().await, BreakerState::Closed);

    let transitions: Vec<(BreakerState, BreakerState)> = rx
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::CircuitBreakerStateChange { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (BreakerState::Closed, BreakerState::Open),
            (BreakerState::Open, BreakerState::HalfOpen),
            (BreakerState::HalfOpen, BreakerState::Closed),
        ]
    );
}

/// Test: A failed trial call reopens the breaker
#[tokio::test]
async fn test_failed_trial_reopens_breaker() {
    let (engine, clock) = engine_with_clock(Config::default());
    fail_through(&engine, "db", 5).await;
    clock.advance(Duration::from_secs(60));

    fail_through(&engine, "db", 1).await;

    let stats = engine.breakers().stats().await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].state, BreakerState::Open);
    assert_eq!(stats[0].total_failures, 6);
    assert!(!engine.breakers().get("db").await.unwrap().is_accepting().await);
}
