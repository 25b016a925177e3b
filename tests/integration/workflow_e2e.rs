//! End-to-end workflow tests.
//!
//! A task graph is submitted, agents pick up whatever is ready, and each
//! completion unlocks the next wave until the graph drains.

use taskmesh::core::task::{Task, TaskId, TaskStatus};
use taskmesh::Error;

use crate::fixtures::{
    agent, build_pipeline, engine, ids, sorted, specialist, submit_all, topics,
};

/// Test: Pipeline runs to completion
/// Given the build pipeline and two agents
/// When every assigned task is reported complete
/// Then each wave unlocks the next and the graph drains
#[tokio::test]
async fn test_pipeline_runs_to_completion() {
    let engine = engine();
    engine.register_agent(agent("alpha")).await;
    engine.register_agent(agent("beta")).await;
    submit_all(&engine, build_pipeline()).await;

    let mut finished: Vec<TaskId> = Vec::new();
    for _ in 0..10 {
        let decisions = engine.assign_ready().await;
        if decisions.is_empty() {
            break;
        }
        for decision in decisions {
            let agent_id = decision.selected_agent;
            while let Some(task_id) = engine.next_task_for(&agent_id).await {
                engine.report_completion(&task_id).await;
                finished.push(task_id);
            }
        }
    }

    assert_eq!(finished.len(), 5);
    let position = |id: &str| finished.iter().position(|t| t.as_str() == id).unwrap();
    assert!(position("fetch") < position("compile"));
    assert!(position("fetch") < position("lint"));
    assert!(position("compile") < position("test"));
    assert!(position("test") < position("package"));
    assert!(position("lint") < position("package"));

    let stats = engine.stats().await;
    assert_eq!(stats.live_tasks, 0);
    assert_eq!(stats.completed_tasks, 5);
    assert_eq!(stats.work_stealing.total_tasks, 0);
}

/// Test: Completion unlocks only fully satisfied dependents
/// Given package depends on test and lint
/// When only lint completes
/// Then package stays pending
#[tokio::test]
async fn test_join_waits_for_every_dependency() {
    let engine = engine();
    submit_all(&engine, build_pipeline()).await;

    assert_eq!(engine.ready_tasks().await, ids(&["fetch"]));
    let unlocked = engine.report_completion(&"fetch".into()).await;
    assert_eq!(sorted(unlocked), ids(&["compile", "lint"]));

    assert!(engine.report_completion(&"lint".into()).await.is_empty());
    assert_eq!(
        engine.task_status(&"package".into()).await,
        Some(TaskStatus::Pending)
    );

    engine.report_completion(&"compile".into()).await;
    let unlocked = engine.report_completion(&"test".into()).await;
    assert_eq!(unlocked, ids(&["package"]));
}

/// Test: Execution order respects dependencies
#[tokio::test]
async fn test_execution_order_lists_dependencies_first() {
    let engine = engine();
    submit_all(&engine, build_pipeline()).await;

    let order = engine.execution_order().await.unwrap();
    assert_eq!(order.len(), 5);
    let position = |id: &str| order.iter().position(|t| t.as_str() == id).unwrap();
    assert!(position("fetch") < position("compile"));
    assert!(position("test") < position("package"));
    assert!(position("lint") < position("package"));
}

/// Test: Invalid submissions leave the graph untouched
/// Given a task referencing an unknown dependency, a duplicate, and a
/// self-dependency
/// When each is submitted
/// Then each is rejected and no task is added
#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let engine = engine();
    engine.submit_task(Task::new("a")).await.unwrap();

    let err = engine
        .submit_task(Task::new("b").depends_on(["a", "ghost"]))
        .await
        .unwrap_err();
    match err {
        Error::Dependency { task, missing } => {
            assert_eq!(task, TaskId::from("b"));
            assert_eq!(missing, ids(&["ghost"]));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(matches!(
        engine.submit_task(Task::new("a")).await,
        Err(Error::DuplicateTask(_))
    ));
    assert!(matches!(
        engine.submit_task(Task::new("c").depends_on(["c"])).await,
        Err(Error::Cycle { .. })
    ));

    assert_eq!(engine.stats().await.live_tasks, 1);
}

/// Test: Typed tasks go to agents that handle their type
/// Given a review task, a coder and a reviewer
/// When the task is assigned
/// Then the reviewer gets it
#[tokio::test]
async fn test_typed_task_goes_to_matching_specialist() {
    let engine = engine();
    engine.register_agent(specialist("coder", &["coding"])).await;
    engine.register_agent(specialist("reviewer", &["review"])).await;
    engine
        .submit_task(Task::new("pr-42").with_type("review"))
        .await
        .unwrap();

    let decision = engine.assign_task(&"pr-42".into()).await.unwrap();
    assert_eq!(decision.selected_agent.as_str(), "reviewer");
    assert!(decision.alternatives.is_empty());
    assert_eq!(
        engine.task_status(&"pr-42".into()).await,
        Some(TaskStatus::Running)
    );
    assert_eq!(engine.queued_tasks(&"reviewer".into()).await, ids(&["pr-42"]));
}

/// Test: Unplaceable tasks stay ready
/// Given a deploy task and only coding agents
/// When ready work is assigned
/// Then nothing is placed and the task remains ready
#[tokio::test]
async fn test_unplaceable_task_stays_ready() {
    let engine = engine();
    engine.register_agent(specialist("coder", &["coding"])).await;
    engine
        .submit_task(Task::new("ship").with_type("deploy"))
        .await
        .unwrap();

    assert!(engine.assign_ready().await.is_empty());
    assert!(matches!(
        engine.assign_task(&"ship".into()).await,
        Err(Error::NoEligibleAgent { considered: 1, .. })
    ));
    assert_eq!(engine.ready_tasks().await, ids(&["ship"]));
}

/// Test: Pending tasks cannot be assigned
#[tokio::test]
async fn test_pending_task_cannot_be_assigned() {
    let engine = engine();
    engine.register_agent(agent("alpha")).await;
    submit_all(&engine, build_pipeline()).await;

    assert!(matches!(
        engine.assign_task(&"compile".into()).await,
        Err(Error::TaskNotReady(_))
    ));
    assert!(matches!(
        engine.assign_task(&"nope".into()).await,
        Err(Error::TaskNotFound(_))
    ));
}

/// Test: Agent departure hands its queue back
/// Given two tasks queued on an agent
/// When the agent unregisters
/// Then both tasks return to ready and can be placed elsewhere
#[tokio::test]
async fn test_unregistered_agent_returns_queued_work() {
    let engine = engine();
    engine.register_agent(agent("leaving")).await;
    submit_all(&engine, vec![Task::new("x"), Task::new("y")]).await;
    engine.assign_ready().await;
    assert_eq!(engine.queued_tasks(&"leaving".into()).await.len(), 2);

    let released = engine.unregister_agent(&"leaving".into()).await.unwrap();
    assert_eq!(sorted(released), ids(&["x", "y"]));
    assert_eq!(sorted(engine.ready_tasks().await), ids(&["x", "y"]));

    engine.register_agent(agent("staying")).await;
    let decisions = engine.assign_ready().await;
    assert_eq!(decisions.len(), 2);
    assert!(decisions
        .iter()
        .all(|d| d.selected_agent.as_str() == "staying"));
}

/// Test: Lifecycle events arrive in order
#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let engine = engine();
    let mut rx = engine.subscribe();
    engine.register_agent(agent("alpha")).await;
    submit_all(
        &engine,
        vec![Task::new("first"), Task::new("second").depends_on(["first"])],
    )
    .await;

    engine.assign_task(&"first".into()).await.unwrap();
    engine.report_completion(&"first".into()).await;

    assert_eq!(
        topics(&mut rx),
        vec!["task:ready", "task:assigned", "task:completed", "task:ready"]
    );
}
