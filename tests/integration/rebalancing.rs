//! Work stealing integration tests.
//!
//! Work is piled onto one agent, a second agent joins, and the engine
//! moves queued tasks across until the two are within the steal threshold.

use std::time::Duration;

use taskmesh::consensus::StaticVoteSource;
use taskmesh::core::agent::AgentId;
use taskmesh::core::task::Task;
use taskmesh::orchestration::WorkStealingConfig;
use taskmesh::{Config, CoordinationEngine};

use crate::fixtures::{agent, engine, engine_with, ids};

/// Queue `n` tasks on a lone agent called "busy", then register "idle".
async fn pile_onto_busy(engine: &CoordinationEngine, n: usize) -> (AgentId, AgentId) {
    engine.register_agent(agent("busy")).await;
    for i in 0..n {
        let task_id = format!("job-{}", i);
        engine.submit_task(Task::new(task_id.as_str())).await.unwrap();
        engine.assign_task(&task_id.as_str().into()).await.unwrap();
    }
    engine.register_agent(agent("idle")).await;
    (AgentId::from("busy"), AgentId::from("idle"))
}

/// Test: Stolen work completes on its new agent
/// Given six tasks queued on busy
/// When idle steals and finishes one
/// Then idle's slot is released, not busy's
#[tokio::test]
async fn test_stolen_work_completes_on_new_agent() {
    let engine = engine();
    let (busy, idle) = pile_onto_busy(&engine, 6).await;

    let request = engine.rebalance().await.unwrap();
    assert_eq!(request.count, 3);

    let task_id = engine.next_task_for(&idle).await.unwrap();
    assert_eq!(task_id.as_str(), "job-0");
    engine.report_completion(&task_id).await;

    assert_eq!(engine.workload(&idle).await.unwrap().task_count, 2);
    assert_eq!(engine.workload(&busy).await.unwrap().task_count, 3);
    let idle_profile = engine
        .agents()
        .await
        .into_iter()
        .find(|a| a.id == idle)
        .unwrap();
    assert_eq!(idle_profile.metrics.tasks_completed, 1);
}

/// Test: Started tasks stay with their agent
/// Given ten tasks on busy of which four were already taken
/// When a steal fires
/// Then it is sized by the six still queued and only those move
#[tokio::test]
async fn test_started_tasks_are_not_stolen() {
    let engine = engine();
    let (busy, idle) = pile_onto_busy(&engine, 10).await;
    for _ in 0..4 {
        engine.next_task_for(&busy).await.unwrap();
    }

    let request = engine.rebalance().await.unwrap();
    assert_eq!(request.count, 3);
    assert_eq!(engine.queued_tasks(&idle).await, ids(&["job-4", "job-5", "job-6"]));
    assert_eq!(engine.queued_tasks(&busy).await, ids(&["job-7", "job-8", "job-9"]));
    assert_eq!(engine.workload(&busy).await.unwrap().task_count, 7);
    assert_eq!(engine.workload(&idle).await.unwrap().task_count, 3);
}

/// Test: Running work alone never triggers a steal
/// Given five tasks on busy, all but one already started
/// When the engine rebalances
/// Then nothing moves because only one task is waiting
#[tokio::test]
async fn test_running_tasks_do_not_trigger_steal() {
    let engine = engine();
    let (busy, idle) = pile_onto_busy(&engine, 5).await;
    for _ in 0..4 {
        engine.next_task_for(&busy).await.unwrap();
    }

    assert!(engine.rebalance().await.is_none());
    assert_eq!(engine.queued_tasks(&busy).await, ids(&["job-4"]));
    assert!(engine.queued_tasks(&idle).await.is_empty());
}

/// Test: Small imbalances are left alone
#[tokio::test]
async fn test_imbalance_below_threshold_is_ignored() {
    let engine = engine();
    pile_onto_busy(&engine, 2).await;

    assert!(engine.rebalance().await.is_none());
    assert_eq!(engine.stats().await.work_stealing.steals_emitted, 0);
}

/// Test: Disabled stealing never fires
#[tokio::test]
async fn test_disabled_stealing_never_fires() {
    let config = Config {
        work_stealing: WorkStealingConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = engine_with(config, StaticVoteSource::new());
    pile_onto_busy(&engine, 8).await;

    assert!(engine.rebalance().await.is_none());
}

/// Test: Background ticker balances while agents work
/// Given eight tasks on busy and the steal ticker running
/// When one steal interval passes and both agents drain their queues
/// Then each agent ran half of the work and nothing is left
#[tokio::test(start_paused = true)]
async fn test_background_ticker_balances_while_agents_work() {
    let engine = engine();
    let (busy, idle) = pile_onto_busy(&engine, 8).await;

    let ticker = engine.spawn_steal_ticker();
    tokio::time::sleep(Duration::from_millis(5_100)).await;

    let mut handled = Vec::new();
    for agent_id in [&busy, &idle] {
        let mut count = 0;
        while let Some(task_id) = engine.next_task_for(agent_id).await {
            engine.report_completion(&task_id).await;
            count += 1;
        }
        handled.push(count);
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    let report = ticker.shutdown().await;

    assert_eq!(handled, vec![4, 4]);
    assert_eq!(report.steals, 1);
    assert!(report.ticks >= 2);

    let stats = engine.stats().await;
    assert_eq!(stats.completed_tasks, 8);
    assert_eq!(stats.work_stealing.total_tasks, 0);
}
