//! Consensus integration tests.
//!
//! Proposals go to the registered agents through a vote source and are
//! decided by each algorithm's rule plus the proposal's own threshold.

use async_trait::async_trait;
use std::time::Duration;

use taskmesh::consensus::{
    AlgorithmKind, ConsensusConfig, ConsensusProposal, ConsensusStatus, ProposalPayload,
    StaticVoteSource, Vote, VoteBehavior, VoteSource,
};
use taskmesh::core::agent::{AgentId, AgentMetrics, AgentProfile};
use taskmesh::{Config, CoordinationEngine, Error};

use crate::fixtures::{agent, engine, engine_with, topics};

fn plan(description: &str) -> ProposalPayload {
    ProposalPayload::Plan {
        description: description.to_string(),
    }
}

async fn register(engine: &CoordinationEngine, names: &[&str]) -> Vec<AgentProfile> {
    for name in names {
        engine.register_agent(agent(name)).await;
    }
    engine.agents().await
}

/// Votes against any conflict claim it is part of, for everything else.
struct SelflessVoter;

#[async_trait]
impl VoteSource for SelflessVoter {
    async fn request_vote(
        &self,
        agent: &AgentProfile,
        proposal: &ConsensusProposal,
    ) -> Option<Vote> {
        let decision = match &proposal.payload {
            ProposalPayload::ResourceConflict { claimants, .. } => !claimants.contains(&agent.id),
            _ => true,
        };
        Some(Vote::new(agent.id.clone(), decision, 0.9))
    }

    async fn request_leader_vote(
        &self,
        _voter: &AgentProfile,
        _candidate: &AgentId,
        _term: u64,
    ) -> bool {
        true
    }
}

/// Test: Default round among registered agents
/// Given three cooperative agents
/// When a plan is proposed
/// Then Raft reaches consensus and the result is kept in history
#[tokio::test]
async fn test_default_round_reaches_consensus() {
    let engine = engine();
    register(&engine, &["a", "b", "c"]).await;
    let mut rx = engine.subscribe();

    let result = engine.propose(plan("ship v2")).await.unwrap();

    assert_eq!(result.algorithm, AlgorithmKind::Raft);
    assert_eq!(result.status, ConsensusStatus::Reached);
    assert_eq!(result.votes.len(), 3);
    assert_eq!(result.participation, 1.0);
    assert_eq!(
        topics(&mut rx),
        vec!["consensus:proposal-created", "consensus:result"]
    );

    let history = engine.consensus().history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(
        engine.consensus().result(result.proposal_id).await.unwrap(),
        result
    );
}

/// Test: Proposing with nobody registered fails
#[tokio::test]
async fn test_propose_without_agents_fails() {
    let engine = engine();
    assert!(matches!(
        engine.propose(plan("alone")).await,
        Err(Error::NoParticipants)
    ));
}

/// Test: Byzantine round tolerates one dissenter in four
/// Given four agents of which one votes no
/// When decided with the Byzantine rule
/// Then three honest yes votes meet the 2n/3+1 quorum
#[tokio::test]
async fn test_byzantine_tolerates_single_dissenter() {
    let votes = StaticVoteSource::new().with_vote("d", false, 1.0);
    let engine = engine_with(Config::default(), votes);
    let agents = register(&engine, &["a", "b", "c", "d"]).await;

    let proposal = engine.consensus().proposal(plan("rotate keys"));
    let result = engine
        .propose_with(AlgorithmKind::Byzantine, proposal, &agents)
        .await
        .unwrap();

    assert!(result.is_reached());
    assert_eq!(result.achieved_ratio, 0.75);
}

/// Test: Byzantine round fails with two dissenters in four
#[tokio::test]
async fn test_byzantine_rejects_with_two_dissenters() {
    let votes = StaticVoteSource::new()
        .with_vote("c", false, 1.0)
        .with_vote("d", false, 1.0);
    let engine = engine_with(Config::default(), votes);
    let agents = register(&engine, &["a", "b", "c", "d"]).await;

    let proposal = engine.consensus().proposal(plan("rotate keys"));
    let result = engine
        .propose_with(AlgorithmKind::Byzantine, proposal, &agents)
        .await
        .unwrap();

    assert_eq!(result.status, ConsensusStatus::Rejected);
    assert!(!result.outcome);
}

/// Test: Proposal threshold applies on top of the algorithm's rule
/// Given a Byzantine quorum that passes at 0.75
/// When the proposal demands 0.9
/// Then it is rejected
#[tokio::test]
async fn test_proposal_threshold_is_enforced() {
    let votes = StaticVoteSource::new().with_vote("d", false, 1.0);
    let engine = engine_with(Config::default(), votes);
    let agents = register(&engine, &["a", "b", "c", "d"]).await;

    let mut proposal = engine.consensus().proposal(plan("strict"));
    proposal.required_threshold = 0.9;
    let result = engine
        .propose_with(AlgorithmKind::Byzantine, proposal, &agents)
        .await
        .unwrap();
    assert_eq!(result.status, ConsensusStatus::Rejected);
    assert_eq!(result.required_threshold, 0.9);

    let mut proposal = engine.consensus().proposal(plan("impossible"));
    proposal.required_threshold = 1.5;
    assert!(matches!(
        engine
            .propose_with(AlgorithmKind::Byzantine, proposal, &agents)
            .await,
        Err(Error::InvalidConfig(_))
    ));
}

/// Test: Slow voters miss the deadline
/// Given two of four agents answering after the deadline
/// When decided with the Byzantine rule
/// Then only the two early votes count and the proposal times out
#[tokio::test(start_paused = true)]
async fn test_slow_voters_time_out() {
    let slow = VoteBehavior::Delayed {
        after: Duration::from_secs(5),
        decision: true,
        confidence: 1.0,
    };
    let votes = StaticVoteSource::new()
        .with_behavior("c", slow.clone())
        .with_behavior("d", slow);
    let config = Config {
        consensus: ConsensusConfig {
            default_timeout_ms: 1_000,
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = engine_with(config, votes);
    let agents = register(&engine, &["a", "b", "c", "d"]).await;

    let proposal = engine.consensus().proposal(plan("hurry"));
    let result = engine
        .propose_with(AlgorithmKind::Byzantine, proposal, &agents)
        .await
        .unwrap();

    assert_eq!(result.status, ConsensusStatus::TimedOut);
    assert_eq!(result.votes.len(), 2);
    assert_eq!(result.participation, 0.5);
}

/// Test: Votes gathered before the deadline can still carry a decision
#[tokio::test(start_paused = true)]
async fn test_partial_votes_can_still_reach_consensus() {
    let votes = StaticVoteSource::new().with_behavior(
        "d",
        VoteBehavior::Delayed {
            after: Duration::from_secs(60),
            decision: false,
            confidence: 1.0,
        },
    );
    let config = Config {
        consensus: ConsensusConfig {
            default_timeout_ms: 1_000,
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = engine_with(config, votes);
    let agents = register(&engine, &["a", "b", "c", "d"]).await;

    let proposal = engine.consensus().proposal(plan("good enough"));
    let result = engine
        .propose_with(AlgorithmKind::Byzantine, proposal, &agents)
        .await
        .unwrap();

    assert_eq!(result.status, ConsensusStatus::Reached);
    assert_eq!(result.votes.len(), 3);
}

/// Test: Proof of learning favours experienced agents
/// Given one veteran voting yes and two novices voting no
/// When decided with proof of learning
/// Then the veteran's weight carries the proposal
#[tokio::test]
async fn test_learning_weights_experience() {
    let votes = StaticVoteSource::new()
        .with_vote("novice-1", false, 1.0)
        .with_vote("novice-2", false, 1.0);
    let engine = engine_with(Config::default(), votes);
    let novice = AgentMetrics {
        success_rate: 0.2,
        tasks_completed: 0,
        ..Default::default()
    };
    engine
        .register_agent(AgentProfile::new("veteran").with_metrics(AgentMetrics {
            success_rate: 1.0,
            tasks_completed: 200,
            ..Default::default()
        }))
        .await;
    engine
        .register_agent(AgentProfile::new("novice-1").with_metrics(novice.clone()))
        .await;
    engine
        .register_agent(AgentProfile::new("novice-2").with_metrics(novice))
        .await;
    let agents = engine.agents().await;

    let proposal = engine.consensus().proposal(plan("refactor"));
    let result = engine
        .propose_with(AlgorithmKind::ProofOfLearning, proposal, &agents)
        .await
        .unwrap();
    assert!(result.is_reached());

    // Equal weights: one yes against two no fails.
    let plain = engine_with(
        Config::default(),
        StaticVoteSource::new()
            .with_vote("b", false, 1.0)
            .with_vote("c", false, 1.0),
    );
    let agents = register(&plain, &["a", "b", "c"]).await;
    let proposal = plain.consensus().proposal(plan("refactor"));
    let result = plain
        .propose_with(AlgorithmKind::ProofOfLearning, proposal, &agents)
        .await
        .unwrap();
    assert!(!result.is_reached());
}

/// Test: Gossip reaches a cooperative swarm
#[tokio::test]
async fn test_gossip_round_reaches_whole_swarm() {
    let engine = engine();
    let names: Vec<String> = (0..12).map(|i| format!("node-{}", i)).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let agents = register(&engine, &names).await;

    let proposal = engine.consensus().proposal(plan("spread"));
    let result = engine
        .propose_with(AlgorithmKind::Gossip, proposal, &agents)
        .await
        .unwrap();

    assert!(result.is_reached());
    assert_eq!(result.votes.len(), 12);
}

/// Test: Changing the default algorithm
#[tokio::test]
async fn test_default_algorithm_can_be_changed() {
    let engine = engine();
    register(&engine, &["a", "b", "c", "d"]).await;

    engine
        .consensus()
        .set_default_algorithm(AlgorithmKind::Byzantine)
        .await;
    let result = engine.propose(plan("switch")).await.unwrap();
    assert_eq!(result.algorithm, AlgorithmKind::Byzantine);
}

/// Test: Resource conflicts decided by uninvolved agents
/// Given two claimants and three bystanders with a custom vote source
/// When the conflict is proposed
/// Then the claimants abstain by voting no and the bystanders carry it
#[tokio::test]
async fn test_custom_vote_source_decides_resource_conflict() {
    let engine = CoordinationEngine::new(Config::default(), std::sync::Arc::new(SelflessVoter));
    let agents = register(&engine, &["x", "y", "p", "q", "r"]).await;

    let payload = ProposalPayload::ResourceConflict {
        resource: "gpu-0".to_string(),
        claimants: vec![AgentId::from("x"), AgentId::from("y")],
    };
    let proposal = engine.consensus().proposal(payload);
    let result = engine
        .propose_with(AlgorithmKind::Raft, proposal, &agents)
        .await
        .unwrap();

    let no_votes: Vec<&str> = result
        .votes
        .iter()
        .filter(|v| !v.decision)
        .map(|v| v.agent_id.as_str())
        .collect();
    assert_eq!(no_votes.len(), 2);
    assert!(no_votes.contains(&"x") && no_votes.contains(&"y"));
    assert!(result.is_reached());
    assert!((result.achieved_ratio - 0.6).abs() < 1e-9);
}
