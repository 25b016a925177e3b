//! Swarm-wide decisions.
//!
//! A [`ConsensusEngine`] takes a [`ConsensusProposal`] and a set of
//! participating agents, collects their votes through a [`VoteSource`] and
//! decides with one of several interchangeable [`ConsensusAlgorithm`]s:
//!
//! - [`RaftConsensus`]: leader-coordinated majority vote.
//! - [`ByzantineConsensus`]: `2n/3 + 1` confident positive votes.
//! - [`GossipConsensus`]: fan-out propagation with a participation floor.
//! - [`LearningConsensus`]: votes weighted by each agent's track record.

pub mod algorithm;
pub mod byzantine;
pub mod engine;
pub mod gossip;
pub mod learning;
pub mod proposal;
pub mod raft;
pub mod votes;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use algorithm::{aggregate_votes, ConsensusAlgorithm, Tally};
pub use byzantine::ByzantineConsensus;
pub use engine::ConsensusEngine;
pub use gossip::GossipConsensus;
pub use learning::LearningConsensus;
pub use proposal::{
    ConsensusProposal, ConsensusResult, ConsensusStatus, ProposalId, ProposalPayload, Vote,
};
pub use raft::RaftConsensus;
pub use votes::{StaticVoteSource, VoteBehavior, VoteSource};

/// Confidence above which a vote counts as confident (or "honest").
pub const CONFIDENCE_FLOOR: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    Raft,
    Byzantine,
    Gossip,
    ProofOfLearning,
}

impl AlgorithmKind {
    pub const ALL: [AlgorithmKind; 4] = [
        AlgorithmKind::Raft,
        AlgorithmKind::Byzantine,
        AlgorithmKind::Gossip,
        AlgorithmKind::ProofOfLearning,
    ];
}

impl std::fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AlgorithmKind::Raft => "raft",
            AlgorithmKind::Byzantine => "byzantine",
            AlgorithmKind::Gossip => "gossip",
            AlgorithmKind::ProofOfLearning => "proof_of_learning",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub default_algorithm: AlgorithmKind,
    /// Required ratio for proposals that do not set their own.
    pub default_threshold: f64,
    /// Vote collection deadline, in milliseconds.
    pub default_timeout_ms: u64,
    /// Raft leader election attempts before giving up.
    pub election_max_attempts: u32,
    pub election_backoff_min_ms: u64,
    pub election_backoff_max_ms: u64,
    /// Peers each gossiping agent forwards a proposal to per round.
    pub gossip_fanout: usize,
    pub gossip_max_rounds: usize,
    /// Decided results kept in memory.
    pub history_limit: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            default_algorithm: AlgorithmKind::Raft,
            default_threshold: 0.5,
            default_timeout_ms: 30_000,
            election_max_attempts: 3,
            election_backoff_min_ms: 50,
            election_backoff_max_ms: 300,
            gossip_fanout: 3,
            gossip_max_rounds: 10,
            history_limit: 100,
        }
    }
}

impl ConsensusConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
