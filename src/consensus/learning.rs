//! Merit-weighted voting.
//!
//! Each vote is weighted by the voter's confidence times its learning score,
//! `0.7 * success_rate + 0.3 * min(1, tasks_completed / 100)`. The proposal
//! passes when the weighted positive share exceeds 0.6.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::consensus::algorithm::{weighted_tally, ConsensusAlgorithm, Tally};
use crate::consensus::proposal::{ConsensusProposal, Vote};
use crate::consensus::votes::{gather_votes, VoteSource};
use crate::consensus::{AlgorithmKind, CONFIDENCE_FLOOR};
use crate::core::agent::{AgentId, AgentProfile};

#[derive(Debug, Default)]
pub struct LearningConsensus;

impl LearningConsensus {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConsensusAlgorithm for LearningConsensus {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::ProofOfLearning
    }

    fn tolerated_failures(&self, n: usize) -> usize {
        n.saturating_sub(1) / 2
    }

    async fn collect_votes(
        &self,
        proposal: &ConsensusProposal,
        participants: &[AgentProfile],
        source: &dyn VoteSource,
        votes: &mut Vec<Vote>,
    ) {
        let agents: Vec<&AgentProfile> = participants.iter().collect();
        gather_votes(source, proposal, &agents, votes).await;
    }

    fn aggregate(
        &self,
        _proposal: &ConsensusProposal,
        participants: &[AgentProfile],
        votes: &[Vote],
    ) -> Tally {
        let scores: HashMap<&AgentId, f64> = participants
            .iter()
            .map(|p| (&p.id, p.learning_score()))
            .collect();
        let tally = weighted_tally(votes, |vote| {
            vote.weight() * scores.get(&vote.agent_id).copied().unwrap_or(0.0)
        });
        Tally {
            outcome: tally.total_weight > 0.0 && tally.achieved_ratio > CONFIDENCE_FLOOR,
            ..tally
        }
    }
}
