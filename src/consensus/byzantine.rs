//! Byzantine fault tolerant voting.
//!
//! Every participant votes. A vote only counts toward the quorum when it is
//! positive and confident (above [`CONFIDENCE_FLOOR`]); the proposal passes
//! with at least `floor(2n/3) + 1` such votes, which tolerates
//! `floor((n - 1)/3)` malicious participants.

use async_trait::async_trait;
use tracing::debug;

use crate::consensus::algorithm::{aggregate_votes, ConsensusAlgorithm, Tally};
use crate::consensus::proposal::{ConsensusProposal, Vote};
use crate::consensus::votes::{gather_votes, VoteSource};
use crate::consensus::{AlgorithmKind, CONFIDENCE_FLOOR};
use crate::core::agent::AgentProfile;

/// Positive confident votes needed out of `n`.
pub fn byzantine_quorum(n: usize) -> usize {
    2 * n / 3 + 1
}

#[derive(Debug, Default)]
pub struct ByzantineConsensus;

impl ByzantineConsensus {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConsensusAlgorithm for ByzantineConsensus {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Byzantine
    }

    fn tolerated_failures(&self, n: usize) -> usize {
        n.saturating_sub(1) / 3
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
        let n = participants.len();
        let honest_positive = votes
            .iter()
            .filter(|v| v.decision && v.weight() > CONFIDENCE_FLOOR)
            .count();
        let quorum = byzantine_quorum(n);
        debug!(
            "Byzantine tally: {} honest positive of {} participants, quorum {}",
            honest_positive, n, quorum
        );

        let base = aggregate_votes(votes);
        Tally {
            outcome: n > 0 && honest_positive >= quorum,
            achieved_ratio: if n > 0 {
                honest_positive as f64 / n as f64
            } else {
                0.0
            },
            ..base
        }
    }
}
