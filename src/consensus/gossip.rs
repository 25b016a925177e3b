//! Epidemic propagation.
//!
//! The proposal starts at one random participant. Each round, every agent
//! that answered forwards it to up to `fanout` uninformed peers, which then
//! vote. There is no quorum: the proposal passes when more than 70% of the
//! participants were reached and voted, and the confidence-weighted vote is
//! positive.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use tracing::{debug, trace};

use crate::consensus::algorithm::{aggregate_votes, ConsensusAlgorithm, Tally};
use crate::consensus::proposal::{ConsensusProposal, Vote};
use crate::consensus::votes::{gather_votes, VoteSource};
use crate::consensus::{AlgorithmKind, ConsensusConfig};
use crate::core::agent::{AgentId, AgentProfile};

/// Participation the proposal must exceed.
pub const MIN_PARTICIPATION: f64 = 0.7;

#[derive(Debug)]
pub struct GossipConsensus {
    fanout: usize,
    max_rounds: usize,
}

impl GossipConsensus {
    pub fn new(config: &ConsensusConfig) -> Self {
        Self {
            fanout: config.gossip_fanout.max(1),
            max_rounds: config.gossip_max_rounds.max(1),
        }
    }

    /// Pick up to `fanout` uninformed peers per forwarding agent.
    fn spread<'a>(
        &self,
        forwarders: usize,
        participants: &'a [AgentProfile],
        informed: &mut HashSet<AgentId>,
    ) -> Vec<&'a AgentProfile> {
        let mut uninformed: Vec<&AgentProfile> = participants
            .iter()
            .filter(|p| !informed.contains(&p.id))
            .collect();
        {
            let mut rng = rand::thread_rng();
            uninformed.shuffle(&mut rng);
        }
        uninformed.truncate(forwarders.saturating_mul(self.fanout));
        for peer in &uninformed {
            informed.insert(peer.id.clone());
        }
        uninformed
    }
}

#[async_trait]
impl ConsensusAlgorithm for GossipConsensus {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Gossip
    }

    fn tolerated_failures(&self, n: usize) -> usize {
        let needed = (n as f64 * MIN_PARTICIPATION).floor() as usize + 1;
        n.saturating_sub(needed)
    }

    async fn collect_votes(
        &self,
        proposal: &ConsensusProposal,
        participants: &[AgentProfile],
        source: &dyn VoteSource,
        votes: &mut Vec<Vote>,
    ) {
        let seed = {
            let mut rng = rand::thread_rng();
            participants.choose(&mut rng)
        };
        let Some(seed) = seed else {
            return;
        };

        let mut informed: HashSet<AgentId> = HashSet::from([seed.id.clone()]);
        let mut frontier: Vec<&AgentProfile> = vec![seed];

        for round in 0..self.max_rounds {
            if frontier.is_empty() {
                break;
            }
            let answered = gather_votes(source, proposal, &frontier, votes).await;
            trace!(
                "Gossip round {}: {} informed, {} answered",
                round,
                frontier.len(),
                answered.len()
            );
            frontier = self.spread(answered.len(), participants, &mut informed);
        }

        debug!(
            "Gossip for {} reached {}/{} participants, {} voted",
            proposal.id,
            informed.len(),
            participants.len(),
            votes.len()
        );
    }

    fn aggregate(
        &self,
        _proposal: &ConsensusProposal,
        participants: &[AgentProfile],
        votes: &[Vote],
    ) -> Tally {
        let participation = if participants.is_empty() {
            0.0
        } else {
            votes.len() as f64 / participants.len() as f64
        };
        let base = aggregate_votes(votes);
        Tally {
            outcome: participation > MIN_PARTICIPATION
                && base.weighted_positive > base.total_weight / 2.0,
            ..base
        }
    }
}
