//! Where votes come from.
//!
//! The engine never talks to agents directly. A [`VoteSource`] asks one
//! agent for its vote on a proposal (or its ballot in a leader election)
//! over whatever transport the host application uses.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::trace;

use crate::consensus::proposal::{ConsensusProposal, Vote};
use crate::core::agent::{AgentId, AgentProfile};

#[async_trait]
pub trait VoteSource: Send + Sync {
    /// Ask `agent` to vote. `None` means the agent did not answer.
    async fn request_vote(&self, agent: &AgentProfile, proposal: &ConsensusProposal)
        -> Option<Vote>;

    /// Ask `voter` whether it backs `candidate` as leader for `term`.
    async fn request_leader_vote(&self, voter: &AgentProfile, candidate: &AgentId, term: u64)
        -> bool;
}

/// Scripted behaviour of one agent in a [`StaticVoteSource`].
#[derive(Debug, Clone, PartialEq)]
pub enum VoteBehavior {
    Vote { decision: bool, confidence: f64 },
    /// Answer after a delay.
    Delayed {
        after: Duration,
        decision: bool,
        confidence: f64,
    },
    /// Never answer.
    Silent,
}

/// In-memory vote source with a fixed answer per agent.
///
/// Agents without a script vote yes with full confidence.
#[derive(Debug, Clone, Default)]
pub struct StaticVoteSource {
    behaviors: HashMap<AgentId, VoteBehavior>,
    refuses_leaders: HashSet<AgentId>,
}

impl StaticVoteSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vote(mut self, agent: impl Into<AgentId>, decision: bool, confidence: f64) -> Self {
        self.behaviors.insert(
            agent.into(),
            VoteBehavior::Vote {
                decision,
                confidence,
            },
        );
        self
    }

    pub fn with_behavior(mut self, agent: impl Into<AgentId>, behavior: VoteBehavior) -> Self {
        self.behaviors.insert(agent.into(), behavior);
        self
    }

    /// Make `agent` vote against every leader candidate.
    pub fn refusing_leaders(mut self, agent: impl Into<AgentId>) -> Self {
        self.refuses_leaders.insert(agent.into());
        self
    }
}

#[async_trait]
impl VoteSource for StaticVoteSource {
    async fn request_vote(
        &self,
        agent: &AgentProfile,
        _proposal: &ConsensusProposal,
    ) -> Option<Vote> {
        match self.behaviors.get(&agent.id) {
            None => Some(Vote::new(agent.id.clone(), true, 1.0)),
            Some(VoteBehavior::Vote {
                decision,
                confidence,
            }) => Some(Vote::new(agent.id.clone(), *decision, *confidence)),
            Some(VoteBehavior::Delayed {
                after,
                decision,
                confidence,
            }) => {
                tokio::time::sleep(*after).await;
                Some(Vote::new(agent.id.clone(), *decision, *confidence))
            }
            Some(VoteBehavior::Silent) => None,
        }
    }

    async fn request_leader_vote(
        &self,
        voter: &AgentProfile,
        _candidate: &AgentId,
        _term: u64,
    ) -> bool {
        if self.refuses_leaders.contains(&voter.id) {
            return false;
        }
        !matches!(self.behaviors.get(&voter.id), Some(VoteBehavior::Silent))
    }
}

/// Request votes from `agents` concurrently, appending each one as it
/// arrives. Returns the agents that answered, in arrival order.
///
/// Votes already in `votes` stay put, so a caller that times out keeps
/// whatever arrived before the deadline.
pub async fn gather_votes(
    source: &dyn VoteSource,
    proposal: &ConsensusProposal,
    agents: &[&AgentProfile],
    votes: &mut Vec<Vote>,
) -> Vec<AgentId> {
    let mut pending: FuturesUnordered<_> = agents
        .iter()
        .map(|agent| async move { (agent.id.clone(), source.request_vote(agent, proposal).await) })
        .collect();

    let mut answered = Vec::new();
    while let Some((agent_id, vote)) = pending.next().await {
        match vote {
            // One vote per agent, and only for itself.
            Some(vote) if vote.agent_id == agent_id && !votes.iter().any(|v| v.agent_id == agent_id) => {
                trace!(
                    "Vote from {}: {} ({:.2})",
                    agent_id,
                    vote.decision,
                    vote.confidence
                );
                votes.push(vote);
                answered.push(agent_id);
            }
            Some(_) => trace!("Discarding duplicate or foreign vote from {}", agent_id),
            None => trace!("No vote from {}", agent_id),
        }
    }
    answered
}
