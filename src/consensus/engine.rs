//! Proposal dispatcher.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::{add_duration, system_clock, SharedClock};
use crate::consensus::algorithm::ConsensusAlgorithm;
use crate::consensus::byzantine::ByzantineConsensus;
use crate::consensus::gossip::GossipConsensus;
use crate::consensus::learning::LearningConsensus;
use crate::consensus::proposal::{
    ConsensusProposal, ConsensusResult, ConsensusStatus, ProposalId, ProposalPayload, Vote,
};
use crate::consensus::raft::RaftConsensus;
use crate::consensus::votes::VoteSource;
use crate::consensus::{AlgorithmKind, ConsensusConfig};
use crate::core::agent::AgentProfile;
use crate::error::{Error, Result};
use crate::orchestration::events::{EngineEvent, EventBus};

/// Runs proposals through the configured algorithms.
///
/// Every outcome, including a missed deadline, is a [`ConsensusResult`];
/// only malformed requests are errors.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    algorithms: HashMap<AlgorithmKind, Arc<dyn ConsensusAlgorithm>>,
    default_algorithm: RwLock<AlgorithmKind>,
    source: Arc<dyn VoteSource>,
    history: Mutex<VecDeque<ConsensusResult>>,
    clock: SharedClock,
    events: Option<EventBus>,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig, source: Arc<dyn VoteSource>) -> Self {
        Self::with_clock(config, source, system_clock())
    }

    pub fn with_clock(
        config: ConsensusConfig,
        source: Arc<dyn VoteSource>,
        clock: SharedClock,
    ) -> Self {
        let mut algorithms: HashMap<AlgorithmKind, Arc<dyn ConsensusAlgorithm>> = HashMap::new();
        algorithms.insert(AlgorithmKind::Raft, Arc::new(RaftConsensus::new(&config)));
        algorithms.insert(AlgorithmKind::Byzantine, Arc::new(ByzantineConsensus::new()));
        algorithms.insert(AlgorithmKind::Gossip, Arc::new(GossipConsensus::new(&config)));
        algorithms.insert(
            AlgorithmKind::ProofOfLearning,
            Arc::new(LearningConsensus::new()),
        );

        Self {
            default_algorithm: RwLock::new(config.default_algorithm),
            config,
            algorithms,
            source,
            history: Mutex::new(VecDeque::new()),
            clock,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the implementation used for `algorithm.kind()`.
    pub fn register_algorithm(&mut self, algorithm: Arc<dyn ConsensusAlgorithm>) {
        self.algorithms.insert(algorithm.kind(), algorithm);
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub async fn default_algorithm(&self) -> AlgorithmKind {
        *self.default_algorithm.read().await
    }

    pub async fn set_default_algorithm(&self, kind: AlgorithmKind) {
        *self.default_algorithm.write().await = kind;
    }

    /// Build a proposal with the configured threshold and deadline.
    pub fn proposal(&self, payload: ProposalPayload) -> ConsensusProposal {
        let now = self.clock.now();
        ConsensusProposal::new(
            payload,
            self.config.default_threshold,
            now,
            add_duration(now, self.config.default_timeout()),
        )
    }

    /// Decide `proposal` with the default algorithm.
    pub async fn propose(
        &self,
        proposal: ConsensusProposal,
        participants: &[AgentProfile],
    ) -> Result<ConsensusResult> {
        let kind = self.default_algorithm().await;
        self.propose_with(kind, proposal, participants).await
    }

    /// Decide `proposal` with a specific algorithm.
    ///
    /// # Errors
    /// `NoParticipants` for an empty participant list, `InvalidConfig` for a
    /// threshold outside (0, 1] or an unregistered algorithm.
    pub async fn propose_with(
        &self,
        kind: AlgorithmKind,
        proposal: ConsensusProposal,
        participants: &[AgentProfile],
    ) -> Result<ConsensusResult> {
        if participants.is_empty() {
            return Err(Error::NoParticipants);
        }
        if !(proposal.required_threshold > 0.0 && proposal.required_threshold <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "proposal threshold must be in (0, 1], got {}",
                proposal.required_threshold
            )));
        }
        let algorithm = self
            .algorithms
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::InvalidConfig(format!("no {} algorithm registered", kind)))?;

        let participants = dedup_participants(participants);
        debug!(
            "Proposal {} via {} with {} participants",
            proposal.id,
            kind,
            participants.len()
        );
        self.publish(EngineEvent::ConsensusProposalCreated {
            proposal_id: proposal.id,
            algorithm: kind,
            participants: participants.len(),
        });

        let remaining = (proposal.deadline - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let mut votes: Vec<Vote> = Vec::new();
        let timed_out = tokio::time::timeout(
            remaining,
            algorithm.collect_votes(&proposal, &participants, self.source.as_ref(), &mut votes),
        )
        .await
        .is_err();
        if timed_out {
            warn!(
                "Proposal {} hit its deadline with {}/{} votes",
                proposal.id,
                votes.len(),
                participants.len()
            );
        }

        let tally = algorithm.aggregate(&proposal, &participants, &votes);
        let outcome = tally.outcome && tally.achieved_ratio >= proposal.required_threshold;
        let status = if outcome {
            ConsensusStatus::Reached
        } else if timed_out {
            ConsensusStatus::TimedOut
        } else {
            ConsensusStatus::Rejected
        };

        let result = ConsensusResult {
            proposal_id: proposal.id,
            algorithm: kind,
            outcome,
            status,
            participation: votes.len() as f64 / participants.len() as f64,
            average_confidence: tally.average_confidence,
            achieved_ratio: tally.achieved_ratio,
            required_threshold: proposal.required_threshold,
            votes,
            decided_at: self.clock.now(),
        };
        info!("Proposal {}: {}", proposal.id.short(), result);

        self.publish(EngineEvent::ConsensusResult {
            proposal_id: result.proposal_id,
            outcome: result.outcome,
            status: result.status,
            achieved_ratio: result.achieved_ratio,
            required_threshold: result.required_threshold,
        });
        self.remember(result.clone()).await;
        Ok(result)
    }

    async fn remember(&self, result: ConsensusResult) {
        let mut history = self.history.lock().await;
        history.push_back(result);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    /// Decided results, oldest first.
    pub async fn history(&self) -> Vec<ConsensusResult> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub async fn result(&self, id: ProposalId) -> Option<ConsensusResult> {
        self.history
            .lock()
            .await
            .iter()
            .find(|r| r.proposal_id == id)
            .cloned()
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

fn dedup_participants(participants: &[AgentProfile]) -> Vec<AgentProfile> {
    let mut seen = HashSet::new();
    participants
        .iter()
        .filter(|p| seen.insert(p.id.clone()))
        .cloned()
        .collect()
}
