//! Leader-coordinated majority consensus.
//!
//! A leader coordinates each round. When there is none among the
//! participants, a candidate is drawn at random and needs ballots from more
//! than half of them; failed elections back off for a random interval and
//! retry a bounded number of times. The leader then collects votes, and a
//! decision additionally needs answers from a majority of participants.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::consensus::algorithm::{aggregate_votes, ConsensusAlgorithm, Tally};
use crate::consensus::proposal::{ConsensusProposal, Vote};
use crate::consensus::votes::{gather_votes, VoteSource};
use crate::consensus::{AlgorithmKind, ConsensusConfig};
use crate::core::agent::{AgentId, AgentProfile};

#[derive(Debug, Default)]
struct RaftState {
    term: u64,
    leader: Option<AgentId>,
}

pub struct RaftConsensus {
    state: Mutex<RaftState>,
    max_attempts: u32,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl RaftConsensus {
    pub fn new(config: &ConsensusConfig) -> Self {
        let backoff_min = Duration::from_millis(config.election_backoff_min_ms);
        let backoff_max =
            Duration::from_millis(config.election_backoff_max_ms.max(config.election_backoff_min_ms));
        Self {
            state: Mutex::new(RaftState::default()),
            max_attempts: config.election_max_attempts.max(1),
            backoff_min,
            backoff_max,
        }
    }

    pub async fn leader(&self) -> Option<AgentId> {
        self.state.lock().await.leader.clone()
    }

    pub async fn term(&self) -> u64 {
        self.state.lock().await.term
    }

    /// Forget the current leader so the next round elects a new one.
    pub async fn step_down(&self) {
        self.state.lock().await.leader = None;
    }

    /// Return the sitting leader if it is participating, else elect one.
    pub async fn ensure_leader(
        &self,
        participants: &[AgentProfile],
        source: &dyn VoteSource,
    ) -> Option<AgentId> {
        let mut state = self.state.lock().await;
        if let Some(leader) = &state.leader {
            if participants.iter().any(|p| &p.id == leader) {
                return Some(leader.clone());
            }
            debug!("Leader {} is not participating, holding election", leader);
            state.leader = None;
        }
        if participants.is_empty() {
            return None;
        }

        for attempt in 1..=self.max_attempts {
            state.term += 1;
            let term = state.term;
            let candidate = {
                let mut rng = rand::thread_rng();
                participants.choose(&mut rng).map(|p| p.id.clone())
            }?;

            let mut ballots = 0usize;
            for voter in participants {
                if source.request_leader_vote(voter, &candidate, term).await {
                    ballots += 1;
                }
            }

            if ballots * 2 > participants.len() {
                info!(
                    "Elected leader {} for term {} with {}/{} ballots",
                    candidate,
                    term,
                    ballots,
                    participants.len()
                );
                state.leader = Some(candidate.clone());
                return Some(candidate);
            }

            debug!(
                "Election attempt {} for term {} failed: {} got {}/{} ballots",
                attempt,
                term,
                candidate,
                ballots,
                participants.len()
            );
            if attempt < self.max_attempts {
                let backoff = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(self.backoff_min..=self.backoff_max)
                };
                tokio::time::sleep(backoff).await;
            }
        }

        warn!(
            "No leader elected after {} attempts among {} participants",
            self.max_attempts,
            participants.len()
        );
        None
    }
}

#[async_trait]
impl ConsensusAlgorithm for RaftConsensus {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Raft
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
        let Some(leader) = self.ensure_leader(participants, source).await else {
            return;
        };
        debug!("Leader {} collecting votes for {}", leader, proposal.id);

        let agents: Vec<&AgentProfile> = participants.iter().collect();
        gather_votes(source, proposal, &agents, votes).await;
    }

    fn aggregate(
        &self,
        _proposal: &ConsensusProposal,
        participants: &[AgentProfile],
        votes: &[Vote],
    ) -> Tally {
        let mut tally = aggregate_votes(votes);
        // Without a majority of answers the leader cannot commit.
        if votes.len() * 2 <= participants.len() {
            tally.outcome = false;
        }
        tally
    }
}
