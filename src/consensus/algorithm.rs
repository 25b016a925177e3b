//! The pluggable algorithm seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::consensus::proposal::{ConsensusProposal, Vote};
use crate::consensus::votes::VoteSource;
use crate::consensus::{AlgorithmKind, CONFIDENCE_FLOOR};
use crate::core::agent::AgentProfile;

/// Counted votes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Tally {
    pub outcome: bool,
    pub weighted_positive: f64,
    pub total_weight: f64,
    pub average_confidence: f64,
    /// The algorithm's own measure of support, in [0, 1].
    pub achieved_ratio: f64,
}

/// Weight each vote by its confidence; pass when the weighted majority is
/// positive and the average confidence exceeds [`CONFIDENCE_FLOOR`].
pub fn aggregate_votes(votes: &[Vote]) -> Tally {
    weighted_tally(votes, Vote::weight)
}

/// Tally with a caller-supplied weight per vote.
pub(crate) fn weighted_tally(votes: &[Vote], weight: impl Fn(&Vote) -> f64) -> Tally {
    if votes.is_empty() {
        return Tally::default();
    }

    let mut weighted_positive = 0.0;
    let mut total_weight = 0.0;
    let mut confidence_sum = 0.0;
    for vote in votes {
        let w = weight(vote).max(0.0);
        total_weight += w;
        if vote.decision {
            weighted_positive += w;
        }
        confidence_sum += vote.weight();
    }

    let average_confidence = confidence_sum / votes.len() as f64;
    let achieved_ratio = if total_weight > 0.0 {
        weighted_positive / total_weight
    } else {
        0.0
    };
    Tally {
        outcome: weighted_positive > total_weight / 2.0 && average_confidence > CONFIDENCE_FLOOR,
        weighted_positive,
        total_weight,
        average_confidence,
        achieved_ratio,
    }
}

#[async_trait]
pub trait ConsensusAlgorithm: Send + Sync {
    fn kind(&self) -> AlgorithmKind;

    /// Failed or malicious participants tolerated out of `n`.
    fn tolerated_failures(&self, n: usize) -> usize;

    /// Collect votes into `votes` as they arrive.
    ///
    /// The engine may drop this future at the proposal deadline; anything
    /// already pushed is still counted.
    async fn collect_votes(
        &self,
        proposal: &ConsensusProposal,
        participants: &[AgentProfile],
        source: &dyn VoteSource,
        votes: &mut Vec<Vote>,
    );

    fn aggregate(
        &self,
        _proposal: &ConsensusProposal,
        _participants: &[AgentProfile],
        votes: &[Vote],
    ) -> Tally {
        aggregate_votes(votes)
    }
}
