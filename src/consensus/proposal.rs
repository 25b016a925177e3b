//! Proposals, votes and decided results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::consensus::AlgorithmKind;
use crate::core::agent::AgentId;
use crate::core::task::TaskId;

/// Unique identifier for a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalId(pub Uuid);

impl ProposalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the swarm is being asked to decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ProposalPayload {
    /// Accept or reject a plan.
    Plan { description: String },
    /// Settle competing claims on a shared resource.
    ResourceConflict {
        resource: String,
        claimants: Vec<AgentId>,
    },
    /// Confirm a task assignment.
    TaskAssignment { task_id: TaskId, agent_id: AgentId },
    Custom(serde_json::Value),
}

/// An immutable proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusProposal {
    pub id: ProposalId,
    pub payload: ProposalPayload,
    /// Ratio in (0, 1] the decision must reach.
    pub required_threshold: f64,
    pub created_at: DateTime<Utc>,
    /// Vote collection stops at this instant.
    pub deadline: DateTime<Utc>,
}

impl ConsensusProposal {
    pub fn new(
        payload: ProposalPayload,
        required_threshold: f64,
        created_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ProposalId::new(),
            payload,
            required_threshold,
            created_at,
            deadline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub agent_id: AgentId,
    pub decision: bool,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub cast_at: DateTime<Utc>,
}

impl Vote {
    pub fn new(agent_id: impl Into<AgentId>, decision: bool, confidence: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            decision,
            confidence: clamp_confidence(confidence),
            cast_at: Utc::now(),
        }
    }

    /// Confidence as counted by every tally.
    ///
    /// Votes built by hand may carry any value in `confidence`, so it is
    /// clamped again here.
    pub fn weight(&self) -> f64 {
        clamp_confidence(self.confidence)
    }
}

/// Clamp to [0, 1]; NaN counts as no confidence at all.
fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStatus {
    /// The swarm agreed.
    Reached,
    /// Votes were counted and the proposal failed.
    Rejected,
    /// The deadline passed before the proposal could pass.
    TimedOut,
}

impl fmt::Display for ConsensusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusStatus::Reached => write!(f, "reached"),
            ConsensusStatus::Rejected => write!(f, "rejected"),
            ConsensusStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

/// The decided outcome of a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub proposal_id: ProposalId,
    pub algorithm: AlgorithmKind,
    pub outcome: bool,
    pub status: ConsensusStatus,
    pub votes: Vec<Vote>,
    pub average_confidence: f64,
    pub achieved_ratio: f64,
    pub required_threshold: f64,
    /// Fraction of participants that voted.
    pub participation: f64,
    pub decided_at: DateTime<Utc>,
}

impl ConsensusResult {
    pub fn is_reached(&self) -> bool {
        self.status == ConsensusStatus::Reached
    }
}

impl fmt::Display for ConsensusResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "consensus {} via {}: achieved {:.2} vs required {:.2} ({} votes)",
            self.status,
            self.algorithm,
            self.achieved_ratio,
            self.required_threshold,
            self.votes.len()
        )
    }
}
