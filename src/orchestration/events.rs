//! Engine event bus.
//!
//! Components publish typed [`EngineEvent`]s to a tokio broadcast channel.
//! Subscribers get every event published after they subscribed; slow
//! subscribers lose the oldest events rather than blocking publishers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::consensus::{AlgorithmKind, ConsensusStatus, ProposalId};
use crate::core::agent::AgentId;
use crate::core::task::TaskId;
use crate::orchestration::breaker::BreakerState;
use crate::orchestration::stealing::StealRequest;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A task's dependencies are satisfied.
    TaskReady { task_id: TaskId },
    /// A task was dispatched to an agent.
    TaskAssigned {
        task_id: TaskId,
        agent_id: AgentId,
        score: f64,
    },
    /// A task completed; `unlocked` became ready as a result.
    TaskCompleted {
        task_id: TaskId,
        unlocked: Vec<TaskId>,
    },
    /// A task failed; `cascaded` failed with it.
    TaskFailed {
        task_id: TaskId,
        cascaded: Vec<TaskId>,
    },
    /// Work should move from an overloaded agent to an idle one.
    WorkStealingRequest(StealRequest),
    /// A circuit breaker changed state.
    CircuitBreakerStateChange {
        name: String,
        from: BreakerState,
        to: BreakerState,
        at: DateTime<Utc>,
    },
    /// A proposal was submitted to the consensus engine.
    ConsensusProposalCreated {
        proposal_id: ProposalId,
        algorithm: AlgorithmKind,
        participants: usize,
    },
    /// A proposal was decided (or timed out).
    ConsensusResult {
        proposal_id: ProposalId,
        outcome: bool,
        status: ConsensusStatus,
        achieved_ratio: f64,
        required_threshold: f64,
    },
}

impl EngineEvent {
    /// Topic name used by pub/sub collaborators.
    pub fn topic(&self) -> &'static str {
        match self {
            EngineEvent::TaskReady { .. } => "task:ready",
            EngineEvent::TaskAssigned { .. } => "task:assigned",
            EngineEvent::TaskCompleted { .. } => "task:completed",
            EngineEvent::TaskFailed { .. } => "task:failed",
            EngineEvent::WorkStealingRequest(_) => "workstealing:request",
            EngineEvent::CircuitBreakerStateChange { .. } => "circuitbreaker:state-change",
            EngineEvent::ConsensusProposalCreated { .. } => "consensus:proposal-created",
            EngineEvent::ConsensusResult { .. } => "consensus:result",
        }
    }
}

/// Broadcast bus shared by all engine components.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<EngineEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given per-subscriber capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: EngineEvent) {
        trace!("Publishing {}: {:?}", event.topic(), event);
        // No subscribers is not an error; events are fire-and-forget.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Receiving half of an [`EventBus`] subscription.
pub struct EventReceiver {
    receiver: broadcast::Receiver<EngineEvent>,
}

impl EventReceiver {
    /// Wait for the next event. Returns `None` once the bus is dropped.
    ///
    /// Lagged events are skipped with a warning.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event receiver lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Event receiver lagged by {} events", n);
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain every buffered event.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
