//! Orchestration layer of the coordination engine.
//!
//! Placement, fault isolation and rebalancing live here, together with the
//! [`CoordinationEngine`] that wires them to the dependency graph and the
//! consensus engine, and the [`EventBus`] every component reports to.

pub mod balancer;
pub mod breaker;
pub mod engine;
pub mod events;
pub mod predictor;
pub mod stealing;
pub mod ticker;

pub use balancer::{
    HybridWeights, LoadBalancer, LoadBalancerConfig, LoadBalancingDecision, ScoredAgent, Strategy,
};
pub use breaker::{
    BreakerState, BreakerStats, CallError, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerManager,
};
pub use engine::{CoordinationEngine, EngineStats};
pub use events::{EngineEvent, EventBus, EventReceiver};
pub use predictor::{LoadPredictor, Prediction, PredictionSource, PredictionUnavailable};
pub use stealing::{
    AgentQueues, AgentWorkload, StealRequest, WorkStealingConfig, WorkStealingCoordinator,
};
pub use ticker::{StealTarget, StealTicker, TickerHandle, TickerReport};
