//! Circuit breakers guarding calls to agents and external services.
//!
//! A [`CircuitBreaker`] lets calls through while `Closed`, fails fast while
//! `Open`, and admits a bounded number of trial calls while `HalfOpen`.
//! The Open to HalfOpen move is lazy: it happens on the first call after
//! the retry time, read from the injected [`Clock`](crate::clock::Clock).
//!
//! [`CircuitBreakerManager`] keeps one breaker per target name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::{add_duration, system_clock, SharedClock};
use crate::error::{retry_hint, Error};
use crate::orchestration::events::{EngineEvent, EventBus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Successes in half-open state needed to close again.
    pub success_threshold: u32,
    /// Time spent open before a trial is allowed, in milliseconds.
    pub timeout_ms: u64,
    /// Trial calls admitted while half-open.
    pub half_open_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 60_000,
            half_open_limit: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Error returned by a protected call.
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The breaker rejected the call; the operation was not invoked.
    #[error("Circuit breaker '{name}' is open{}", retry_hint(.next_attempt))]
    Open {
        name: String,
        next_attempt: Option<DateTime<Utc>>,
    },
    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CallError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Inner(e) => Some(e),
            CallError::Open { .. } => None,
        }
    }
}

impl<E: Into<Error>> From<CallError<E>> for Error {
    fn from(err: CallError<E>) -> Self {
        match err {
            CallError::Open { name, next_attempt } => Error::BreakerOpen { name, next_attempt },
            CallError::Inner(e) => e.into(),
        }
    }
}

/// Snapshot of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub failures: u32,
    pub successes: u32,
    pub half_open_requests: u32,
    pub next_attempt: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerCore {
    state: BreakerState,
    failures: u32,
    successes: u32,
    half_open_requests: u32,
    next_attempt: Option<DateTime<Utc>>,
    total_requests: u64,
    rejected_requests: u64,
    total_failures: u64,
    total_successes: u64,
    last_failure: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
}

impl BreakerCore {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            successes: 0,
            half_open_requests: 0,
            next_attempt: None,
            total_requests: 0,
            rejected_requests: 0,
            total_failures: 0,
            total_successes: 0,
            last_failure: None,
            last_state_change: now,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    core: Mutex<BreakerCore>,
    clock: SharedClock,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    /// Build a breaker reading time from `clock`.
    ///
    /// A `half_open_limit` below `success_threshold` could never admit
    /// enough trials to close, so it is raised to match.
    pub fn with_clock(
        name: impl Into<String>,
        mut config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Self {
        let name = name.into();
        if config.half_open_limit < config.success_threshold {
            warn!(
                "Breaker '{}': half_open_limit {} raised to success_threshold {}",
                name, config.half_open_limit, config.success_threshold
            );
            config.half_open_limit = config.success_threshold;
        }
        let now = clock.now();
        Self {
            name,
            config,
            core: Mutex::new(BreakerCore::new(now)),
            clock,
            events: None,
        }
    }

    /// Publish state changes to `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub async fn state(&self) -> BreakerState {
        self.core.lock().await.state
    }

    /// Whether a call made now would be let through. Does not count as a
    /// request and does not change state.
    pub async fn is_accepting(&self) -> bool {
        let core = self.core.lock().await;
        match core.state {
            BreakerState::Closed => true,
            BreakerState::Open => core.next_attempt.is_some_and(|at| self.clock.now() >= at),
            BreakerState::HalfOpen => core.half_open_requests < self.config.half_open_limit,
        }
    }

    /// Run `op` through the breaker.
    ///
    /// The lock is not held while `op` runs, so concurrent calls through the
    /// same breaker proceed in parallel.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit().await?;

        match op().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure().await;
                Err(CallError::Inner(e))
            }
        }
    }

    async fn admit<E>(&self) -> Result<(), CallError<E>> {
        let mut core = self.core.lock().await;
        core.total_requests += 1;

        if !self.can_execute(&mut core) {
            core.rejected_requests += 1;
            debug!(
                "Breaker '{}' rejected call in state {} (next attempt {:?})",
                self.name, core.state, core.next_attempt
            );
            return Err(CallError::Open {
                name: self.name.clone(),
                next_attempt: core.next_attempt,
            });
        }

        if core.state == BreakerState::HalfOpen {
            core.half_open_requests += 1;
        }
        Ok(())
    }

    fn can_execute(&self, core: &mut BreakerCore) -> bool {
        match core.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let now = self.clock.now();
                match core.next_attempt {
                    Some(at) if now >= at => {
                        self.transition(core, BreakerState::HalfOpen);
                        core.half_open_requests < self.config.half_open_limit
                    }
                    _ => false,
                }
            }
            BreakerState::HalfOpen => core.half_open_requests < self.config.half_open_limit,
        }
    }

    async fn on_success(&self) {
        let mut core = self.core.lock().await;
        core.total_successes += 1;
        match core.state {
            BreakerState::Closed => core.failures = 0,
            BreakerState::HalfOpen => {
                core.successes += 1;
                if core.successes >= self.config.success_threshold {
                    self.transition(&mut core, BreakerState::Closed);
                }
            }
            // A call admitted before the breaker opened finished late.
            BreakerState::Open => {}
        }
    }

    async fn on_failure(&self) {
        let mut core = self.core.lock().await;
        core.total_failures += 1;
        core.last_failure = Some(self.clock.now());
        match core.state {
            BreakerState::Closed => {
                core.failures += 1;
                if core.failures >= self.config.failure_threshold {
                    self.transition(&mut core, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => self.transition(&mut core, BreakerState::Open),
            BreakerState::Open => core.failures += 1,
        }
    }

    fn transition(&self, core: &mut BreakerCore, to: BreakerState) {
        let from = core.state;
        if from == to {
            return;
        }
        let now = self.clock.now();
        core.state = to;
        core.last_state_change = now;

        match to {
            BreakerState::Open => {
                core.next_attempt = Some(add_duration(now, self.config.timeout()));
                core.successes = 0;
                core.half_open_requests = 0;
                warn!(
                    "Breaker '{}' opened after {} failures, retry after {:?}",
                    self.name, core.failures, core.next_attempt
                );
            }
            BreakerState::Closed => {
                core.failures = 0;
                core.successes = 0;
                core.half_open_requests = 0;
                core.next_attempt = None;
                info!("Breaker '{}' closed", self.name);
            }
            BreakerState::HalfOpen => {
                core.failures = 0;
                core.successes = 0;
                info!("Breaker '{}' half-open, admitting trial calls", self.name);
            }
        }

        if let Some(events) = &self.events {
            events.publish(EngineEvent::CircuitBreakerStateChange {
                name: self.name.clone(),
                from,
                to,
                at: now,
            });
        }
    }

    /// Force the breaker closed and clear its counters.
    pub async fn reset(&self) {
        let mut core = self.core.lock().await;
        self.transition(&mut core, BreakerState::Closed);
        *core = BreakerCore::new(self.clock.now());
    }

    pub async fn stats(&self) -> BreakerStats {
        let core = self.core.lock().await;
        BreakerStats {
            name: self.name.clone(),
            state: core.state,
            failures: core.failures,
            successes: core.successes,
            half_open_requests: core.half_open_requests,
            next_attempt: core.next_attempt,
            total_requests: core.total_requests,
            rejected_requests: core.rejected_requests,
            total_failures: core.total_failures,
            total_successes: core.total_successes,
            last_failure: core.last_failure,
            last_state_change: core.last_state_change,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

/// Registry of named breakers, created on first use.
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    clock: SharedClock,
    events: Option<EventBus>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            clock,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Fetch the breaker for `name`, creating it if needed.
    pub async fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(name) {
            return Arc::clone(existing);
        }

        let mut breakers = self.breakers.write().await;
        // Another caller may have created it between the two locks.
        let entry = breakers.entry(name.to_string()).or_insert_with(|| {
            debug!("Creating circuit breaker '{}'", name);
            let breaker =
                CircuitBreaker::with_clock(name, self.config.clone(), Arc::clone(&self.clock));
            let breaker = match &self.events {
                Some(events) => breaker.with_events(events.clone()),
                None => breaker,
            };
            Arc::new(breaker)
        });
        Arc::clone(entry)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(name).cloned()
    }

    pub async fn execute<F, Fut, T, E>(&self, name: &str, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.breaker(name).await.execute(op).await
    }

    /// Stats for every breaker, sorted by name.
    pub async fn stats(&self) -> Vec<BreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            stats.push(breaker.stats().await);
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Returns false if no breaker is registered under `name`.
    pub async fn reset(&self, name: &str) -> bool {
        match self.get(name).await {
            Some(breaker) => {
                breaker.reset().await;
                true
            }
            None => false,
        }
    }

    pub async fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.write().await.remove(name)
    }

    pub async fn len(&self) -> usize {
        self.breakers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.breakers.read().await.is_empty()
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
