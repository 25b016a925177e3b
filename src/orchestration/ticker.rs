//! Background steal ticker.
//!
//! Rebalancing is not triggered on every event. Instead a [`StealTicker`]
//! actor calls [`StealTarget::steal_tick`] once per interval until its
//! [`TickerHandle`] is shut down.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::orchestration::stealing::StealRequest;

/// Something that can rebalance work when the ticker fires.
#[async_trait]
pub trait StealTarget: Send + Sync + 'static {
    async fn steal_tick(&self) -> Option<StealRequest>;
}

/// Summary returned when a ticker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickerReport {
    pub ticks: u64,
    pub steals: u64,
}

pub struct StealTicker {
    target: Arc<dyn StealTarget>,
    interval: Duration,
}

impl StealTicker {
    pub fn new(target: Arc<dyn StealTarget>, interval: Duration) -> Self {
        Self {
            target,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn spawn(self) -> TickerHandle {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        debug!("StealTicker::spawn interval={:?}", self.interval);

        let join = tokio::spawn(async move {
            // First tick one full period from now, not immediately.
            let mut interval = interval_at(Instant::now() + self.interval, self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut report = TickerReport::default();

            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        debug!("StealTicker cancelled after {} ticks", report.ticks);
                        break;
                    }
                    _ = interval.tick() => {
                        report.ticks += 1;
                        if let Some(request) = self.target.steal_tick().await {
                            trace!("StealTicker: moved {} tasks {} -> {}", request.count, request.from, request.to);
                            report.steals += 1;
                        }
                    }
                }
            }
            report
        });

        TickerHandle { cancel, join }
    }
}

/// Handle to a running [`StealTicker`].
pub struct TickerHandle {
    cancel: CancellationToken,
    join: JoinHandle<TickerReport>,
}

impl TickerHandle {
    /// Signal the ticker to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the ticker and wait for it to exit.
    pub async fn shutdown(self) -> TickerReport {
        self.cancel.cancel();
        self.join.await.unwrap_or_default()
    }
}
