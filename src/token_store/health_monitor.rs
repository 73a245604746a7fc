use crate::domain_model::OpContext;
use crate::token_store::{RemoteState, StoreCore};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Pings the remote store on a fixed cadence and drains parked writes once it
/// answers again.
pub(crate) struct HealthMonitor {
    core: Arc<StoreCore>,
    cancellation_token: CancellationToken,
}

impl HealthMonitor {
    pub(crate) fn new(core: Arc<StoreCore>, cancellation_token: CancellationToken) -> Self {
        Self {
            core,
            cancellation_token,
        }
    }

    pub(crate) async fn run(&self) {
        let mut ticker = tokio::time::interval(self.core.config.health_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    tracing::info!("health monitor shutting down...");
                    break;
                }
                _ = ticker.tick() => {
                    self.core.check_health(&self.cancellation_token).await;
                }
            }
        }
    }
}

impl StoreCore {
    /// One monitor tick. No lock is held while the ping is in flight.
    pub(crate) async fn check_health(&self, shutdown: &CancellationToken) -> RemoteState {
        let cx = OpContext::with_cancel(shutdown.child_token());
        let ping = self
            .remote
            .ping(&cx.with_timeout(self.config.health_ping_timeout))
            .await;

        match ping {
            Ok(()) => {
                let recovered = self.health.mark_up();
                if recovered || !self.pending.is_empty() {
                    self.drain(&cx).await;
                }
            }
            Err(_) if shutdown.is_cancelled() => {}
            Err(e) => {
                if !self.health.mark_down(&e.to_string()) {
                    tracing::debug!(error = %e, "remote store still down");
                }
            }
        }
        self.health.state()
    }
}
