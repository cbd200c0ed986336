use crate::db::ReadingStore;
use crate::errors::Result;
use crate::metrics::{READINGS_PRUNED_TOTAL, RETENTION_FAILURES_TOTAL};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Prunes readings whose `received_at` is older than the horizon.
///
/// Runs on its own ticker and never touches the ingestion or query paths; a
/// failed pass is logged and retried on the next tick.
pub struct RetentionManager<S> {
    store: Arc<S>,
    horizon: Duration,
    prune_interval: std::time::Duration,
}

impl<S: ReadingStore> RetentionManager<S> {
    pub fn new(store: Arc<S>, horizon: Duration, prune_interval: std::time::Duration) -> Self {
        Self {
            store,
            horizon,
            prune_interval,
        }
    }

    /// Deletes everything received before `now - horizon`.
    pub async fn run_once(&self, now: DateTime<Utc>, horizon: Duration) -> Result<u64> {
        let cutoff = now
            .checked_sub_signed(horizon)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.store.prune_older_than(cutoff).await?;
        READINGS_PRUNED_TOTAL.inc_by(removed as f64);
        Ok(removed)
    }

    pub async fn run(self, ctx: CancellationToken) {
        info!(
            "Starting retention manager with horizon={}s, interval={:?}",
            self.horizon.num_seconds(),
            self.prune_interval
        );

        let mut ticker = interval(self.prune_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("Received shutdown signal, stopping retention manager");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("Retention manager stopped");
    }

    async fn tick(&self) {
        match self.run_once(Utc::now(), self.horizon).await {
            Ok(0) => debug!("Retention pass removed nothing"),
            Ok(removed) => info!(removed, "Retention pass completed"),
            Err(e) => {
                RETENTION_FAILURES_TOTAL.inc();
                error!(error = %e, "Retention pass failed, retrying on next tick");
            }
        }
    }
}
