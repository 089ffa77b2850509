//! Supervised background task that reconciles expired keys.
//!
//! One iteration failing never terminates the loop; the error is logged
//! and the next tick retries. The task exits only when the stop signal
//! fires, so shutdown can join it deterministically.

use crate::broker::SessionKeyBroker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info};

pub struct KeySweeper {
    broker: Arc<SessionKeyBroker>,
    period: Duration,
}

impl KeySweeper {
    pub fn new(broker: Arc<SessionKeyBroker>, period: Duration) -> Self {
        Self { broker, period }
    }

    /// Run the sweep loop until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(period_seconds = self.period.as_secs(), "starting key sweeper");
        let mut timer = interval(self.period);
        // The first tick fires immediately; startup already ran remove_all
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.broker.sweep_expired().await {
                        error!(error = %e, "sweep iteration failed");
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender counts as a stop signal
                    if changed.is_err() || *shutdown.borrow() {
                        info!("key sweeper stopping");
                        return;
                    }
                }
            }
        }
    }
}
