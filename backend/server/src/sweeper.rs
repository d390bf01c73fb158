//! Periodic cleanup. Pruning also happens on every lock acquire, this just keeps idle
//! events and rate limiter keys from piling up between votes.
use std::sync::Arc;

use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::state::AppState;

pub fn spawn_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    let period = state.config.sweep_interval;

    tokio::spawn(async move {
        info!("Sweeper started, every {}s", period.as_secs());

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            sweep_once(&state).await;
        }
    })
}

pub async fn sweep_once(state: &AppState) {
    let now = state.clock.now();

    match state.locks.prune(now).await {
        Ok(report) => debug!(
            locks = report.locks,
            fingerprints = report.fingerprints,
            "Swept fingerprint state"
        ),
        Err(e) => warn!("Fingerprint sweep failed: {e}"),
    }

    match state.rate_limiter.sweep(now) {
        Ok(evicted) => debug!(evicted, "Swept rate limiter"),
        Err(e) => warn!("Rate limiter sweep failed: {e}"),
    }
}
