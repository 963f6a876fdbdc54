//! Housekeeping: passive expiry and redelivery of undispatched groups

use super::dispatcher::Dispatcher;
use super::error::ReducerError;
use super::store::GroupStore;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub purged: usize,
    pub redispatched: usize,
    pub redispatch_failures: usize,
}

/// One housekeeping pass. Only completions older than `grace_ms` are
/// re-dispatched, so a winner still retrying its own delivery is left alone.
pub async fn sweep_once(
    store: &Arc<dyn GroupStore>,
    dispatcher: &Dispatcher,
    grace_ms: u64,
) -> Result<SweepReport, ReducerError> {
    let mut report = SweepReport {
        purged: store.purge_expired().await?,
        ..SweepReport::default()
    };

    let now = dispatcher.now();
    for group in store.undispatched().await? {
        if !group.redispatch_due(now, grace_ms) {
            continue;
        }
        match dispatcher.dispatch(&group, "recovered undelivered group").await {
            Ok(_) => report.redispatched += 1,
            Err(e) => {
                report.redispatch_failures += 1;
                log::warn!("⚠️  Sweeper could not re-dispatch {}: {}", group.group_id, e);
            }
        }
    }

    Ok(report)
}

/// Run `sweep_once` every `interval_ms` until the task is aborted
pub async fn sweeper_task(
    store: Arc<dyn GroupStore>,
    dispatcher: Arc<Dispatcher>,
    interval_ms: u64,
    grace_ms: u64,
) {
    log::info!("🧹 Starting sweeper (interval: {}ms)", interval_ms);

    let mut timer = interval(Duration::from_millis(interval_ms.max(1)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        timer.tick().await;

        match sweep_once(&store, &dispatcher, grace_ms).await {
            Ok(report) if report.purged > 0 || report.redispatched > 0 || report.redispatch_failures > 0 => {
                log::info!(
                    "🧹 Sweep: {} purged, {} re-dispatched, {} still undelivered",
                    report.purged,
                    report.redispatched,
                    report.redispatch_failures
                );
            }
            Ok(_) => {}
            Err(e) => log::warn!("⚠️  Sweep failed: {}", e),
        }
    }
}
