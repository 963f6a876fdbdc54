//! Ingestion - batched, idempotent appends into the group store
//!
//! Each item of a batch is handled on its own: a failure on one item never
//! fails its neighbours. Failures are reported per item with a retryable
//! flag so the inbound transport knows what to redeliver.
//!
//! Per item:
//! 1. Validate correlation ids (missing ids are permanent failures)
//! 2. Append into the group store under the configured strategy and TTL
//! 3. Completed group: re-dispatch if delivery is overdue, else no-op
//! 4. Arm a timer when the stored strategy asks for one (one winner per group)
//! 5. Evaluate inline for count and predicate strategies

use super::backoff::ExponentialBackoff;
use super::error::ReducerError;
use super::evaluator::{EvaluationOutcome, StrategyEvaluator};
use super::scheduler::Scheduler;
use super::store::GroupStore;
use super::strategy::{StrategyDescriptor, Trigger};
use super::types::{system_clock, Clock, EventRecord, InboundEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Cap on a single scheduling retry delay
const MAX_SCHEDULE_BACKOFF_MS: u64 = 5_000;

/// Passes a worker makes over the retryable items of a batch
pub const WORKER_REDELIVERIES: u32 = 3;

pub const DEFAULT_REDISPATCH_GRACE_MS: u64 = 60_000;

/// Why one inbound item was not fully processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub index: usize,
    pub event_id: Option<String>,
    pub reason: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    /// Dispatch ids released while handling this batch
    pub dispatched: Vec<String>,
    pub failures: Vec<ItemFailure>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Batch positions the transport should redeliver
    pub fn retryable_indices(&self) -> Vec<usize> {
        self.failures
            .iter()
            .filter(|f| f.retryable)
            .map(|f| f.index)
            .collect()
    }
}

pub struct IngestionHandler {
    store: Arc<dyn GroupStore>,
    evaluator: Arc<StrategyEvaluator>,
    scheduler: Arc<dyn Scheduler>,
    strategy: StrategyDescriptor,
    group_ttl: Duration,
    schedule_retries: u32,
    schedule_backoff_ms: u64,
    redispatch_grace_ms: u64,
    now_fn: Clock,
}

impl IngestionHandler {
    pub fn new(
        store: Arc<dyn GroupStore>,
        evaluator: Arc<StrategyEvaluator>,
        scheduler: Arc<dyn Scheduler>,
        strategy: StrategyDescriptor,
        group_ttl: Duration,
    ) -> Self {
        Self {
            store,
            evaluator,
            scheduler,
            strategy,
            group_ttl,
            schedule_retries: 3,
            schedule_backoff_ms: 100,
            redispatch_grace_ms: DEFAULT_REDISPATCH_GRACE_MS,
            now_fn: system_clock(),
        }
    }

    pub fn with_schedule_retries(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.schedule_retries = retries;
        self.schedule_backoff_ms = backoff_ms;
        self
    }

    /// Minimum age of an undelivered completion before a redelivered event
    /// may re-dispatch it
    pub fn with_redispatch_grace(mut self, grace_ms: u64) -> Self {
        self.redispatch_grace_ms = grace_ms;
        self
    }

    pub fn with_clock(mut self, now_fn: Clock) -> Self {
        self.now_fn = now_fn;
        self
    }

    pub async fn handle_batch(&self, events: Vec<InboundEvent>) -> BatchReport {
        let mut report = BatchReport::default();

        for (index, event) in events.into_iter().enumerate() {
            let event_id = event.event_id.clone();
            report.processed += 1;

            match self.handle_event(event).await {
                Ok(Some(dispatch_id)) => report.dispatched.push(dispatch_id),
                Ok(None) => {}
                Err(e) => {
                    let retryable = e.is_retryable();
                    if retryable {
                        log::warn!("⚠️  Item {} ({:?}) failed, retryable: {}", index, event_id, e);
                    } else {
                        log::warn!("⚠️  Item {} ({:?}) rejected: {}", index, event_id, e);
                    }
                    report.failures.push(ItemFailure {
                        index,
                        event_id,
                        reason: e.to_string(),
                        retryable,
                    });
                }
            }
        }

        report
    }

    /// Handle a batch, then redeliver its retryable items up to
    /// `max_redeliveries` times with backoff.
    ///
    /// The returned report covers the whole batch: every dispatch and every
    /// permanent failure across all passes, plus the retryable failures left
    /// after the last pass, indexed by position in the original batch.
    pub async fn handle_batch_with_redelivery(
        &self,
        events: Vec<InboundEvent>,
        max_redeliveries: u32,
    ) -> BatchReport {
        let mut positions: Vec<usize> = (0..events.len()).collect();
        let mut pending = events;
        let mut backoff =
            ExponentialBackoff::new(self.schedule_backoff_ms, MAX_SCHEDULE_BACKOFF_MS, max_redeliveries);
        let mut total = BatchReport {
            processed: pending.len(),
            ..BatchReport::default()
        };

        loop {
            let mut pass = self.handle_batch(pending.clone()).await;
            total.dispatched.append(&mut pass.dispatched);

            let retry = pass.retryable_indices();
            let mut retryable = Vec::new();
            for mut failure in pass.failures {
                failure.index = positions[failure.index];
                if failure.retryable {
                    retryable.push(failure);
                } else {
                    total.failures.push(failure);
                }
            }

            if retry.is_empty() || backoff.sleep().await.is_err() {
                total.failures.append(&mut retryable);
                total.failures.sort_by_key(|f| f.index);
                return total;
            }

            log::info!("🔁 Redelivering {} retryable items", retry.len());
            positions = retry.iter().map(|&i| positions[i]).collect();
            pending = retry.iter().filter_map(|&i| pending.get(i).cloned()).collect();
        }
    }

    /// Process one inbound event; returns the dispatch id if this item
    /// released the group.
    pub async fn handle_event(&self, event: InboundEvent) -> Result<Option<String>, ReducerError> {
        let group_id = required(&event.group_id, "group_id")?;
        let event_id = required(&event.event_id, "event_id")?;

        let record = EventRecord {
            event_id: event_id.clone(),
            payload: event.into_payload(),
            arrived_at: (self.now_fn)(),
        };

        let snapshot = self
            .store
            .append_member(&group_id, record, &self.strategy, self.group_ttl)
            .await?;

        log::debug!(
            "📥 {} -> group {} ({} members, v{})",
            event_id,
            group_id,
            snapshot.len(),
            snapshot.version
        );

        if !snapshot.is_pending() {
            if !snapshot.redispatch_due((self.now_fn)(), self.redispatch_grace_ms) {
                log::debug!("Group {} already completed, ignoring {}", group_id, event_id);
                return Ok(None);
            }
            log::info!("🔁 Re-dispatching undelivered group {}", group_id);
            let dispatch_id = self
                .evaluator
                .dispatcher()
                .dispatch(&snapshot, "redelivery of undispatched group")
                .await?;
            return Ok(Some(dispatch_id));
        }

        // the group's own descriptor, which may predate a config change
        let strategy = self.evaluator.resolve(&snapshot.strategy)?;

        if strategy.on_append(&snapshot) {
            let fire_at = {
                let mut rng = rand::thread_rng();
                strategy.fire_at(&snapshot, &mut rng)
            };
            if let Some(fire_at) = fire_at {
                if self.store.mark_scheduled(&group_id, fire_at).await? {
                    self.arm(&group_id, fire_at).await?;
                }
            }
        }

        if !strategy.evaluates_on_append() {
            return Ok(None);
        }

        match self.evaluator.evaluate(&snapshot, Trigger::Append).await? {
            EvaluationOutcome::Dispatched(dispatch_id) => Ok(Some(dispatch_id)),
            _ => Ok(None),
        }
    }

    /// Hand the timer to the scheduler, retrying with backoff. On persistent
    /// failure the scheduled flag is released so a redelivery can re-arm.
    async fn arm(&self, group_id: &str, fire_at: i64) -> Result<(), ReducerError> {
        let mut backoff = ExponentialBackoff::new(
            self.schedule_backoff_ms,
            MAX_SCHEDULE_BACKOFF_MS,
            self.schedule_retries,
        );

        loop {
            match self.scheduler.schedule(group_id, fire_at).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if backoff.sleep().await.is_err() {
                        log::error!("❌ Could not arm group {}: {}", group_id, e);
                        self.store.release_schedule(group_id).await?;
                        return Err(ReducerError::Schedule(format!(
                            "group {} not armed: {}",
                            group_id, e
                        )));
                    }
                }
            }
        }
    }
}

fn required(value: &Option<String>, field: &str) -> Result<String, ReducerError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ReducerError::Malformed(format!("missing {}", field))),
    }
}

/// Spawn `workers` tasks draining batches from a shared channel
pub fn start_ingestion_workers(
    rx: mpsc::Receiver<Vec<InboundEvent>>,
    handler: Arc<IngestionHandler>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    let workers = workers.max(1);

    log::info!("🚀 Starting {} ingestion workers", workers);

    (0..workers)
        .map(|worker_id| {
            let rx = rx.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let batch = { rx.lock().await.recv().await };
                    let Some(batch) = batch else {
                        break;
                    };

                    let size = batch.len();
                    let report = handler
                        .handle_batch_with_redelivery(batch, WORKER_REDELIVERIES)
                        .await;
                    if report.is_clean() {
                        log::debug!(
                            "Worker {} handled batch of {} ({} dispatched)",
                            worker_id,
                            size,
                            report.dispatched.len()
                        );
                    } else {
                        log::warn!(
                            "⚠️  Worker {}: {} of {} items failed ({} still retryable after redelivery)",
                            worker_id,
                            report.failures.len(),
                            size,
                            report.retryable_indices().len()
                        );
                    }
                }
                log::debug!("Worker {} stopped", worker_id);
            })
        })
        .collect()
}

/// Group single events into batches, flushing on size or on the window tick.
///
/// Runs until the event channel closes, then flushes what is left.
pub async fn run_batcher(
    mut rx: mpsc::Receiver<InboundEvent>,
    tx: mpsc::Sender<Vec<InboundEvent>>,
    batch_size: usize,
    window_ms: u64,
) {
    let batch_size = batch_size.max(1);
    let mut pending: Vec<InboundEvent> = Vec::with_capacity(batch_size);
    let mut window = interval(Duration::from_millis(window_ms.max(1)));
    window.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else {
                    break;
                };
                pending.push(event);
                if pending.len() >= batch_size {
                    let batch = std::mem::replace(&mut pending, Vec::with_capacity(batch_size));
                    if tx.send(batch).await.is_err() {
                        log::warn!("⚠️  Batch channel closed, stopping batcher");
                        return;
                    }
                }
            }
            _ = window.tick() => {
                if !pending.is_empty() {
                    let batch = std::mem::replace(&mut pending, Vec::with_capacity(batch_size));
                    if tx.send(batch).await.is_err() {
                        log::warn!("⚠️  Batch channel closed, stopping batcher");
                        return;
                    }
                }
            }
        }
    }

    if !pending.is_empty() && tx.send(pending).await.is_err() {
        log::warn!("⚠️  Final batch dropped, batch channel closed");
    }
    log::info!("✅ Batcher stopped");
}
