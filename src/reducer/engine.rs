//! Engine context object
//!
//! Owns one instance of each component and wires them together. Nothing in
//! the reducer is global: tests build as many engines as they like, each
//! with its own store, sink and clock.

use super::conditions::ConditionRegistry;
use super::dispatcher::{DispatchSink, Dispatcher, JsonlDispatchSink};
use super::error::ReducerError;
use super::evaluator::StrategyEvaluator;
use super::ingestion::{BatchReport, IngestionHandler};
use super::memory_store::InMemoryGroupStore;
use super::scheduler::{run_timer_loop, ScheduledCheck, Scheduler, TokioScheduler};
use super::sqlite_store::SqliteGroupStore;
use super::store::GroupStore;
use super::strategy::Strategy;
use super::sweeper::sweeper_task;
use super::types::{system_clock, Clock, InboundEvent};
use crate::config::{ReducerConfig, StoreBackend};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Timer channel capacity; checks are tiny and drained promptly
const TIMER_CHANNEL_BUFFER: usize = 1_024;

pub struct ReducerEngine {
    store: Arc<dyn GroupStore>,
    dispatcher: Arc<Dispatcher>,
    evaluator: Arc<StrategyEvaluator>,
    scheduler: Arc<TokioScheduler>,
    ingestion: Arc<IngestionHandler>,
    redispatch_grace_ms: u64,
    timer_rx: Option<mpsc::Receiver<ScheduledCheck>>,
}

impl ReducerEngine {
    pub fn new(
        config: &ReducerConfig,
        store: Arc<dyn GroupStore>,
        sink: Arc<dyn DispatchSink>,
        conditions: ConditionRegistry,
    ) -> Self {
        Self::with_clock(config, store, sink, conditions, system_clock())
    }

    pub fn with_clock(
        config: &ReducerConfig,
        store: Arc<dyn GroupStore>,
        sink: Arc<dyn DispatchSink>,
        conditions: ConditionRegistry,
        now_fn: Clock,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::with_clock(
            sink,
            store.clone(),
            config.dispatch_max_retries,
            config.dispatch_backoff_ms,
            now_fn.clone(),
        ));
        let evaluator = Arc::new(StrategyEvaluator::new(
            store.clone(),
            dispatcher.clone(),
            conditions,
        ));

        let (timer_tx, timer_rx) = mpsc::channel(TIMER_CHANNEL_BUFFER);
        let scheduler = Arc::new(TokioScheduler::with_clock(timer_tx, now_fn.clone()));

        let ingestion = Arc::new(
            IngestionHandler::new(
                store.clone(),
                evaluator.clone(),
                scheduler.clone(),
                config.strategy.clone(),
                config.group_ttl(),
            )
            .with_schedule_retries(config.schedule_max_retries, config.dispatch_backoff_ms)
            .with_redispatch_grace(config.redispatch_grace_ms)
            .with_clock(now_fn),
        );

        Self {
            store,
            dispatcher,
            evaluator,
            scheduler,
            ingestion,
            redispatch_grace_ms: config.redispatch_grace_ms,
            timer_rx: Some(timer_rx),
        }
    }

    /// Build the store and JSONL sink named by `config`
    pub fn from_config(config: &ReducerConfig, conditions: ConditionRegistry) -> Result<Self, ReducerError> {
        let store: Arc<dyn GroupStore> = match config.store {
            StoreBackend::Sqlite => Arc::new(SqliteGroupStore::new(
                &config.db_path,
                config.completed_retention(),
            )?),
            StoreBackend::Memory => Arc::new(InMemoryGroupStore::new(config.completed_retention())),
        };
        let sink = Arc::new(JsonlDispatchSink::new(&config.output_path)?);

        // fail at startup rather than on the first event
        Strategy::from_descriptor(&config.strategy, &conditions)?;

        Ok(Self::new(config, store, sink, conditions))
    }

    pub fn store(&self) -> &Arc<dyn GroupStore> {
        &self.store
    }

    pub fn evaluator(&self) -> &Arc<StrategyEvaluator> {
        &self.evaluator
    }

    pub fn ingestion(&self) -> &Arc<IngestionHandler> {
        &self.ingestion
    }

    pub fn scheduler(&self) -> &Arc<TokioScheduler> {
        &self.scheduler
    }

    pub async fn handle_batch(&self, events: Vec<InboundEvent>) -> BatchReport {
        self.ingestion.handle_batch(events).await
    }

    /// Start draining elapsed timers. Only the first call spawns a loop.
    pub fn spawn_timer_loop(&mut self) -> Option<JoinHandle<()>> {
        let rx = self.timer_rx.take()?;
        Some(tokio::spawn(run_timer_loop(rx, self.evaluator.clone())))
    }

    pub fn spawn_sweeper(&self, interval_ms: u64) -> JoinHandle<()> {
        tokio::spawn(sweeper_task(
            self.store.clone(),
            self.dispatcher.clone(),
            interval_ms,
            self.redispatch_grace_ms,
        ))
    }

    /// Re-arm timers recorded in the store by a previous process.
    ///
    /// Timers whose fire time already passed fire immediately.
    pub async fn rehydrate(&self) -> Result<usize, ReducerError> {
        let pending = self.store.pending_schedules().await?;

        for (group_id, fire_at) in &pending {
            self.scheduler.schedule(group_id, *fire_at).await?;
        }

        if !pending.is_empty() {
            log::info!("⏰ Re-armed {} timers from the store", pending.len());
        }
        Ok(pending.len())
    }

    pub fn shutdown(&self) {
        self.scheduler.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::dispatcher::ChannelDispatchSink;
    use crate::reducer::strategy::StrategyDescriptor;
    use crate::reducer::types::{EventRecord, Payload};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_rehydrate_rearms_stored_timers() {
        let store: Arc<dyn GroupStore> = Arc::new(InMemoryGroupStore::new(Duration::from_secs(60)));
        let descriptor = StrategyDescriptor::TimeWindow {
            window_ms: 10,
            jitter_ms: 0,
        };
        let record = EventRecord {
            event_id: "e1".to_string(),
            payload: Payload::Inline(json!(null)),
            arrived_at: 0,
        };

        // armed by a previous process that died before the timer fired
        let group = store
            .append_member("doc", record, &descriptor, Duration::from_secs(60))
            .await
            .unwrap();
        store.mark_scheduled("doc", group.created_at + 10).await.unwrap();

        let config = ReducerConfig {
            strategy: descriptor,
            ..ReducerConfig::default()
        };
        let (tx, mut rx) = mpsc::channel(4);
        let mut engine = ReducerEngine::new(
            &config,
            store,
            Arc::new(ChannelDispatchSink::new(tx)),
            ConditionRegistry::new(),
        );
        engine.spawn_timer_loop().unwrap();
        assert!(engine.spawn_timer_loop().is_none());

        assert_eq!(engine.rehydrate().await.unwrap(), 1);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.group_id, "doc");
    }

    #[test]
    fn test_from_config_rejects_unknown_condition() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReducerConfig {
            store: StoreBackend::Memory,
            output_path: dir.path().join("out.jsonl").display().to_string(),
            strategy: StrategyDescriptor::Predicate {
                condition: "nope".to_string(),
                timeout_ms: 100,
                backstop_ms: None,
            },
            ..ReducerConfig::default()
        };

        let result = ReducerEngine::from_config(&config, ConditionRegistry::with_builtins());
        assert!(matches!(result, Err(ReducerError::Strategy(_))));
    }
}
