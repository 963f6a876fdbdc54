//! Downstream delivery of completed groups
//!
//! The dispatcher only ever runs for a caller that won the completion CAS
//! (or for a completed group found undelivered later). It assembles the
//! aggregated event from the snapshot it is handed and never re-reads the
//! member set, so retries always deliver the same event.

use super::backoff::ExponentialBackoff;
use super::error::ReducerError;
use super::store::GroupStore;
use super::types::{system_clock, AggregatedEvent, AggregationGroup, Clock};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Cap on a single dispatch retry delay
const MAX_BACKOFF_MS: u64 = 30_000;

#[async_trait]
pub trait DispatchSink: Send + Sync {
    /// Deliver one aggregated event. Receivers dedupe on `dispatch_id`.
    async fn deliver(&self, event: &AggregatedEvent) -> Result<(), ReducerError>;

    /// Sink type for logging
    fn sink_type(&self) -> &'static str;
}

/// Append-only JSON lines file, one aggregated event per line
pub struct JsonlDispatchSink {
    file: Mutex<BufWriter<File>>,
}

impl JsonlDispatchSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, ReducerError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
        })
    }
}

#[async_trait]
impl DispatchSink for JsonlDispatchSink {
    async fn deliver(&self, event: &AggregatedEvent) -> Result<(), ReducerError> {
        let json = serde_json::to_string(event)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| ReducerError::Dispatch("output file lock poisoned".to_string()))?;
        writeln!(file, "{}", json)?;
        file.flush()?;
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "jsonl"
    }
}

/// Forwards aggregated events into an in-process channel
pub struct ChannelDispatchSink {
    tx: mpsc::Sender<AggregatedEvent>,
}

impl ChannelDispatchSink {
    pub fn new(tx: mpsc::Sender<AggregatedEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl DispatchSink for ChannelDispatchSink {
    async fn deliver(&self, event: &AggregatedEvent) -> Result<(), ReducerError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| ReducerError::Dispatch("downstream channel closed".to_string()))
    }

    fn sink_type(&self) -> &'static str {
        "channel"
    }
}

pub struct Dispatcher {
    sink: Arc<dyn DispatchSink>,
    store: Arc<dyn GroupStore>,
    max_retries: u32,
    backoff_ms: u64,
    now_fn: Clock,
}

impl Dispatcher {
    pub fn new(
        sink: Arc<dyn DispatchSink>,
        store: Arc<dyn GroupStore>,
        max_retries: u32,
        backoff_ms: u64,
    ) -> Self {
        Self::with_clock(sink, store, max_retries, backoff_ms, system_clock())
    }

    pub fn with_clock(
        sink: Arc<dyn DispatchSink>,
        store: Arc<dyn GroupStore>,
        max_retries: u32,
        backoff_ms: u64,
        now_fn: Clock,
    ) -> Self {
        Self {
            sink,
            store,
            max_retries,
            backoff_ms,
            now_fn,
        }
    }

    pub fn now(&self) -> i64 {
        (self.now_fn)()
    }

    /// Deliver the aggregated event for a completed group, then flag it
    /// dispatched. Returns the dispatch id.
    pub async fn dispatch(&self, group: &AggregationGroup, reason: &str) -> Result<String, ReducerError> {
        let completed_at = group.completed_at.unwrap_or_else(|| (self.now_fn)());
        let event = AggregatedEvent::from_group(group, reason, completed_at);
        let mut backoff = ExponentialBackoff::new(self.backoff_ms, MAX_BACKOFF_MS, self.max_retries);

        loop {
            match self.sink.deliver(&event).await {
                Ok(()) => break,
                Err(e) => {
                    log::warn!(
                        "⚠️  Delivery of {} to {} sink failed: {}",
                        event.dispatch_id,
                        self.sink.sink_type(),
                        e
                    );
                    if backoff.sleep().await.is_err() {
                        log::error!(
                            "❌ Giving up on {} after {} retries",
                            event.dispatch_id,
                            backoff.attempts()
                        );
                        return Err(ReducerError::Dispatch(format!(
                            "{} undelivered: {}",
                            event.dispatch_id, e
                        )));
                    }
                }
            }
        }

        // delivery already happened; a lost flag only means a duplicate later
        if let Err(e) = self.store.mark_dispatched(&group.group_id).await {
            log::warn!("⚠️  Failed to flag {} as dispatched: {}", event.dispatch_id, e);
        }

        log::info!(
            "📤 Dispatched {} ({} members, {})",
            event.dispatch_id,
            event.member_count,
            reason
        );
        Ok(event.dispatch_id)
    }
}
