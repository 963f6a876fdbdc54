//! Delayed re-evaluation triggers
//!
//! `TokioScheduler` spawns one sleeping task per armed group. When the task
//! wakes it posts a `ScheduledCheck` on the timer channel; `run_timer_loop`
//! drains that channel into the evaluator. Fire times are absolute
//! milliseconds, so jitter is already baked in by the strategy.

use super::error::ReducerError;
use super::evaluator::{EvaluationOutcome, StrategyEvaluator};
use super::types::{system_clock, Clock};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Identifies an outstanding one-shot trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleHandle {
    pub group_id: String,
    pub fire_at: i64,
}

/// Message posted when a timer elapses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledCheck {
    pub group_id: String,
    pub fire_at: i64,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Arrange exactly one future evaluation of `group_id` at `fire_at`
    async fn schedule(&self, group_id: &str, fire_at: i64) -> Result<ScheduleHandle, ReducerError>;
}

struct Outstanding {
    handle: ScheduleHandle,
    task: JoinHandle<()>,
}

pub struct TokioScheduler {
    tx: mpsc::Sender<ScheduledCheck>,
    now_fn: Clock,
    outstanding: Arc<Mutex<HashMap<String, Outstanding>>>,
}

impl TokioScheduler {
    pub fn new(tx: mpsc::Sender<ScheduledCheck>) -> Self {
        Self::with_clock(tx, system_clock())
    }

    pub fn with_clock(tx: mpsc::Sender<ScheduledCheck>, now_fn: Clock) -> Self {
        Self {
            tx,
            now_fn,
            outstanding: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Timers that have not fired yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().map_or(0, |timers| timers.len())
    }

    /// Abort every pending timer (shutdown path)
    pub fn cancel_all(&self) {
        if let Ok(mut timers) = self.outstanding.lock() {
            for (_, timer) in timers.drain() {
                timer.task.abort();
            }
        }
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn schedule(&self, group_id: &str, fire_at: i64) -> Result<ScheduleHandle, ReducerError> {
        if self.tx.is_closed() {
            return Err(ReducerError::Schedule("timer channel closed".to_string()));
        }

        let mut timers = self
            .outstanding
            .lock()
            .map_err(|_| ReducerError::Schedule("timer table lock poisoned".to_string()))?;

        if let Some(existing) = timers.get(group_id) {
            if !existing.task.is_finished() {
                log::debug!("Timer already outstanding for group {}", group_id);
                return Ok(existing.handle.clone());
            }
        }

        let delay_ms = (fire_at - (self.now_fn)()).max(0) as u64;
        let tx = self.tx.clone();
        let table = self.outstanding.clone();
        let check = ScheduledCheck {
            group_id: group_id.to_string(),
            fire_at,
        };

        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let group_id = check.group_id.clone();
            if tx.send(check).await.is_err() {
                log::warn!("⚠️  Timer channel closed before check could be posted");
            }
            // fired timers leave the table; the entry is still ours because
            // `schedule` never replaces an unfinished task
            if let Ok(mut timers) = table.lock() {
                if timers.get(&group_id).map_or(false, |t| t.handle.fire_at == fire_at) {
                    timers.remove(&group_id);
                }
            }
        });

        let handle = ScheduleHandle {
            group_id: group_id.to_string(),
            fire_at,
        };
        timers.insert(
            group_id.to_string(),
            Outstanding {
                handle: handle.clone(),
                task,
            },
        );

        log::debug!("⏰ Armed group {} to fire in {}ms", group_id, delay_ms);
        Ok(handle)
    }
}

/// Drain elapsed timers into the evaluator until the channel closes
pub async fn run_timer_loop(mut rx: mpsc::Receiver<ScheduledCheck>, evaluator: Arc<StrategyEvaluator>) {
    log::info!("⏰ Starting timer loop");

    while let Some(check) = rx.recv().await {
        let evaluator = evaluator.clone();
        // one task per check so a slow predicate does not hold up other timers
        tokio::spawn(async move {
            match evaluator.on_timer(&check.group_id).await {
                Ok(EvaluationOutcome::Dispatched(dispatch_id)) => {
                    log::info!("✅ Timer completed group {} ({})", check.group_id, dispatch_id);
                }
                Ok(outcome) => {
                    log::debug!("Timer for group {}: {:?}", check.group_id, outcome);
                }
                Err(e) => {
                    log::warn!("⚠️  Timer evaluation failed for group {}: {}", check.group_id, e);
                }
            }
        });
    }

    log::info!("✅ Timer loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn fixed_clock(at: i64) -> Clock {
        let now = Arc::new(AtomicI64::new(at));
        Arc::new(move || now.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_timer_posts_check_after_delay() {
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = TokioScheduler::with_clock(tx, fixed_clock(1_000));

        let handle = scheduler.schedule("doc", 1_030).await.unwrap();
        assert_eq!(handle.fire_at, 1_030);
        assert_eq!(scheduler.outstanding(), 1);

        let check = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(check.group_id, "doc");
        assert_eq!(check.fire_at, 1_030);
    }

    #[tokio::test]
    async fn test_fired_timers_leave_the_table() {
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = TokioScheduler::with_clock(tx, fixed_clock(0));

        for group_id in ["a", "b", "c"] {
            scheduler.schedule(group_id, 10).await.unwrap();
        }
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // inspect the table directly; nothing else has pruned it
        assert!(scheduler.outstanding.lock().unwrap().is_empty());

        // a fired group can be armed again
        scheduler.schedule("a", 10).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().group_id, "a");
    }

    #[tokio::test]
    async fn test_second_schedule_returns_existing_handle() {
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = TokioScheduler::with_clock(tx, fixed_clock(0));

        let first = scheduler.schedule("doc", 50).await.unwrap();
        let second = scheduler.schedule("doc", 9_999).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(scheduler.outstanding(), 1);

        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_past_fire_time_fires_immediately() {
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = TokioScheduler::with_clock(tx, fixed_clock(10_000));

        scheduler.schedule("late", 1_000).await.unwrap();
        let check = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap();
        assert!(check.is_some());
    }

    #[tokio::test]
    async fn test_closed_channel_is_schedule_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let scheduler = TokioScheduler::with_clock(tx, fixed_clock(0));

        let err = scheduler.schedule("doc", 10).await.unwrap_err();
        assert!(matches!(err, ReducerError::Schedule(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancel_all_aborts_timers() {
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = TokioScheduler::with_clock(tx, fixed_clock(0));

        scheduler.schedule("a", 200).await.unwrap();
        scheduler.schedule("b", 200).await.unwrap();
        scheduler.cancel_all();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.outstanding(), 0);
    }
}
