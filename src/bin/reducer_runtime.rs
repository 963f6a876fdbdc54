//! Reducer Runtime
//!
//! Reads newline-delimited JSON events from stdin and reduces them:
//! - Opens the group store (SQLite or in-memory) and the JSONL output sink
//! - Re-arms timers left behind by a previous run
//! - Batches stdin by size or time window and feeds the worker pool
//! - Runs the timer loop and the sweeper in the background
//!
//! stdin can not be replayed, so workers redeliver retryable items themselves
//! (a few passes with backoff). Items still failing after that are logged; a
//! group whose timer could not be armed waits for its next event or its TTL.
//!
//! Usage:
//!   cat events.jsonl | cargo run --release --bin reducer_runtime
//!
//! Each input line is one event:
//!   {"group_id": "doc-1", "event_id": "chunk-0", "payload": {...}}
//!   {"group_id": "doc-1", "event_id": "chunk-1", "payload_ref": "s3://bucket/key"}
//!
//! See `ReducerConfig::from_env` for the environment variables.

use dotenv::dotenv;
use log::{error, info, warn};
use reducer::config::ReducerConfig;
use reducer::reducer::ingestion::{run_batcher, start_ingestion_workers};
use reducer::reducer::{ConditionRegistry, InboundEvent, ReducerEngine};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 Reducer Runtime");

    let config = ReducerConfig::from_env()?;
    let conditions = ConditionRegistry::with_builtins();

    info!("   ├─ Store: {:?} ({})", config.store, config.db_path);
    info!("   ├─ Output: {}", config.output_path);
    info!("   ├─ Strategy: {:?}", config.strategy);
    info!("   ├─ Conditions: {}", conditions.names().join(", "));
    info!("   ├─ Batching: {} events / {}ms", config.batch_size, config.batch_window_ms);
    info!("   └─ Workers: {}", config.workers);

    let mut engine = ReducerEngine::from_config(&config, conditions)?;

    let timer_loop = engine.spawn_timer_loop();
    let sweeper = engine.spawn_sweeper(config.sweep_interval_ms);
    let rearmed = engine.rehydrate().await?;
    info!("✅ Engine ready ({} timers re-armed)", rearmed);

    let (event_tx, event_rx) = mpsc::channel::<InboundEvent>(config.channel_buffer);
    let (batch_tx, batch_rx) = mpsc::channel::<Vec<InboundEvent>>(config.workers * 2);

    let batcher = tokio::spawn(run_batcher(
        event_rx,
        batch_tx,
        config.batch_size,
        config.batch_window_ms,
    ));
    let workers = start_ingestion_workers(batch_rx, engine.ingestion().clone(), config.workers);

    info!("🔄 Reading events from stdin (CTRL+C to stop)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_count = 0u64;
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        line_count += 1;
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<InboundEvent>(&line) {
                            Ok(event) => {
                                if event_tx.send(event).await.is_err() {
                                    error!("❌ Event channel closed, stopping input");
                                    break;
                                }
                            }
                            Err(e) => warn!("⚠️  Line {} is not a valid event: {}", line_count, e),
                        }
                    }
                    Ok(None) => {
                        info!("📥 End of input after {} lines", line_count);
                        break;
                    }
                    Err(e) => {
                        error!("❌ Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("⚠️  Received CTRL+C, shutting down...");
                interrupted = true;
                break;
            }
        }
    }

    // Closing the event channel flushes the batcher, which closes the batch
    // channel and lets the workers finish.
    drop(event_tx);
    if let Err(e) = batcher.await {
        error!("❌ Batcher task failed: {}", e);
    }
    for worker in workers {
        if let Err(e) = worker.await {
            error!("❌ Ingestion worker failed: {}", e);
        }
    }
    info!("✅ Ingestion drained");

    if !interrupted {
        let outstanding = engine.scheduler().outstanding();
        if outstanding > 0 {
            info!("⏳ Waiting for {} timers (CTRL+C to stop early)", outstanding);
        }
        loop {
            if engine.scheduler().outstanding() == 0 {
                break;
            }
            tokio::select! {
                _ = sleep(Duration::from_millis(500)) => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("⚠️  Received CTRL+C, abandoning outstanding timers");
                    break;
                }
            }
        }
        // let the timer loop finish the last evaluations
        sleep(Duration::from_millis(500)).await;
    }

    engine.shutdown();
    sweeper.abort();
    if let Some(timer_loop) = timer_loop {
        timer_loop.abort();
    }

    info!("✅ Reducer runtime stopped");
    Ok(())
}
