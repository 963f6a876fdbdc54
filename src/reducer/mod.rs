//! # Event Reducer (aggregation barrier)
//!
//! Collects correlated events produced by a fan-out stage and releases a
//! single aggregated event per group, once, despite at-least-once delivery
//! and concurrent producers.
//!
//! ## Flow
//!
//! 1. Inbound batches reach the `IngestionHandler`
//! 2. Each event is appended idempotently into its group (`GroupStore`)
//! 3. Count and predicate strategies evaluate inline; time windows arm a
//!    one-shot timer through the `Scheduler`
//! 4. A satisfied strategy races `try_complete(version)`; the single winner
//!    hands its snapshot to the `Dispatcher`
//!
//! Coordination happens only through the store's atomic operations. There
//! are no cross-worker locks.
//!
//! ## Module Organization
//!
//! - `types` - Groups, event records, aggregated output
//! - `strategy` - Completion policies and their persisted descriptors
//! - `conditions` - Named predicate conditions and the built-in set
//! - `sandbox` - Time-bounded predicate execution
//! - `store`, `memory_store`, `sqlite_store` - Group store contract and adapters
//! - `evaluator` - Evaluation plus the completion CAS
//! - `scheduler` - Delayed re-evaluation timers
//! - `dispatcher` - Delivery sinks and retrying dispatch
//! - `ingestion` - Batch handling, batching and the worker pool
//! - `sweeper` - Expiry and redelivery housekeeping
//! - `engine` - Context object wiring everything together

pub mod backoff;
pub mod conditions;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod ingestion;
pub mod memory_store;
pub mod sandbox;
pub mod scheduler;
pub mod sqlite_store;
pub mod store;
pub mod strategy;
pub mod sweeper;
pub mod types;

// Re-export commonly used types
pub use conditions::{condition_fn, Condition, ConditionRegistry};
pub use dispatcher::{ChannelDispatchSink, DispatchSink, Dispatcher, JsonlDispatchSink};
pub use engine::ReducerEngine;
pub use error::ReducerError;
pub use evaluator::{EvaluationOutcome, StrategyEvaluator};
pub use ingestion::{BatchReport, IngestionHandler, ItemFailure};
pub use memory_store::InMemoryGroupStore;
pub use scheduler::{ScheduleHandle, ScheduledCheck, Scheduler, TokioScheduler};
pub use sqlite_store::SqliteGroupStore;
pub use store::GroupStore;
pub use strategy::{Evaluation, Strategy, StrategyDescriptor, Trigger};
pub use types::{
    AggregatedEvent, AggregationGroup, Clock, EventRecord, GroupState, InboundEvent, Payload,
};
