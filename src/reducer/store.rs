//! Group store contract
//!
//! The store is the only shared mutable state in the engine. Every method is
//! a single atomic operation, linearizable per group id; callers never
//! compose read-then-write sequences across two calls.
//!
//! Expiry is the store's job: a group whose `expires_at` has passed is
//! invisible to every read, can not be completed, and is replaced by a fresh
//! group on the next append for the same id.

use super::error::ReducerError;
use super::strategy::StrategyDescriptor;
use super::types::{AggregationGroup, EventRecord};
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Create the group if absent (first writer binds the strategy), then add
    /// the member unless its event id is already present or the group is
    /// completed. Returns the post-append snapshot.
    async fn append_member(
        &self,
        group_id: &str,
        record: EventRecord,
        strategy: &StrategyDescriptor,
        ttl: Duration,
    ) -> Result<AggregationGroup, ReducerError>;

    /// Transition PENDING -> COMPLETED iff the group is unexpired, pending,
    /// and still at `expected_version`. Exactly one concurrent caller wins.
    async fn try_complete(&self, group_id: &str, expected_version: u64) -> Result<bool, ReducerError>;

    /// Transition PENDING -> COMPLETED iff the group is unexpired and pending,
    /// whatever its version. Returns the frozen snapshot to the one caller
    /// that performed the transition. Timer-driven completions use this so a
    /// stream of appends can not starve them.
    async fn seal(&self, group_id: &str) -> Result<Option<AggregationGroup>, ReducerError>;

    /// Set the scheduled flag iff it is clear. Records `fire_at` and extends
    /// the group's lifetime so it outlives its timer.
    async fn mark_scheduled(&self, group_id: &str, fire_at: i64) -> Result<bool, ReducerError>;

    /// Clear the scheduled flag after scheduling failed for good
    async fn release_schedule(&self, group_id: &str) -> Result<(), ReducerError>;

    async fn mark_dispatched(&self, group_id: &str) -> Result<(), ReducerError>;

    async fn get(&self, group_id: &str) -> Result<Option<AggregationGroup>, ReducerError>;

    /// Armed, pending, unexpired groups as `(group_id, fire_at)`
    async fn pending_schedules(&self) -> Result<Vec<(String, i64)>, ReducerError>;

    /// Completed, unexpired groups whose aggregated event was never delivered
    async fn undispatched(&self) -> Result<Vec<AggregationGroup>, ReducerError>;

    /// Drop expired groups; returns how many were removed
    async fn purge_expired(&self) -> Result<usize, ReducerError>;
}

/// Lifetime renewal applied when a group is armed.
///
/// Keeps the original TTL length but measures it from the fire time.
pub(crate) fn renewed_expiry(created_at: i64, expires_at: i64, fire_at: i64) -> i64 {
    let ttl = expires_at - created_at;
    expires_at.max(fire_at + ttl)
}
