//! In-process group store
//!
//! Same semantics as the SQLite store, with a single mutex serializing every
//! operation. Suitable for tests and single-process deployments where losing
//! groups on restart is acceptable.

use super::error::ReducerError;
use super::store::{renewed_expiry, GroupStore};
use super::strategy::StrategyDescriptor;
use super::types::{system_clock, AggregationGroup, Clock, EventRecord, GroupState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub struct InMemoryGroupStore {
    groups: Mutex<HashMap<String, AggregationGroup>>,
    completed_retention: Duration,
    now_fn: Clock,
}

impl InMemoryGroupStore {
    pub fn new(completed_retention: Duration) -> Self {
        Self::with_clock(completed_retention, system_clock())
    }

    pub fn with_clock(completed_retention: Duration, now_fn: Clock) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            completed_retention,
            now_fn,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, AggregationGroup>>, ReducerError> {
        self.groups
            .lock()
            .map_err(|_| ReducerError::Store("group map lock poisoned".to_string()))
    }

    /// Live (unexpired) group for `group_id`, dropping a stale one in passing
    fn live<'a>(
        groups: &'a mut HashMap<String, AggregationGroup>,
        group_id: &str,
        now: i64,
    ) -> Option<&'a mut AggregationGroup> {
        if groups.get(group_id).map_or(false, |g| g.expires_at <= now) {
            groups.remove(group_id);
        }
        groups.get_mut(group_id)
    }
}

#[async_trait]
impl GroupStore for InMemoryGroupStore {
    async fn append_member(
        &self,
        group_id: &str,
        record: EventRecord,
        strategy: &StrategyDescriptor,
        ttl: Duration,
    ) -> Result<AggregationGroup, ReducerError> {
        let now = (self.now_fn)();
        let mut groups = self.lock()?;

        if Self::live(&mut groups, group_id, now).is_none() {
            let group = AggregationGroup::new(
                group_id,
                strategy.clone(),
                now,
                now + ttl.as_millis() as i64,
            );
            groups.insert(group_id.to_string(), group);
        }

        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| ReducerError::Store(format!("group {} vanished", group_id)))?;

        if group.is_pending() && !group.members.contains_key(&record.event_id) {
            group.members.insert(record.event_id.clone(), record);
            group.version += 1;
        }

        Ok(group.clone())
    }

    async fn try_complete(&self, group_id: &str, expected_version: u64) -> Result<bool, ReducerError> {
        let now = (self.now_fn)();
        let mut groups = self.lock()?;

        match Self::live(&mut groups, group_id, now) {
            Some(group) if group.is_pending() && group.version == expected_version => {
                group.state = GroupState::Completed;
                group.completed_at = Some(now);
                group.expires_at = now + self.completed_retention.as_millis() as i64;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn seal(&self, group_id: &str) -> Result<Option<AggregationGroup>, ReducerError> {
        let now = (self.now_fn)();
        let mut groups = self.lock()?;

        match Self::live(&mut groups, group_id, now) {
            Some(group) if group.is_pending() => {
                group.state = GroupState::Completed;
                group.completed_at = Some(now);
                group.expires_at = now + self.completed_retention.as_millis() as i64;
                Ok(Some(group.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_scheduled(&self, group_id: &str, fire_at: i64) -> Result<bool, ReducerError> {
        let now = (self.now_fn)();
        let mut groups = self.lock()?;

        match Self::live(&mut groups, group_id, now) {
            Some(group) if group.is_pending() && !group.scheduled => {
                group.scheduled = true;
                group.fire_at = Some(fire_at);
                group.expires_at = renewed_expiry(group.created_at, group.expires_at, fire_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_schedule(&self, group_id: &str) -> Result<(), ReducerError> {
        let now = (self.now_fn)();
        let mut groups = self.lock()?;

        if let Some(group) = Self::live(&mut groups, group_id, now) {
            group.scheduled = false;
            group.fire_at = None;
        }
        Ok(())
    }

    async fn mark_dispatched(&self, group_id: &str) -> Result<(), ReducerError> {
        let now = (self.now_fn)();
        let mut groups = self.lock()?;

        if let Some(group) = Self::live(&mut groups, group_id, now) {
            group.dispatched = true;
        }
        Ok(())
    }

    async fn get(&self, group_id: &str) -> Result<Option<AggregationGroup>, ReducerError> {
        let now = (self.now_fn)();
        let mut groups = self.lock()?;
        Ok(Self::live(&mut groups, group_id, now).map(|g| g.clone()))
    }

    async fn pending_schedules(&self) -> Result<Vec<(String, i64)>, ReducerError> {
        let now = (self.now_fn)();
        let groups = self.lock()?;

        Ok(groups
            .values()
            .filter(|g| g.expires_at > now && g.is_pending() && g.scheduled)
            .filter_map(|g| g.fire_at.map(|fire_at| (g.group_id.clone(), fire_at)))
            .collect())
    }

    async fn undispatched(&self) -> Result<Vec<AggregationGroup>, ReducerError> {
        let now = (self.now_fn)();
        let groups = self.lock()?;

        Ok(groups
            .values()
            .filter(|g| g.expires_at > now && g.state == GroupState::Completed && !g.dispatched)
            .cloned()
            .collect())
    }

    async fn purge_expired(&self) -> Result<usize, ReducerError> {
        let now = (self.now_fn)();
        let mut groups = self.lock()?;

        let before = groups.len();
        groups.retain(|_, g| g.expires_at > now);
        Ok(before - groups.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::types::Payload;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn manual_clock(start: i64) -> (Arc<AtomicI64>, Clock) {
        let now = Arc::new(AtomicI64::new(start));
        let handle = now.clone();
        (now, Arc::new(move || handle.load(Ordering::SeqCst)))
    }

    fn record(event_id: &str) -> EventRecord {
        EventRecord {
            event_id: event_id.to_string(),
            payload: Payload::Inline(json!({ "id": event_id })),
            arrived_at: 0,
        }
    }

    fn count(n: usize) -> StrategyDescriptor {
        StrategyDescriptor::StaticCount { count: n }
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_duplicate_append_is_noop() {
        let (_now, clock) = manual_clock(1_000);
        let store = InMemoryGroupStore::with_clock(Duration::from_secs(10), clock);

        for id in ["e1", "e1", "e2", "e1", "e3"] {
            store.append_member("g", record(id), &count(3), TTL).await.unwrap();
        }

        let group = store.get("g").await.unwrap().unwrap();
        assert_eq!(group.len(), 3);
        assert_eq!(group.version, 3);
    }

    #[tokio::test]
    async fn test_first_writer_binds_strategy() {
        let (_now, clock) = manual_clock(1_000);
        let store = InMemoryGroupStore::with_clock(Duration::from_secs(10), clock);

        store.append_member("g", record("e1"), &count(2), TTL).await.unwrap();
        let group = store.append_member("g", record("e2"), &count(9), TTL).await.unwrap();

        assert_eq!(group.strategy, count(2));
    }

    #[tokio::test]
    async fn test_try_complete_requires_matching_version() {
        let (_now, clock) = manual_clock(1_000);
        let store = InMemoryGroupStore::with_clock(Duration::from_secs(10), clock);

        let snapshot = store.append_member("g", record("e1"), &count(1), TTL).await.unwrap();
        store.append_member("g", record("e2"), &count(1), TTL).await.unwrap();

        assert!(!store.try_complete("g", snapshot.version).await.unwrap());
        assert!(store.try_complete("g", snapshot.version + 1).await.unwrap());
        assert!(!store.try_complete("g", snapshot.version + 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_seal_completes_whatever_is_present() {
        let (now, clock) = manual_clock(1_000);
        let store = InMemoryGroupStore::with_clock(Duration::from_secs(10), clock);

        store.append_member("g", record("e1"), &count(5), TTL).await.unwrap();
        store.append_member("g", record("e2"), &count(5), TTL).await.unwrap();
        now.store(1_500, Ordering::SeqCst);

        let sealed = store.seal("g").await.unwrap().unwrap();
        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed.completed_at, Some(1_500));
        assert_eq!(sealed.expires_at, 1_500 + 10_000);

        assert!(store.seal("g").await.unwrap().is_none());
        assert!(!store.try_complete("g", sealed.version).await.unwrap());
    }

    #[tokio::test]
    async fn test_completed_group_rejects_appends() {
        let (_now, clock) = manual_clock(1_000);
        let store = InMemoryGroupStore::with_clock(Duration::from_secs(10), clock);

        let snapshot = store.append_member("g", record("e1"), &count(1), TTL).await.unwrap();
        assert!(store.try_complete("g", snapshot.version).await.unwrap());

        let after = store.append_member("g", record("e2"), &count(1), TTL).await.unwrap();
        assert_eq!(after.state, GroupState::Completed);
        assert_eq!(after.completed_at, Some(1_000));
        assert_eq!(after.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_scheduled_once() {
        let (_now, clock) = manual_clock(1_000);
        let store = InMemoryGroupStore::with_clock(Duration::from_secs(10), clock);

        store.append_member("g", record("e1"), &count(1), TTL).await.unwrap();
        assert!(store.mark_scheduled("g", 5_000).await.unwrap());
        assert!(!store.mark_scheduled("g", 6_000).await.unwrap());

        let group = store.get("g").await.unwrap().unwrap();
        assert_eq!(group.fire_at, Some(5_000));
        assert_eq!(store.pending_schedules().await.unwrap(), vec![("g".to_string(), 5_000)]);

        store.release_schedule("g").await.unwrap();
        assert!(store.mark_scheduled("g", 7_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_group_is_replaced() {
        let (now, clock) = manual_clock(1_000);
        let store = InMemoryGroupStore::with_clock(Duration::from_secs(10), clock);

        store.append_member("g", record("old"), &count(5), TTL).await.unwrap();
        now.store(1_000 + 60_000, Ordering::SeqCst);

        assert!(store.get("g").await.unwrap().is_none());
        assert!(!store.try_complete("g", 1).await.unwrap());

        let fresh = store.append_member("g", record("new"), &count(5), TTL).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert!(fresh.members.contains_key("new"));
        assert_eq!(fresh.created_at, 61_000);
    }

    #[tokio::test]
    async fn test_purge_and_undispatched() {
        let (now, clock) = manual_clock(1_000);
        let store = InMemoryGroupStore::with_clock(Duration::from_secs(5), clock);

        let done = store.append_member("done", record("e"), &count(1), TTL).await.unwrap();
        store.append_member("open", record("e"), &count(2), TTL).await.unwrap();
        assert!(store.try_complete("done", done.version).await.unwrap());

        let undispatched = store.undispatched().await.unwrap();
        assert_eq!(undispatched.len(), 1);
        assert_eq!(undispatched[0].group_id, "done");

        store.mark_dispatched("done").await.unwrap();
        assert!(store.undispatched().await.unwrap().is_empty());

        // completed retention (5s) runs out before the open group's ttl (60s)
        now.store(1_000 + 6_000, Ordering::SeqCst);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get("open").await.unwrap().is_some());
    }
}
