//! SQLite-backed group store
//!
//! Tables:
//! - `reducer_groups` - one row per group (state, flags, version, lifetime)
//! - `reducer_members` - one row per (group_id, event_id); the composite
//!   primary key is the dedup mechanism
//!
//! Multi-statement operations run inside a single `BEGIN IMMEDIATE`
//! transaction so the write lock is taken up front; single-row transitions
//! are conditional `UPDATE`s checked through the affected-row count.

use super::error::ReducerError;
use super::store::{renewed_expiry, GroupStore};
use super::strategy::StrategyDescriptor;
use super::types::{system_clock, AggregationGroup, Clock, EventRecord, GroupState, Payload};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reducer_groups (
    group_id        TEXT PRIMARY KEY,
    strategy_json   TEXT NOT NULL,
    state           TEXT NOT NULL DEFAULT 'PENDING',
    scheduled       INTEGER NOT NULL DEFAULT 0,
    fire_at         INTEGER,
    dispatched      INTEGER NOT NULL DEFAULT 0,
    completed_at    INTEGER,
    version         INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL,
    expires_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS reducer_members (
    group_id        TEXT NOT NULL,
    event_id        TEXT NOT NULL,
    payload_json    TEXT NOT NULL,
    arrived_at      INTEGER NOT NULL,
    PRIMARY KEY (group_id, event_id)
);

CREATE INDEX IF NOT EXISTS idx_reducer_groups_expires ON reducer_groups(expires_at);
CREATE INDEX IF NOT EXISTS idx_reducer_groups_state ON reducer_groups(state, scheduled, dispatched);
"#;

pub struct SqliteGroupStore {
    conn: Arc<Mutex<Connection>>,
    completed_retention: Duration,
    now_fn: Clock,
}

impl SqliteGroupStore {
    /// Open (or create) the store at `db_path` and apply the schema
    pub fn new(db_path: impl AsRef<Path>, completed_retention: Duration) -> Result<Self, ReducerError> {
        Self::with_clock(db_path, completed_retention, system_clock())
    }

    pub fn with_clock(
        db_path: impl AsRef<Path>,
        completed_retention: Duration,
        now_fn: Clock,
    ) -> Result<Self, ReducerError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path.as_ref())?;
        apply_optimized_pragmas(&conn)?;
        conn.execute_batch(SCHEMA)?;

        log::info!("✅ SQLite group store ready: {}", db_path.as_ref().display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            completed_retention,
            now_fn,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ReducerError> {
        self.conn
            .lock()
            .map_err(|_| ReducerError::Store("connection lock poisoned".to_string()))
    }

    /// Remove a group row and its members if the row has expired
    fn drop_if_expired(conn: &Connection, group_id: &str, now: i64) -> Result<(), ReducerError> {
        let removed = conn.execute(
            "DELETE FROM reducer_groups WHERE group_id = ?1 AND expires_at <= ?2",
            params![group_id, now],
        )?;
        if removed > 0 {
            conn.execute(
                "DELETE FROM reducer_members WHERE group_id = ?1",
                params![group_id],
            )?;
            log::debug!("Dropped expired group {}", group_id);
        }
        Ok(())
    }

    /// Read the live group row plus members using `conn`
    fn load(conn: &Connection, group_id: &str, now: i64) -> Result<Option<AggregationGroup>, ReducerError> {
        let row = conn
            .query_row(
                "SELECT strategy_json, state, scheduled, fire_at, dispatched, completed_at, version, created_at, expires_at
                 FROM reducer_groups WHERE group_id = ?1 AND expires_at > ?2",
                params![group_id, now],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((strategy_json, state, scheduled, fire_at, dispatched, completed_at, version, created_at, expires_at)) =
            row
        else {
            return Ok(None);
        };

        let strategy: StrategyDescriptor = serde_json::from_str(&strategy_json)?;
        let state = GroupState::from_str(&state)
            .ok_or_else(|| ReducerError::Store(format!("unknown group state {}", state)))?;

        let mut stmt = conn.prepare(
            "SELECT event_id, payload_json, arrived_at FROM reducer_members WHERE group_id = ?1",
        )?;
        let rows = stmt.query_map(params![group_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut members = BTreeMap::new();
        for row in rows {
            let (event_id, payload_json, arrived_at) = row?;
            let payload: Payload = serde_json::from_str(&payload_json)?;
            members.insert(
                event_id.clone(),
                EventRecord {
                    event_id,
                    payload,
                    arrived_at,
                },
            );
        }

        Ok(Some(AggregationGroup {
            group_id: group_id.to_string(),
            strategy,
            state,
            members,
            scheduled,
            fire_at,
            dispatched,
            completed_at,
            version: version as u64,
            created_at,
            expires_at,
        }))
    }

    fn group_ids(conn: &Connection, sql: &str, now: i64) -> Result<Vec<String>, ReducerError> {
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map(params![now], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

#[async_trait]
impl GroupStore for SqliteGroupStore {
    async fn append_member(
        &self,
        group_id: &str,
        record: EventRecord,
        strategy: &StrategyDescriptor,
        ttl: Duration,
    ) -> Result<AggregationGroup, ReducerError> {
        let now = (self.now_fn)();
        let strategy_json = serde_json::to_string(strategy)?;
        let payload_json = serde_json::to_string(&record.payload)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        Self::drop_if_expired(&tx, group_id, now)?;

        tx.execute(
            "INSERT OR IGNORE INTO reducer_groups (group_id, strategy_json, state, created_at, expires_at)
             VALUES (?1, ?2, 'PENDING', ?3, ?4)",
            params![group_id, strategy_json, now, now + ttl.as_millis() as i64],
        )?;

        let pending: bool = tx.query_row(
            "SELECT state = 'PENDING' FROM reducer_groups WHERE group_id = ?1",
            params![group_id],
            |row| row.get(0),
        )?;

        if pending {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO reducer_members (group_id, event_id, payload_json, arrived_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![group_id, record.event_id, payload_json, record.arrived_at],
            )?;
            if inserted == 1 {
                tx.execute(
                    "UPDATE reducer_groups SET version = version + 1 WHERE group_id = ?1",
                    params![group_id],
                )?;
            }
        }

        let snapshot = Self::load(&tx, group_id, now)?
            .ok_or_else(|| ReducerError::Store(format!("group {} vanished during append", group_id)))?;

        tx.commit()?;
        Ok(snapshot)
    }

    async fn try_complete(&self, group_id: &str, expected_version: u64) -> Result<bool, ReducerError> {
        let now = (self.now_fn)();
        let retained_until = now + self.completed_retention.as_millis() as i64;
        let conn = self.lock()?;

        let updated = conn.execute(
            "UPDATE reducer_groups
             SET state = 'COMPLETED', completed_at = ?4, expires_at = ?3
             WHERE group_id = ?1 AND state = 'PENDING' AND version = ?2 AND expires_at > ?4",
            params![group_id, expected_version as i64, retained_until, now],
        )?;

        Ok(updated == 1)
    }

    async fn seal(&self, group_id: &str) -> Result<Option<AggregationGroup>, ReducerError> {
        let now = (self.now_fn)();
        let retained_until = now + self.completed_retention.as_millis() as i64;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            "UPDATE reducer_groups
             SET state = 'COMPLETED', completed_at = ?3, expires_at = ?2
             WHERE group_id = ?1 AND state = 'PENDING' AND expires_at > ?3",
            params![group_id, retained_until, now],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        // read back inside the same transaction; the row was live a statement
        // ago, so skip the expiry filter
        let sealed = Self::load(&tx, group_id, i64::MIN)?
            .ok_or_else(|| ReducerError::Store(format!("group {} vanished while sealing", group_id)))?;
        tx.commit()?;

        Ok(Some(sealed))
    }

    async fn mark_scheduled(&self, group_id: &str, fire_at: i64) -> Result<bool, ReducerError> {
        let now = (self.now_fn)();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let lifetime: Option<(i64, i64)> = tx
            .query_row(
                "SELECT created_at, expires_at FROM reducer_groups
                 WHERE group_id = ?1 AND state = 'PENDING' AND scheduled = 0 AND expires_at > ?2",
                params![group_id, now],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((created_at, expires_at)) = lifetime else {
            return Ok(false);
        };

        tx.execute(
            "UPDATE reducer_groups SET scheduled = 1, fire_at = ?2, expires_at = ?3 WHERE group_id = ?1",
            params![group_id, fire_at, renewed_expiry(created_at, expires_at, fire_at)],
        )?;
        tx.commit()?;

        Ok(true)
    }

    async fn release_schedule(&self, group_id: &str) -> Result<(), ReducerError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE reducer_groups SET scheduled = 0, fire_at = NULL WHERE group_id = ?1",
            params![group_id],
        )?;
        Ok(())
    }

    async fn mark_dispatched(&self, group_id: &str) -> Result<(), ReducerError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE reducer_groups SET dispatched = 1 WHERE group_id = ?1",
            params![group_id],
        )?;
        Ok(())
    }

    async fn get(&self, group_id: &str) -> Result<Option<AggregationGroup>, ReducerError> {
        let now = (self.now_fn)();
        let conn = self.lock()?;
        Self::load(&conn, group_id, now)
    }

    async fn pending_schedules(&self) -> Result<Vec<(String, i64)>, ReducerError> {
        let now = (self.now_fn)();
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT group_id, fire_at FROM reducer_groups
             WHERE state = 'PENDING' AND scheduled = 1 AND fire_at IS NOT NULL AND expires_at > ?1",
        )?;
        let schedules = stmt
            .query_map(params![now], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(schedules)
    }

    async fn undispatched(&self) -> Result<Vec<AggregationGroup>, ReducerError> {
        let now = (self.now_fn)();
        let conn = self.lock()?;

        let ids = Self::group_ids(
            &conn,
            "SELECT group_id FROM reducer_groups
             WHERE state = 'COMPLETED' AND dispatched = 0 AND expires_at > ?1",
            now,
        )?;

        let mut groups = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(group) = Self::load(&conn, &id, now)? {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    async fn purge_expired(&self) -> Result<usize, ReducerError> {
        let now = (self.now_fn)();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM reducer_members WHERE group_id IN
             (SELECT group_id FROM reducer_groups WHERE expires_at <= ?1)",
            params![now],
        )?;
        let purged = tx.execute(
            "DELETE FROM reducer_groups WHERE expires_at <= ?1",
            params![now],
        )?;
        tx.commit()?;

        if purged > 0 {
            log::debug!("🧹 Purged {} expired groups", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::tempdir;

    const TTL: Duration = Duration::from_secs(60);

    fn manual_clock(start: i64) -> (Arc<AtomicI64>, Clock) {
        let now = Arc::new(AtomicI64::new(start));
        let handle = now.clone();
        (now, Arc::new(move || handle.load(Ordering::SeqCst)))
    }

    fn record(event_id: &str) -> EventRecord {
        EventRecord {
            event_id: event_id.to_string(),
            payload: Payload::Inline(json!({ "id": event_id })),
            arrived_at: 1_000,
        }
    }

    fn window() -> StrategyDescriptor {
        StrategyDescriptor::TimeWindow {
            window_ms: 5_000,
            jitter_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_append_dedups_and_persists() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("groups.db");
        let (_now, clock) = manual_clock(1_000);

        {
            let store = SqliteGroupStore::with_clock(&db_path, Duration::from_secs(30), clock.clone()).unwrap();
            for id in ["e1", "e2", "e1"] {
                store.append_member("doc", record(id), &window(), TTL).await.unwrap();
            }
        }

        // reopen: state survives the process
        let store = SqliteGroupStore::with_clock(&db_path, Duration::from_secs(30), clock).unwrap();
        let group = store.get("doc").await.unwrap().unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group.version, 2);
        assert_eq!(group.strategy, window());
        assert_eq!(group.members["e1"].payload, Payload::Inline(json!({ "id": "e1" })));
    }

    #[tokio::test]
    async fn test_reference_payload_round_trips() {
        let dir = tempdir().unwrap();
        let (_now, clock) = manual_clock(1_000);
        let store = SqliteGroupStore::with_clock(dir.path().join("g.db"), Duration::from_secs(30), clock).unwrap();

        let mut rec = record("big");
        rec.payload = Payload::Reference("s3://bucket/big.bin".to_string());
        let group = store.append_member("doc", rec, &window(), TTL).await.unwrap();

        assert_eq!(
            group.members["big"].payload,
            Payload::Reference("s3://bucket/big.bin".to_string())
        );
    }

    #[tokio::test]
    async fn test_cas_single_winner() {
        let dir = tempdir().unwrap();
        let (_now, clock) = manual_clock(1_000);
        let store = SqliteGroupStore::with_clock(dir.path().join("g.db"), Duration::from_secs(30), clock).unwrap();

        let snapshot = store.append_member("doc", record("e1"), &window(), TTL).await.unwrap();

        let first = store.try_complete("doc", snapshot.version).await.unwrap();
        let second = store.try_complete("doc", snapshot.version).await.unwrap();
        assert!(first);
        assert!(!second);

        let group = store.get("doc").await.unwrap().unwrap();
        assert_eq!(group.state, GroupState::Completed);
        assert_eq!(group.completed_at, Some(1_000));
        assert_eq!(group.expires_at, 1_000 + 30_000);

        let after = store.append_member("doc", record("late"), &window(), TTL).await.unwrap();
        assert_eq!(after.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_try_complete_has_one_winner() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteGroupStore::new(dir.path().join("g.db"), Duration::from_secs(30)).unwrap());

        let mut snapshot = store.append_member("doc", record("e1"), &window(), TTL).await.unwrap();
        for id in ["e2", "e3"] {
            snapshot = store.append_member("doc", record(id), &window(), TTL).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let version = snapshot.version;
            tasks.push(tokio::spawn(async move { store.try_complete("doc", version).await }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        let group = store.get("doc").await.unwrap().unwrap();
        assert_eq!(group.state, GroupState::Completed);
        assert_eq!(group.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_seal_ignores_version_and_has_one_winner() {
        let dir = tempdir().unwrap();
        let (_now, clock) = manual_clock(2_000);
        let store = Arc::new(
            SqliteGroupStore::with_clock(dir.path().join("g.db"), Duration::from_secs(30), clock).unwrap(),
        );

        let stale = store.append_member("doc", record("e1"), &window(), TTL).await.unwrap();
        store.append_member("doc", record("e2"), &window(), TTL).await.unwrap();
        assert!(!store.try_complete("doc", stale.version).await.unwrap());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move { store.seal("doc").await }));
        }

        let mut sealed = Vec::new();
        for task in tasks {
            if let Some(group) = task.await.unwrap().unwrap() {
                sealed.push(group);
            }
        }

        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].state, GroupState::Completed);
        assert_eq!(sealed[0].completed_at, Some(2_000));
        assert_eq!(sealed[0].len(), 2);
        assert!(store.seal("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_scheduled_renews_expiry() {
        let dir = tempdir().unwrap();
        let (_now, clock) = manual_clock(1_000);
        let store = SqliteGroupStore::with_clock(dir.path().join("g.db"), Duration::from_secs(30), clock).unwrap();

        store.append_member("doc", record("e1"), &window(), TTL).await.unwrap();
        assert!(store.mark_scheduled("doc", 100_000).await.unwrap());
        assert!(!store.mark_scheduled("doc", 200_000).await.unwrap());

        let group = store.get("doc").await.unwrap().unwrap();
        assert!(group.scheduled);
        assert_eq!(group.fire_at, Some(100_000));
        assert_eq!(group.expires_at, 100_000 + 60_000);
        assert_eq!(
            store.pending_schedules().await.unwrap(),
            vec![("doc".to_string(), 100_000)]
        );
    }

    #[tokio::test]
    async fn test_expiry_and_recreation() {
        let dir = tempdir().unwrap();
        let (now, clock) = manual_clock(1_000);
        let store = SqliteGroupStore::with_clock(dir.path().join("g.db"), Duration::from_secs(30), clock).unwrap();

        store.append_member("doc", record("stale"), &window(), TTL).await.unwrap();
        now.store(1_000 + 60_000, Ordering::SeqCst);

        assert!(store.get("doc").await.unwrap().is_none());

        let fresh = store.append_member("doc", record("fresh"), &window(), TTL).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert!(!fresh.members.contains_key("stale"));
        assert_eq!(fresh.version, 1);
        assert!(!fresh.scheduled);
    }

    #[tokio::test]
    async fn test_purge_removes_rows() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("g.db");
        let (now, clock) = manual_clock(1_000);
        let store = SqliteGroupStore::with_clock(&db_path, Duration::from_secs(30), clock).unwrap();

        store.append_member("a", record("e1"), &window(), TTL).await.unwrap();
        store.append_member("b", record("e1"), &window(), Duration::from_secs(600)).await.unwrap();
        now.store(1_000 + 61_000, Ordering::SeqCst);

        assert_eq!(store.purge_expired().await.unwrap(), 1);

        let conn = Connection::open(&db_path).unwrap();
        let members: i64 = conn
            .query_row("SELECT COUNT(*) FROM reducer_members", [], |row| row.get(0))
            .unwrap();
        assert_eq!(members, 1);
    }

    #[tokio::test]
    async fn test_undispatched_lists_completed_only() {
        let dir = tempdir().unwrap();
        let (_now, clock) = manual_clock(1_000);
        let store = SqliteGroupStore::with_clock(dir.path().join("g.db"), Duration::from_secs(30), clock).unwrap();

        let done = store.append_member("done", record("e1"), &window(), TTL).await.unwrap();
        store.append_member("open", record("e1"), &window(), TTL).await.unwrap();
        store.try_complete("done", done.version).await.unwrap();

        let pending = store.undispatched().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].group_id, "done");
        assert_eq!(pending[0].len(), 1);

        store.mark_dispatched("done").await.unwrap();
        assert!(store.undispatched().await.unwrap().is_empty());
    }
}
