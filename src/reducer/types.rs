//! Core data types shared by the store, evaluator and dispatcher

use super::strategy::StrategyDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Millisecond wall clock, injectable for deterministic tests
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Clock backed by `chrono::Utc::now()`
pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// Event payload as seen by the reducer.
///
/// Large payloads travel as references owned by an external cache; the
/// reducer never resolves them, it only carries them through to dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Inline(serde_json::Value),
    Reference(String),
}

impl Payload {
    /// Structured view used by predicate conditions (None for references)
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Inline(value) => Some(value),
            Payload::Reference(_) => None,
        }
    }
}

/// Raw event as delivered by the inbound transport.
///
/// Identifiers are optional at this layer so that malformed items can be
/// reported individually instead of failing the whole batch at decode time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub payload_ref: Option<String>,
}

impl InboundEvent {
    pub fn new(group_id: &str, event_id: &str, payload: serde_json::Value) -> Self {
        Self {
            group_id: Some(group_id.to_string()),
            event_id: Some(event_id.to_string()),
            payload,
            payload_ref: None,
        }
    }

    /// Payload reference takes precedence over the inline body
    pub fn into_payload(self) -> Payload {
        match self.payload_ref {
            Some(uri) => Payload::Reference(uri),
            None => Payload::Inline(self.payload),
        }
    }
}

/// Immutable snapshot of one correlated event at arrival time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub payload: Payload,
    pub arrived_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupState {
    Pending,
    Completed,
}

impl GroupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupState::Pending => "PENDING",
            GroupState::Completed => "COMPLETED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(GroupState::Pending),
            "COMPLETED" => Some(GroupState::Completed),
            _ => None,
        }
    }
}

/// Snapshot of an aggregation group as returned by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationGroup {
    pub group_id: String,
    pub strategy: StrategyDescriptor,
    pub state: GroupState,
    /// Keyed by event id; the key set is the dedup mechanism
    pub members: BTreeMap<String, EventRecord>,
    pub scheduled: bool,
    pub fire_at: Option<i64>,
    pub dispatched: bool,
    pub completed_at: Option<i64>,
    /// Bumped on every effective append, never on duplicates
    pub version: u64,
    pub created_at: i64,
    pub expires_at: i64,
}

impl AggregationGroup {
    pub fn new(
        group_id: &str,
        strategy: StrategyDescriptor,
        created_at: i64,
        expires_at: i64,
    ) -> Self {
        Self {
            group_id: group_id.to_string(),
            strategy,
            state: GroupState::Pending,
            members: BTreeMap::new(),
            scheduled: false,
            fire_at: None,
            dispatched: false,
            completed_at: None,
            version: 0,
            created_at,
            expires_at,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_pending(&self) -> bool {
        self.state == GroupState::Pending
    }

    /// Completed but undelivered for at least `grace_ms`.
    ///
    /// The grace keeps a redelivery from racing the CAS winner's own dispatch.
    pub fn redispatch_due(&self, now: i64, grace_ms: u64) -> bool {
        self.state == GroupState::Completed
            && !self.dispatched
            && self
                .completed_at
                .map_or(true, |completed_at| now - completed_at >= grace_ms as i64)
    }

    /// Member records in event id order
    pub fn member_records(&self) -> Vec<EventRecord> {
        self.members.values().cloned().collect()
    }

    /// Stable idempotency key for downstream delivery.
    ///
    /// Includes the creation time so a group recreated after expiry gets a
    /// distinct key from the stale one.
    pub fn dispatch_id(&self) -> String {
        format!("{}#{}", self.group_id, self.created_at)
    }
}

/// Single aggregated output released downstream once per group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedEvent {
    pub dispatch_id: String,
    pub group_id: String,
    pub reason: String,
    pub strategy: StrategyDescriptor,
    pub member_count: usize,
    pub members: Vec<EventRecord>,
    pub created_at: i64,
    pub completed_at: i64,
}

impl AggregatedEvent {
    pub fn from_group(group: &AggregationGroup, reason: &str, completed_at: i64) -> Self {
        let members = group.member_records();
        Self {
            dispatch_id: group.dispatch_id(),
            group_id: group.group_id.clone(),
            reason: reason.to_string(),
            strategy: group.strategy.clone(),
            member_count: members.len(),
            members,
            created_at: group.created_at,
            completed_at,
        }
    }
}
