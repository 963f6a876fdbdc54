//! Named predicate conditions
//!
//! Predicate strategies reference their condition by name so the descriptor
//! stays serializable. The registry maps names to compiled callables and is
//! populated at deploy time; `with_builtins()` adds the stock conditions.

use super::types::EventRecord;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Compiled completion condition over the accumulated members.
///
/// Must be order-independent: members arrive in no particular order.
pub type Condition = Arc<dyn Fn(&[EventRecord]) -> Result<bool, String> + Send + Sync>;

/// Wrap a closure as a `Condition`
pub fn condition_fn<F>(f: F) -> Condition
where
    F: Fn(&[EventRecord]) -> Result<bool, String> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone, Default)]
pub struct ConditionRegistry {
    conditions: HashMap<String, Condition>,
}

impl ConditionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with `all_chunks_present` and `final_marker`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("all_chunks_present", condition_fn(all_chunks_present));
        registry.register("final_marker", condition_fn(final_marker));
        registry
    }

    pub fn register(&mut self, name: &str, condition: Condition) {
        self.conditions.insert(name.to_string(), condition);
    }

    pub fn get(&self, name: &str) -> Option<Condition> {
        self.conditions.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.conditions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Complete once every chunk of a split document has arrived.
///
/// Each payload must carry `chunk_index` and `chunk_count`; members that
/// disagree on `chunk_count` are an error.
pub fn all_chunks_present(members: &[EventRecord]) -> Result<bool, String> {
    let mut expected: Option<u64> = None;
    let mut seen = HashSet::new();

    for member in members {
        let payload = member
            .payload
            .as_json()
            .ok_or_else(|| format!("event {} has no inline payload", member.event_id))?;

        let index = payload
            .get("chunk_index")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| format!("event {} is missing chunk_index", member.event_id))?;
        let count = payload
            .get("chunk_count")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| format!("event {} is missing chunk_count", member.event_id))?;

        match expected {
            Some(c) if c != count => {
                return Err(format!(
                    "event {} reports chunk_count {} but group expects {}",
                    member.event_id, count, c
                ));
            }
            _ => expected = Some(count),
        }

        if index < count {
            seen.insert(index);
        }
    }

    Ok(matches!(expected, Some(count) if seen.len() as u64 == count))
}

/// Complete once any member is flagged `"final": true`
pub fn final_marker(members: &[EventRecord]) -> Result<bool, String> {
    Ok(members.iter().any(|m| {
        m.payload
            .as_json()
            .and_then(|p| p.get("final"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::types::Payload;
    use serde_json::json;

    fn chunk(id: &str, index: u64, count: u64) -> EventRecord {
        EventRecord {
            event_id: id.to_string(),
            payload: Payload::Inline(json!({ "chunk_index": index, "chunk_count": count })),
            arrived_at: 0,
        }
    }

    #[test]
    fn test_all_chunks_present_is_order_independent() {
        let partial = vec![chunk("c2", 2, 3), chunk("c0", 0, 3)];
        assert_eq!(all_chunks_present(&partial), Ok(false));

        let full = vec![chunk("c2", 2, 3), chunk("c0", 0, 3), chunk("c1", 1, 3)];
        assert_eq!(all_chunks_present(&full), Ok(true));
    }

    #[test]
    fn test_all_chunks_present_rejects_inconsistent_counts() {
        let members = vec![chunk("a", 0, 2), chunk("b", 1, 3)];
        assert!(all_chunks_present(&members).is_err());
    }

    #[test]
    fn test_all_chunks_present_requires_fields() {
        let members = vec![EventRecord {
            event_id: "x".to_string(),
            payload: Payload::Inline(json!({ "text": "hello" })),
            arrived_at: 0,
        }];
        assert!(all_chunks_present(&members).is_err());
        assert_eq!(all_chunks_present(&[]), Ok(false));
    }

    #[test]
    fn test_final_marker() {
        let mut members = vec![EventRecord {
            event_id: "a".to_string(),
            payload: Payload::Reference("s3://bucket/a".to_string()),
            arrived_at: 0,
        }];
        assert_eq!(final_marker(&members), Ok(false));

        members.push(EventRecord {
            event_id: "b".to_string(),
            payload: Payload::Inline(json!({ "final": true })),
            arrived_at: 0,
        });
        assert_eq!(final_marker(&members), Ok(true));
    }

    #[test]
    fn test_builtin_registry() {
        let registry = ConditionRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["all_chunks_present", "final_marker"]);
        assert!(registry.get("unknown").is_none());
    }
}
