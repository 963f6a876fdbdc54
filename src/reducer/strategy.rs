//! Completion strategies
//!
//! A strategy decides when an aggregation group is complete. Strategies are
//! stateless: everything they look at lives in the group snapshot, and the
//! serializable `StrategyDescriptor` is persisted with the group so the
//! executable form can be rebuilt after a restart.
//!
//! - `StaticCount(n)` - complete once the group holds `n` distinct events
//! - `TimeWindow(d, jitter)` - complete once, at `created_at + d + U(0, jitter)`
//! - `Predicate(condition, timeout)` - complete when a named condition over the
//!   accumulated members returns true within its timeout

use super::conditions::{Condition, ConditionRegistry};
use super::error::ReducerError;
use super::sandbox::run_condition;
use super::types::AggregationGroup;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_PREDICATE_TIMEOUT_MS: u64 = 10_000;

/// Persisted policy description, bound to a group at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyDescriptor {
    StaticCount {
        count: usize,
    },
    TimeWindow {
        window_ms: u64,
        jitter_ms: u64,
    },
    Predicate {
        condition: String,
        timeout_ms: u64,
        #[serde(default)]
        backstop_ms: Option<u64>,
    },
}

impl StrategyDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            StrategyDescriptor::StaticCount { .. } => "static_count",
            StrategyDescriptor::TimeWindow { .. } => "time_window",
            StrategyDescriptor::Predicate { .. } => "predicate",
        }
    }
}

/// What caused an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Append,
    Timer,
}

/// Tagged evaluation result; strategies never signal through panics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Complete { reason: String },
    NotComplete,
    Error(String),
}

impl Evaluation {
    pub fn complete(reason: impl Into<String>) -> Self {
        Evaluation::Complete {
            reason: reason.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Evaluation::Complete { .. })
    }
}

#[derive(Clone)]
pub struct PredicateStrategy {
    pub name: String,
    pub condition: Condition,
    pub timeout: Duration,
    /// Forces completion this long after creation if the condition never holds
    pub backstop: Option<Duration>,
}

#[derive(Clone)]
pub enum Strategy {
    StaticCount(usize),
    TimeWindow { window: Duration, jitter: Duration },
    Predicate(PredicateStrategy),
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.describe())
    }
}

impl Strategy {
    /// Rebuild the executable strategy from its persisted descriptor
    pub fn from_descriptor(
        descriptor: &StrategyDescriptor,
        conditions: &ConditionRegistry,
    ) -> Result<Self, ReducerError> {
        match descriptor {
            StrategyDescriptor::StaticCount { count } => {
                if *count == 0 {
                    return Err(ReducerError::Strategy(
                        "static_count requires a count of at least 1".to_string(),
                    ));
                }
                Ok(Strategy::StaticCount(*count))
            }
            StrategyDescriptor::TimeWindow {
                window_ms,
                jitter_ms,
            } => Ok(Strategy::TimeWindow {
                window: Duration::from_millis(*window_ms),
                jitter: Duration::from_millis(*jitter_ms),
            }),
            StrategyDescriptor::Predicate {
                condition,
                timeout_ms,
                backstop_ms,
            } => {
                let resolved = conditions.get(condition).ok_or_else(|| {
                    ReducerError::Strategy(format!("Unknown condition: {}", condition))
                })?;
                Ok(Strategy::Predicate(PredicateStrategy {
                    name: condition.clone(),
                    condition: resolved,
                    timeout: Duration::from_millis(*timeout_ms),
                    backstop: backstop_ms.map(Duration::from_millis),
                }))
            }
        }
    }

    pub fn describe(&self) -> StrategyDescriptor {
        match self {
            Strategy::StaticCount(count) => StrategyDescriptor::StaticCount { count: *count },
            Strategy::TimeWindow { window, jitter } => StrategyDescriptor::TimeWindow {
                window_ms: window.as_millis() as u64,
                jitter_ms: jitter.as_millis() as u64,
            },
            Strategy::Predicate(p) => StrategyDescriptor::Predicate {
                condition: p.name.clone(),
                timeout_ms: p.timeout.as_millis() as u64,
                backstop_ms: p.backstop.map(|b| b.as_millis() as u64),
            },
        }
    }

    /// Whether a delayed check must be armed after this append.
    ///
    /// Timer strategies arm once per group; later appends never rearm.
    pub fn on_append(&self, group: &AggregationGroup) -> bool {
        match self {
            Strategy::StaticCount(_) => false,
            Strategy::TimeWindow { .. } => !group.scheduled,
            Strategy::Predicate(p) => p.backstop.is_some() && !group.scheduled,
        }
    }

    /// Whether appends evaluate inline (as opposed to waiting for a timer)
    pub fn evaluates_on_append(&self) -> bool {
        !matches!(self, Strategy::TimeWindow { .. })
    }

    /// Absolute fire time for timer-armed strategies.
    ///
    /// Jitter is drawn here, once, uniformly over `[0, jitter]`.
    pub fn fire_at<R: Rng + ?Sized>(&self, group: &AggregationGroup, rng: &mut R) -> Option<i64> {
        match self {
            Strategy::StaticCount(_) => None,
            Strategy::TimeWindow { window, jitter } => {
                let jitter_ms = jitter.as_millis() as i64;
                let offset = if jitter_ms > 0 {
                    rng.gen_range(0..=jitter_ms)
                } else {
                    0
                };
                Some(group.created_at + window.as_millis() as i64 + offset)
            }
            Strategy::Predicate(p) => p
                .backstop
                .map(|backstop| group.created_at + backstop.as_millis() as i64),
        }
    }

    pub async fn evaluate(&self, group: &AggregationGroup, trigger: Trigger) -> Evaluation {
        match self {
            Strategy::StaticCount(count) => {
                if group.len() >= *count {
                    Evaluation::complete(format!("received {} of {} events", group.len(), count))
                } else {
                    Evaluation::NotComplete
                }
            }
            Strategy::TimeWindow { window, .. } => match trigger {
                Trigger::Timer => Evaluation::complete(format!(
                    "time window of {}ms elapsed",
                    window.as_millis()
                )),
                Trigger::Append => Evaluation::NotComplete,
            },
            Strategy::Predicate(p) => {
                let verdict = run_condition(
                    &p.name,
                    p.condition.clone(),
                    group.member_records(),
                    p.timeout,
                )
                .await;

                match (trigger, verdict) {
                    (Trigger::Timer, Evaluation::NotComplete) | (Trigger::Timer, Evaluation::Error(_)) => {
                        Evaluation::complete("backstop elapsed")
                    }
                    (_, verdict) => verdict,
                }
            }
        }
    }
}
