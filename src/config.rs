//! Reducer configuration from environment variables
//!
//! Every variable is optional except the ones a chosen strategy needs
//! (`REDUCER_EVENT_COUNT` for `static_count`, `REDUCER_CONDITION` for
//! `predicate`). A variable that is set but unparsable is an error rather
//! than a silent fallback to the default.

use crate::reducer::ingestion::DEFAULT_REDISPATCH_GRACE_MS;
use crate::reducer::strategy::{StrategyDescriptor, DEFAULT_PREDICATE_TIMEOUT_MS};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(ConfigError::InvalidValue(format!(
                "REDUCER_STORE must be sqlite or memory, got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReducerConfig {
    /// SQLite database file (ignored for the memory store)
    pub db_path: String,
    pub store: StoreBackend,
    /// JSON lines file receiving aggregated events
    pub output_path: String,

    pub channel_buffer: usize,
    pub batch_size: usize,
    pub batch_window_ms: u64,
    pub workers: usize,

    pub group_ttl_secs: u64,
    /// How long completed groups linger to absorb redelivered events
    pub completed_retention_secs: u64,
    pub sweep_interval_ms: u64,
    /// Age a completed-but-undelivered group must reach before it is
    /// re-dispatched by redelivery or the sweeper
    pub redispatch_grace_ms: u64,

    /// Strategy bound to every group created by this process
    pub strategy: StrategyDescriptor,

    pub dispatch_max_retries: u32,
    pub dispatch_backoff_ms: u64,
    pub schedule_max_retries: u32,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            db_path: "data/reducer.db".to_string(),
            store: StoreBackend::Sqlite,
            output_path: "streams/reducer/aggregated.jsonl".to_string(),
            channel_buffer: 10_000,
            batch_size: 100,
            batch_window_ms: 250,
            workers: 4,
            group_ttl_secs: 3_600,
            completed_retention_secs: 86_400,
            sweep_interval_ms: 30_000,
            redispatch_grace_ms: DEFAULT_REDISPATCH_GRACE_MS,
            strategy: StrategyDescriptor::TimeWindow {
                window_ms: 60_000,
                jitter_ms: 0,
            },
            dispatch_max_retries: 5,
            dispatch_backoff_ms: 200,
            schedule_max_retries: 3,
        }
    }
}

impl ReducerConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `REDUCER_DB_PATH` (default: data/reducer.db)
    /// - `REDUCER_STORE` (default: sqlite)
    /// - `REDUCER_OUTPUT_PATH` (default: streams/reducer/aggregated.jsonl)
    /// - `REDUCER_CHANNEL_BUFFER` (default: 10000)
    /// - `REDUCER_BATCH_SIZE` (default: 100)
    /// - `REDUCER_BATCH_WINDOW_MS` (default: 250)
    /// - `REDUCER_WORKERS` (default: 4)
    /// - `REDUCER_GROUP_TTL_SECS` (default: 3600)
    /// - `REDUCER_COMPLETED_RETENTION_SECS` (default: 86400)
    /// - `REDUCER_SWEEP_INTERVAL_MS` (default: 30000)
    /// - `REDUCER_REDISPATCH_GRACE_MS` (default: 60000)
    /// - `REDUCER_STRATEGY` (default: time_window)
    /// - `REDUCER_EVENT_COUNT`, `REDUCER_TIME_WINDOW_MS` (default: 60000),
    ///   `REDUCER_JITTER_MS` (default: 0), `REDUCER_CONDITION`,
    ///   `REDUCER_PREDICATE_TIMEOUT_MS` (default: 10000),
    ///   `REDUCER_PREDICATE_BACKSTOP_MS`
    /// - `REDUCER_DISPATCH_MAX_RETRIES` (default: 5)
    /// - `REDUCER_DISPATCH_BACKOFF_MS` (default: 200)
    /// - `REDUCER_SCHEDULE_MAX_RETRIES` (default: 3)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            db_path: env::var("REDUCER_DB_PATH").unwrap_or(defaults.db_path),
            store: parse_var("REDUCER_STORE", defaults.store)?,
            output_path: env::var("REDUCER_OUTPUT_PATH").unwrap_or(defaults.output_path),
            channel_buffer: parse_var("REDUCER_CHANNEL_BUFFER", defaults.channel_buffer)?,
            batch_size: parse_var("REDUCER_BATCH_SIZE", defaults.batch_size)?,
            batch_window_ms: parse_var("REDUCER_BATCH_WINDOW_MS", defaults.batch_window_ms)?,
            workers: parse_var("REDUCER_WORKERS", defaults.workers)?,
            group_ttl_secs: parse_var("REDUCER_GROUP_TTL_SECS", defaults.group_ttl_secs)?,
            completed_retention_secs: parse_var(
                "REDUCER_COMPLETED_RETENTION_SECS",
                defaults.completed_retention_secs,
            )?,
            sweep_interval_ms: parse_var("REDUCER_SWEEP_INTERVAL_MS", defaults.sweep_interval_ms)?,
            redispatch_grace_ms: parse_var("REDUCER_REDISPATCH_GRACE_MS", defaults.redispatch_grace_ms)?,
            strategy: strategy_from_env()?,
            dispatch_max_retries: parse_var(
                "REDUCER_DISPATCH_MAX_RETRIES",
                defaults.dispatch_max_retries,
            )?,
            dispatch_backoff_ms: parse_var("REDUCER_DISPATCH_BACKOFF_MS", defaults.dispatch_backoff_ms)?,
            schedule_max_retries: parse_var(
                "REDUCER_SCHEDULE_MAX_RETRIES",
                defaults.schedule_max_retries,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("REDUCER_CHANNEL_BUFFER", self.channel_buffer as u64),
            ("REDUCER_BATCH_SIZE", self.batch_size as u64),
            ("REDUCER_WORKERS", self.workers as u64),
            ("REDUCER_GROUP_TTL_SECS", self.group_ttl_secs),
            ("REDUCER_SWEEP_INTERVAL_MS", self.sweep_interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} must be greater than 0", name)));
            }
        }

        match &self.strategy {
            StrategyDescriptor::StaticCount { count: 0 } => Err(ConfigError::InvalidValue(
                "REDUCER_EVENT_COUNT must be at least 1".to_string(),
            )),
            StrategyDescriptor::Predicate { condition, .. } if condition.trim().is_empty() => Err(
                ConfigError::InvalidValue("REDUCER_CONDITION must not be empty".to_string()),
            ),
            _ => Ok(()),
        }
    }

    pub fn group_ttl(&self) -> Duration {
        Duration::from_secs(self.group_ttl_secs)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}={} could not be parsed", name, raw))),
        Err(_) => Ok(default),
    }
}

fn optional_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{}={} could not be parsed", name, raw))),
        Err(_) => Ok(None),
    }
}

fn strategy_from_env() -> Result<StrategyDescriptor, ConfigError> {
    let kind = env::var("REDUCER_STRATEGY").unwrap_or_else(|_| "time_window".to_string());

    match kind.to_lowercase().as_str() {
        "static_count" => {
            let count = optional_var("REDUCER_EVENT_COUNT")?
                .ok_or_else(|| ConfigError::MissingVariable("REDUCER_EVENT_COUNT".to_string()))?;
            Ok(StrategyDescriptor::StaticCount { count })
        }
        "time_window" => Ok(StrategyDescriptor::TimeWindow {
            window_ms: parse_var("REDUCER_TIME_WINDOW_MS", 60_000)?,
            jitter_ms: parse_var("REDUCER_JITTER_MS", 0)?,
        }),
        "predicate" => {
            let condition = env::var("REDUCER_CONDITION")
                .map_err(|_| ConfigError::MissingVariable("REDUCER_CONDITION".to_string()))?;
            Ok(StrategyDescriptor::Predicate {
                condition,
                timeout_ms: parse_var("REDUCER_PREDICATE_TIMEOUT_MS", DEFAULT_PREDICATE_TIMEOUT_MS)?,
                backstop_ms: optional_var("REDUCER_PREDICATE_BACKSTOP_MS")?,
            })
        }
        other => Err(ConfigError::InvalidValue(format!(
            "REDUCER_STRATEGY must be static_count, time_window or predicate, got {}",
            other
        ))),
    }
}
