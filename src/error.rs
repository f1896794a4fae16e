use crate::market::types::Bar;
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("session task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<tokio_tungstenite::tungstenite::Error> for ChartError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

/// Malformed tick or bar. Always recovered locally by dropping the input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("price must be finite and positive, got {price}")]
    InvalidPrice { price: f64 },
    #[error("volume must be finite and non-negative, got {volume}")]
    InvalidVolume { volume: f64 },
    #[error("tick for '{found}' routed to series of '{expected}'")]
    ContractMismatch { expected: String, found: String },
    #[error("bar at {open_time} violates OHLC bounds")]
    MalformedBar { open_time: i64 },
    #[error("bar at {open_time} is not aligned to {interval_ms}ms buckets")]
    MisalignedBar { open_time: i64, interval_ms: i64 },
    #[error("bar interval {found}ms does not match series interval {expected}ms")]
    IntervalMismatch { expected: i64, found: i64 },
    #[error("bar at {open_time} does not follow previous bar at {previous}")]
    UnorderedBar { open_time: i64, previous: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("subscribe to '{contract_id}' failed: {reason}")]
    Connect { contract_id: String, reason: String },
    #[error("subscribe to '{contract_id}' gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        contract_id: String,
        attempts: u32,
        last_error: String,
    },
    #[error("subscription to '{contract_id}' was cancelled")]
    Cancelled { contract_id: String },
}

impl SubscriptionError {
    pub fn connect(contract_id: &str, reason: impl Display) -> Self {
        Self::Connect {
            contract_id: contract_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Cancelled { .. })
    }
}

/// Historical and live bars disagreed at the switch boundary; the live bar was kept.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationConflict {
    pub contract_id: String,
    pub open_time: i64,
    pub historical: Bar,
    pub live: Bar,
}

/// Advisory only: the feed has been silent for longer than the configured threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StarvationWarning {
    pub contract_id: String,
    pub last_tick_time: Option<i64>,
    pub silent_ms: i64,
    pub threshold_ms: i64,
}

impl Display for StarvationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "no ticks for '{}' in {}ms (threshold {}ms)",
            self.contract_id, self.silent_ms, self.threshold_ms
        )
    }
}
