use crate::error::{ChartError, ValidationError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Interval {
    pub const ALL: [Self; 8] = [
        Self::M1,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
        Self::W1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::M30 => 1_800_000,
            Self::H1 => 3_600_000,
            Self::H4 => 14_400_000,
            Self::D1 => 86_400_000,
            Self::W1 => 604_800_000,
        }
    }

    pub fn from_millis(interval_ms: i64) -> Result<Self, ChartError> {
        Self::ALL
            .into_iter()
            .find(|interval| interval.duration_ms() == interval_ms)
            .ok_or_else(|| {
                ChartError::InvalidArgument(format!(
                    "intervalMs {interval_ms} is not a supported bar interval"
                ))
            })
    }

    pub fn parse_str(value: &str) -> Result<Self, ChartError> {
        let trimmed = value.trim();
        Self::ALL
            .into_iter()
            .find(|interval| interval.as_str() == trimmed)
            .ok_or_else(|| ChartError::InvalidArgument(format!("unknown interval '{trimmed}'")))
    }

    pub fn bucket_open_time(self, timestamp_ms: i64) -> i64 {
        bucket_open_time(timestamp_ms, self.duration_ms())
    }
}

pub fn bucket_open_time(timestamp_ms: i64, interval_ms: i64) -> i64 {
    if interval_ms <= 0 {
        return timestamp_ms;
    }
    timestamp_ms - timestamp_ms.rem_euclid(interval_ms)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub contract_id: String,
    pub timestamp: i64,
    pub price: f64,
    pub volume: f64,
    /// Venue sequence number, when the feed provides one.
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl Tick {
    pub fn new(contract_id: impl Into<String>, timestamp: i64, price: f64, volume: f64) -> Self {
        Self {
            contract_id: contract_id.into(),
            timestamp,
            price,
            volume,
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(ValidationError::InvalidPrice { price: self.price });
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(ValidationError::InvalidVolume {
                volume: self.volume,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub open_time: i64,
    pub interval_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_partial: bool,
}

impl Bar {
    pub fn from_tick(open_time: i64, interval_ms: i64, price: f64, volume: f64) -> Self {
        Self {
            open_time,
            interval_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            is_partial: true,
        }
    }

    pub fn apply_tick(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }

    pub fn close_time(&self) -> i64 {
        self.open_time.saturating_add(self.interval_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let values = [self.open, self.high, self.low, self.close];
        if values.iter().any(|value| !value.is_finite() || *value <= 0.0) {
            return Err(ValidationError::MalformedBar {
                open_time: self.open_time,
            });
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(ValidationError::InvalidVolume {
                volume: self.volume,
            });
        }
        if self.high < self.open.max(self.close).max(self.low)
            || self.low > self.open.min(self.close).min(self.high)
        {
            return Err(ValidationError::MalformedBar {
                open_time: self.open_time,
            });
        }
        if self.interval_ms <= 0 || self.open_time.rem_euclid(self.interval_ms) != 0 {
            return Err(ValidationError::MisalignedBar {
                open_time: self.open_time,
                interval_ms: self.interval_ms,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarUpdateKind {
    NewBar,
    UpdateBar,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BarUpdateEvent {
    pub contract_id: String,
    pub bar: Bar,
    pub kind: BarUpdateKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationState {
    HistoricalOnly,
    Loading,
    Hybrid,
    LiveOnly,
    Error,
}

impl ReconciliationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HistoricalOnly => "HISTORICAL_ONLY",
            Self::Loading => "LOADING",
            Self::Hybrid => "HYBRID",
            Self::LiveOnly => "LIVE_ONLY",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DisplayRange {
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeUpdate {
    Changed(DisplayRange),
    NoChange,
}

/// Immutable view of one series. Completed bars are shared, never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSnapshot {
    pub contract_id: String,
    pub interval_ms: i64,
    pub completed_bars: Arc<Vec<Bar>>,
    pub current_partial: Option<Bar>,
}

impl SeriesSnapshot {
    pub fn empty(contract_id: impl Into<String>, interval_ms: i64) -> Self {
        Self {
            contract_id: contract_id.into(),
            interval_ms,
            completed_bars: Arc::new(Vec::new()),
            current_partial: None,
        }
    }

    pub fn len(&self) -> usize {
        self.completed_bars.len() + usize::from(self.current_partial.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_bar(&self) -> Option<&Bar> {
        self.current_partial
            .as_ref()
            .or_else(|| self.completed_bars.last())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bar> + '_ {
        self.completed_bars
            .iter()
            .chain(self.current_partial.iter())
    }

    /// The newest `count` bars, oldest first.
    pub fn visible(&self, count: usize) -> impl Iterator<Item = &Bar> + '_ {
        let partial_slots = usize::from(self.current_partial.is_some());
        let completed_count = count.saturating_sub(partial_slots);
        let start = self.completed_bars.len().saturating_sub(completed_count);
        self.completed_bars[start..]
            .iter()
            .chain(self.current_partial.iter())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartFrame {
    pub snapshot: SeriesSnapshot,
    pub range: Option<DisplayRange>,
    pub state: ReconciliationState,
    pub last_event: Option<BarUpdateEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: ReconciliationState,
    pub contract_id: String,
    pub interval: Interval,
    pub last_tick_time: Option<i64>,
    pub late_ticks: u64,
    pub reason: Option<String>,
}

impl SessionStatus {
    pub fn idle(contract_id: String, interval: Interval, reason: Option<String>) -> Self {
        Self {
            state: ReconciliationState::HistoricalOnly,
            contract_id,
            interval,
            last_tick_time: None,
            late_ticks: 0,
            reason,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AggTradeWire {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "a")]
    pub aggregate_trade_id: u64,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "T")]
    pub trade_time: i64,
}

impl TryFrom<AggTradeWire> for Tick {
    type Error = ChartError;

    fn try_from(value: AggTradeWire) -> Result<Self, Self::Error> {
        if value.event_type != "aggTrade" {
            return Err(ChartError::InvalidArgument(format!(
                "unexpected event type '{}' for aggTrade stream",
                value.event_type
            )));
        }

        let price = value.price.parse::<f64>()?;
        let quantity = value.quantity.parse::<f64>()?;

        Ok(Tick::new(value.symbol, value.trade_time, price, quantity)
            .with_sequence(value.aggregate_trade_id))
    }
}

pub fn parse_agg_trade_payload(payload: &mut [u8]) -> Result<Tick, ChartError> {
    let wire: AggTradeWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct KlineWire(
    pub i64,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub i64,
    pub String,
    pub u64,
    pub String,
    pub String,
    pub String,
);

impl KlineWire {
    pub fn into_bar(self, interval_ms: i64) -> Result<Bar, ChartError> {
        let open = self.1.parse::<f64>()?;
        let high = self.2.parse::<f64>()?;
        let low = self.3.parse::<f64>()?;
        let close = self.4.parse::<f64>()?;
        let volume = self.5.parse::<f64>()?;

        let bar = Bar {
            open_time: self.0,
            interval_ms,
            open,
            high,
            low,
            close,
            volume,
            is_partial: false,
        };
        bar.validate()?;
        Ok(bar)
    }
}
