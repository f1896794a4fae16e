use crate::error::ChartError;
use crate::market::reconciler::RetryPolicy;
use crate::market::types::Interval;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONTRACT_ID: &str = "BTCUSDT";
pub const DEFAULT_INTERVAL: Interval = Interval::M1;
pub const DEFAULT_PREFER_REALTIME: bool = true;
pub const DEFAULT_THROTTLE_WINDOW_MS: u64 = 50;
pub const THROTTLE_MAX_WAIT_FACTOR: u64 = 4;
pub const DEFAULT_RANGE_HYSTERESIS_PCT: f64 = 1.0;
pub const DEFAULT_RANGE_PADDING_PCT: f64 = 10.0;
pub const DEFAULT_VISIBLE_BARS: usize = 200;
pub const DEFAULT_HISTORY_LIMIT: usize = 5_000;
pub const DEFAULT_STARVATION_MULTIPLE: u32 = 3;
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const MIN_THROTTLE_WINDOW_MS: u64 = 1;
pub const MAX_THROTTLE_WINDOW_MS: u64 = 1_000;
pub const MAX_THROTTLE_MAX_WAIT_MS: u64 = 5_000;
pub const MAX_PERCENT: f64 = 100.0;
pub const MIN_BAR_WINDOW: usize = 1;
pub const MAX_BAR_WINDOW: usize = 10_000;
pub const MIN_STARVATION_MULTIPLE: u32 = 1;
pub const MAX_STARVATION_MULTIPLE: u32 = 100;
pub const MAX_RETRY_ATTEMPTS: u32 = 20;
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChartStreamArgs {
    pub contract_id: Option<String>,
    pub interval_ms: Option<i64>,
    pub prefer_realtime: Option<bool>,
    pub throttle_window_ms: Option<u64>,
    pub throttle_max_wait_ms: Option<u64>,
    pub range_hysteresis_pct: Option<f64>,
    pub range_padding_pct: Option<f64>,
    pub range_floor: Option<f64>,
    pub visible_bars: Option<usize>,
    pub history_limit: Option<usize>,
    pub starvation_multiple: Option<u32>,
    pub retry_initial_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub retry_max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartStreamConfig {
    pub contract_id: String,
    pub interval: Interval,
    pub prefer_realtime: bool,
    pub throttle_window: Duration,
    pub throttle_max_wait: Duration,
    pub range: RangeConfig,
    pub visible_bars: usize,
    pub history_limit: usize,
    pub starvation_multiple: u32,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeConfig {
    pub hysteresis_pct: f64,
    pub padding_pct: f64,
    pub floor: Option<f64>,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            hysteresis_pct: DEFAULT_RANGE_HYSTERESIS_PCT,
            padding_pct: DEFAULT_RANGE_PADDING_PCT,
            floor: None,
        }
    }
}

impl ChartStreamConfig {
    pub fn starvation_threshold_ms(&self) -> i64 {
        self.interval
            .duration_ms()
            .saturating_mul(i64::from(self.starvation_multiple))
    }
}

impl Default for ChartStreamConfig {
    fn default() -> Self {
        Self {
            contract_id: DEFAULT_CONTRACT_ID.to_string(),
            interval: DEFAULT_INTERVAL,
            prefer_realtime: DEFAULT_PREFER_REALTIME,
            throttle_window: Duration::from_millis(DEFAULT_THROTTLE_WINDOW_MS),
            throttle_max_wait: Duration::from_millis(
                DEFAULT_THROTTLE_WINDOW_MS * THROTTLE_MAX_WAIT_FACTOR,
            ),
            range: RangeConfig::default(),
            visible_bars: DEFAULT_VISIBLE_BARS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            starvation_multiple: DEFAULT_STARVATION_MULTIPLE,
            retry: RetryPolicy::default(),
        }
    }
}

fn normalize_percent(name: &str, value: Option<f64>, default: f64) -> Result<f64, ChartError> {
    let value = value.unwrap_or(default);
    if !value.is_finite() || !(0.0..=MAX_PERCENT).contains(&value) {
        return Err(ChartError::InvalidArgument(format!(
            "{name} must be a finite number between 0 and {MAX_PERCENT}"
        )));
    }
    Ok(value)
}

fn normalize_bar_window(name: &str, value: Option<usize>, default: usize) -> Result<usize, ChartError> {
    let value = value.unwrap_or(default);
    if !(MIN_BAR_WINDOW..=MAX_BAR_WINDOW).contains(&value) {
        return Err(ChartError::InvalidArgument(format!(
            "{name} must be between {MIN_BAR_WINDOW} and {MAX_BAR_WINDOW}"
        )));
    }
    Ok(value)
}

impl ChartStreamArgs {
    pub fn normalize(self) -> Result<ChartStreamConfig, ChartError> {
        let contract_id = self
            .contract_id
            .unwrap_or_else(|| DEFAULT_CONTRACT_ID.to_string())
            .trim()
            .to_ascii_uppercase();

        if contract_id.is_empty() || !contract_id.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(ChartError::InvalidArgument(
                "contractId must be non-empty alphanumeric ASCII".to_string(),
            ));
        }

        let interval = match self.interval_ms {
            Some(interval_ms) => Interval::from_millis(interval_ms)?,
            None => DEFAULT_INTERVAL,
        };

        let prefer_realtime = self.prefer_realtime.unwrap_or(DEFAULT_PREFER_REALTIME);

        let throttle_window_ms = self.throttle_window_ms.unwrap_or(DEFAULT_THROTTLE_WINDOW_MS);
        if !(MIN_THROTTLE_WINDOW_MS..=MAX_THROTTLE_WINDOW_MS).contains(&throttle_window_ms) {
            return Err(ChartError::InvalidArgument(format!(
                "throttleWindowMs must be between {MIN_THROTTLE_WINDOW_MS} and {MAX_THROTTLE_WINDOW_MS}"
            )));
        }

        let throttle_max_wait_ms = self
            .throttle_max_wait_ms
            .unwrap_or(throttle_window_ms * THROTTLE_MAX_WAIT_FACTOR);
        if !(throttle_window_ms..=MAX_THROTTLE_MAX_WAIT_MS).contains(&throttle_max_wait_ms) {
            return Err(ChartError::InvalidArgument(format!(
                "throttleMaxWaitMs must be between throttleWindowMs and {MAX_THROTTLE_MAX_WAIT_MS}"
            )));
        }

        let hysteresis_pct = normalize_percent(
            "rangeHysteresisPct",
            self.range_hysteresis_pct,
            DEFAULT_RANGE_HYSTERESIS_PCT,
        )?;
        let padding_pct = normalize_percent(
            "rangePaddingPct",
            self.range_padding_pct,
            DEFAULT_RANGE_PADDING_PCT,
        )?;
        if let Some(floor) = self.range_floor {
            if !floor.is_finite() {
                return Err(ChartError::InvalidArgument(
                    "rangeFloor must be finite".to_string(),
                ));
            }
        }

        let visible_bars =
            normalize_bar_window("visibleBars", self.visible_bars, DEFAULT_VISIBLE_BARS)?;
        let history_limit =
            normalize_bar_window("historyLimit", self.history_limit, DEFAULT_HISTORY_LIMIT)?;

        let starvation_multiple = self
            .starvation_multiple
            .unwrap_or(DEFAULT_STARVATION_MULTIPLE);
        if !(MIN_STARVATION_MULTIPLE..=MAX_STARVATION_MULTIPLE).contains(&starvation_multiple) {
            return Err(ChartError::InvalidArgument(format!(
                "starvationMultiple must be between {MIN_STARVATION_MULTIPLE} and {MAX_STARVATION_MULTIPLE}"
            )));
        }

        let retry_initial_delay_ms = self
            .retry_initial_delay_ms
            .unwrap_or(DEFAULT_RETRY_INITIAL_DELAY_MS);
        let retry_max_delay_ms = self.retry_max_delay_ms.unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS);
        if retry_initial_delay_ms == 0
            || retry_initial_delay_ms > retry_max_delay_ms
            || retry_max_delay_ms > MAX_RETRY_DELAY_MS
        {
            return Err(ChartError::InvalidArgument(format!(
                "retry delays must satisfy 0 < retryInitialDelayMs <= retryMaxDelayMs <= {MAX_RETRY_DELAY_MS}"
            )));
        }
        let retry_max_attempts = self
            .retry_max_attempts
            .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS);
        if retry_max_attempts > MAX_RETRY_ATTEMPTS {
            return Err(ChartError::InvalidArgument(format!(
                "retryMaxAttempts must be at most {MAX_RETRY_ATTEMPTS}"
            )));
        }

        Ok(ChartStreamConfig {
            contract_id,
            interval,
            prefer_realtime,
            throttle_window: Duration::from_millis(throttle_window_ms),
            throttle_max_wait: Duration::from_millis(throttle_max_wait_ms),
            range: RangeConfig {
                hysteresis_pct,
                padding_pct,
                floor: self.range_floor,
            },
            visible_bars,
            history_limit,
            starvation_multiple,
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(retry_initial_delay_ms),
                max_delay: Duration::from_millis(retry_max_delay_ms),
                multiplier: 2,
                max_attempts: retry_max_attempts,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_args_defaults() {
        let config = ChartStreamArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config, ChartStreamConfig::default());
        assert_eq!(config.contract_id, DEFAULT_CONTRACT_ID);
        assert_eq!(config.interval, Interval::M1);
        assert_eq!(config.throttle_window, Duration::from_millis(50));
        assert_eq!(config.throttle_max_wait, Duration::from_millis(200));
        assert_eq!(config.range.hysteresis_pct, 1.0);
        assert_eq!(config.range.padding_pct, 10.0);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.starvation_threshold_ms(), 180_000);
    }

    #[test]
    fn uppercases_and_validates_contract_id() {
        let config = ChartStreamArgs {
            contract_id: Some(" ethusdt ".to_string()),
            ..Default::default()
        }
        .normalize()
        .expect("lowercase symbol should be accepted");
        assert_eq!(config.contract_id, "ETHUSDT");

        let result = ChartStreamArgs {
            contract_id: Some("ETH/USDT".to_string()),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unsupported_interval() {
        let result = ChartStreamArgs {
            interval_ms: Some(120_000),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());

        let config = ChartStreamArgs {
            interval_ms: Some(604_800_000),
            ..Default::default()
        }
        .normalize()
        .expect("weekly interval should be supported");
        assert_eq!(config.interval, Interval::W1);
    }

    #[test]
    fn validates_throttle_window_range() {
        let result = ChartStreamArgs {
            throttle_window_ms: Some(0),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());

        let result = ChartStreamArgs {
            throttle_window_ms: Some(100),
            throttle_max_wait_ms: Some(50),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn validates_range_percentages() {
        let result = ChartStreamArgs {
            range_padding_pct: Some(f64::NAN),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());

        let result = ChartStreamArgs {
            range_hysteresis_pct: Some(-1.0),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn validates_retry_delays() {
        let result = ChartStreamArgs {
            retry_initial_delay_ms: Some(6_000),
            retry_max_delay_ms: Some(5_000),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn deserializes_camel_case_args() {
        let mut payload =
            br#"{"contractId":"solusdt","intervalMs":300000,"preferRealtime":false,"throttleWindowMs":16}"#
                .to_vec();
        let args: ChartStreamArgs =
            simd_json::serde::from_slice(&mut payload).expect("args payload should parse");
        let config = args.normalize().expect("args should normalize");

        assert_eq!(config.contract_id, "SOLUSDT");
        assert_eq!(config.interval, Interval::M5);
        assert!(!config.prefer_realtime);
        assert_eq!(config.throttle_window, Duration::from_millis(16));
    }
}
