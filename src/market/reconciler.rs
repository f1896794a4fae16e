use crate::error::{ReconciliationConflict, SubscriptionError, ValidationError};
use crate::market::aggregator::BarAggregator;
use crate::market::feed::{TickFeed, TickStream};
use crate::market::types::{Bar, Interval, ReconciliationState, SeriesSnapshot};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Backoff for subscription failures: `initial_delay * multiplier^retry`, capped
/// at `max_delay`, for at most `max_attempts` retries after the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(5_000),
            multiplier: 2,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry >= self.max_attempts {
            return None;
        }
        let scale = self.multiplier.max(1).saturating_pow(retry);
        let delay = self.initial_delay.saturating_mul(scale);
        Some(delay.min(self.max_delay))
    }

    /// Same curve as `delay_for` without the attempt limit; saturates at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let scale = self.multiplier.max(1).saturating_pow(retry);
        self.initial_delay.saturating_mul(scale).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedSeries {
    pub snapshot: SeriesSnapshot,
    pub retained_historical: usize,
    pub conflicts: Vec<ReconciliationConflict>,
}

/// Drops historical bars that are malformed, belong to another interval, or
/// break strict open-time ordering.
pub fn sanitize_history(contract_id: &str, interval: Interval, bars: Vec<Bar>) -> Vec<Bar> {
    let interval_ms = interval.duration_ms();
    let mut accepted: Vec<Bar> = Vec::with_capacity(bars.len());

    for mut bar in bars {
        let verdict = if bar.interval_ms != interval_ms {
            Err(ValidationError::IntervalMismatch {
                expected: interval_ms,
                found: bar.interval_ms,
            })
        } else {
            bar.validate()
        };
        let verdict = verdict.and_then(|()| match accepted.last() {
            Some(previous) if bar.open_time <= previous.open_time => {
                Err(ValidationError::UnorderedBar {
                    open_time: bar.open_time,
                    previous: previous.open_time,
                })
            }
            _ => Ok(()),
        });

        match verdict {
            Ok(()) => {
                bar.is_partial = false;
                accepted.push(bar);
            }
            Err(error) => {
                warn!(contract = %contract_id, %error, "discarding historical bar");
            }
        }
    }

    accepted
}

/// Live bars are authoritative from the first live open time onward.
pub fn merge_series(historical: &[Bar], live: &SeriesSnapshot, history_limit: usize) -> MergedSeries {
    let live_first = live
        .completed_bars
        .first()
        .or(live.current_partial.as_ref())
        .map(|bar| bar.open_time);
    let split = match live_first {
        Some(boundary) => historical.partition_point(|bar| bar.open_time < boundary),
        None => historical.len(),
    };

    let conflicts = historical[split..]
        .iter()
        .filter_map(|historical_bar| {
            find_live_bar(live, historical_bar.open_time).map(|live_bar| ReconciliationConflict {
                contract_id: live.contract_id.clone(),
                open_time: historical_bar.open_time,
                historical: *historical_bar,
                live: live_bar,
            })
        })
        .collect();

    let partial_slots = usize::from(live.current_partial.is_some());
    let capacity = history_limit.saturating_sub(partial_slots);
    let total = split + live.completed_bars.len();
    let trim = total.saturating_sub(capacity);
    let historical_trim = trim.min(split);
    let live_trim = trim - historical_trim;

    let mut completed = Vec::with_capacity(total - trim);
    completed.extend_from_slice(&historical[historical_trim..split]);
    completed.extend_from_slice(&live.completed_bars[live_trim..]);

    MergedSeries {
        snapshot: SeriesSnapshot {
            contract_id: live.contract_id.clone(),
            interval_ms: live.interval_ms,
            completed_bars: Arc::new(completed),
            current_partial: live.current_partial,
        },
        retained_historical: split - historical_trim,
        conflicts,
    }
}

fn find_live_bar(live: &SeriesSnapshot, open_time: i64) -> Option<Bar> {
    if let Some(partial) = live.current_partial {
        if partial.open_time == open_time {
            return Some(partial);
        }
    }
    live.completed_bars
        .binary_search_by_key(&open_time, |bar| bar.open_time)
        .ok()
        .map(|index| live.completed_bars[index])
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MergeKey {
    history_version: u64,
    live_first: Option<i64>,
    live_completed: usize,
    partial_present: bool,
}

#[derive(Debug, Clone)]
struct MergeCache {
    key: MergeKey,
    completed: Arc<Vec<Bar>>,
    retained_historical: usize,
}

/// Owns the historical snapshot and the HISTORICAL_ONLY → LOADING → HYBRID →
/// LIVE_ONLY transitions for one contract.
#[derive(Debug)]
pub struct SeriesReconciler {
    contract_id: String,
    interval: Interval,
    history_limit: usize,
    retry: RetryPolicy,
    state: ReconciliationState,
    historical: Arc<Vec<Bar>>,
    historical_loaded: bool,
    history_version: u64,
    reported_conflicts: BTreeSet<i64>,
    conflict_count: u64,
    cache: Option<MergeCache>,
    cancel_token: CancellationToken,
}

impl SeriesReconciler {
    pub fn new(
        contract_id: impl Into<String>,
        interval: Interval,
        history_limit: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            contract_id: contract_id.into(),
            interval,
            history_limit: history_limit.max(1),
            retry,
            state: ReconciliationState::HistoricalOnly,
            historical: Arc::new(Vec::new()),
            historical_loaded: false,
            history_version: 0,
            reported_conflicts: BTreeSet::new(),
            conflict_count: 0,
            cache: None,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn state(&self) -> ReconciliationState {
        self.state
    }

    pub fn contract_id(&self) -> &str {
        &self.contract_id
    }

    pub fn historical_bars(&self) -> &[Bar] {
        &self.historical
    }

    pub fn historical_loaded(&self) -> bool {
        self.historical_loaded
    }

    pub fn conflict_count(&self) -> u64 {
        self.conflict_count
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Returns `true` only for the call that actually cancelled.
    pub fn unsubscribe(&self) -> bool {
        if self.cancel_token.is_cancelled() {
            return false;
        }
        self.cancel_token.cancel();
        true
    }

    pub fn request_subscription(&mut self) -> ReconciliationState {
        if matches!(
            self.state,
            ReconciliationState::HistoricalOnly | ReconciliationState::Error
        ) {
            self.transition(ReconciliationState::Loading);
        }
        self.state
    }

    pub fn mark_failed(&mut self) {
        self.transition(ReconciliationState::Error);
    }

    pub fn load_historical(&mut self, bars: Vec<Bar>) -> usize {
        let accepted = sanitize_history(&self.contract_id, self.interval, bars);
        let count = accepted.len();
        self.historical = Arc::new(accepted);
        self.historical_loaded = true;
        self.history_version = self.history_version.wrapping_add(1);
        self.reported_conflicts.clear();
        self.cache = None;
        count
    }

    pub fn switch_to_live(&mut self, historical_bars: Vec<Bar>, live: &BarAggregator) -> SeriesSnapshot {
        let _ = self.request_subscription();
        let _ = self.load_historical(historical_bars);
        self.merged_snapshot(live)
    }

    /// Current merged view; rebuilt only when the set of completed bars changes.
    pub fn merged_snapshot(&mut self, live: &BarAggregator) -> SeriesSnapshot {
        if !live.is_empty() && self.state == ReconciliationState::Loading {
            self.transition(ReconciliationState::Hybrid);
        }

        let key = MergeKey {
            history_version: self.history_version,
            live_first: live.first_open_time(),
            live_completed: live.completed_bars().len(),
            partial_present: live.current_partial().is_some(),
        };
        let live_snapshot = live.snapshot();

        let stale = self
            .cache
            .as_ref()
            .map(|cache| cache.key != key)
            .unwrap_or(true);
        if stale {
            let merged = merge_series(&self.historical, &live_snapshot, self.history_limit);
            self.report_conflicts(&merged.conflicts);
            self.cache = Some(MergeCache {
                key,
                completed: merged.snapshot.completed_bars,
                retained_historical: merged.retained_historical,
            });
        }

        let (completed, retained_historical) = match self.cache.as_ref() {
            Some(cache) => (Arc::clone(&cache.completed), cache.retained_historical),
            None => (Arc::new(Vec::new()), 0),
        };

        if self.state == ReconciliationState::Hybrid
            && self.historical_loaded
            && retained_historical == 0
        {
            self.transition(ReconciliationState::LiveOnly);
        }

        SeriesSnapshot {
            contract_id: self.contract_id.clone(),
            interval_ms: self.interval.duration_ms(),
            completed_bars: completed,
            current_partial: live_snapshot.current_partial,
        }
    }

    /// Subscribes through `feed`, retrying per the policy. Cancellation wins
    /// over both the pending subscribe and any backoff sleep.
    pub async fn subscribe(&mut self, feed: &dyn TickFeed) -> Result<TickStream, SubscriptionError> {
        let mut retry = 0_u32;
        loop {
            if self.cancel_token.is_cancelled() {
                return Err(self.cancelled());
            }

            let attempt = tokio::select! {
                _ = self.cancel_token.cancelled() => return Err(self.cancelled()),
                result = feed.subscribe(&self.contract_id) => result,
            };

            let failure = match attempt {
                Ok(stream) => return Ok(stream),
                Err(failure @ SubscriptionError::Cancelled { .. }) => return Err(failure),
                Err(failure) if failure.is_terminal() => {
                    error!(contract = %self.contract_id, error = %failure, "feed gave up on subscription");
                    self.mark_failed();
                    return Err(failure);
                }
                Err(failure) => failure,
            };

            let Some(delay) = self.retry.delay_for(retry) else {
                let attempts = retry.saturating_add(1);
                error!(
                    contract = %self.contract_id,
                    attempts,
                    error = %failure,
                    "subscription retries exhausted"
                );
                self.mark_failed();
                return Err(SubscriptionError::Exhausted {
                    contract_id: self.contract_id.clone(),
                    attempts,
                    last_error: failure.to_string(),
                });
            };

            retry = retry.saturating_add(1);
            warn!(
                contract = %self.contract_id,
                attempt = retry,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "subscription failed, backing off"
            );

            tokio::select! {
                _ = self.cancel_token.cancelled() => return Err(self.cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn cancelled(&self) -> SubscriptionError {
        SubscriptionError::Cancelled {
            contract_id: self.contract_id.clone(),
        }
    }

    fn report_conflicts(&mut self, conflicts: &[ReconciliationConflict]) {
        for conflict in conflicts {
            if !self.reported_conflicts.insert(conflict.open_time) {
                continue;
            }
            self.conflict_count = self.conflict_count.saturating_add(1);
            info!(
                contract = %conflict.contract_id,
                bucket = conflict.open_time,
                historical_close = conflict.historical.close,
                live_close = conflict.live.close,
                "historical bar overlaps live bar, keeping live"
            );
        }
    }

    fn transition(&mut self, next: ReconciliationState) {
        if self.state != next {
            info!(
                contract = %self.contract_id,
                from = self.state.as_str(),
                to = next.as_str(),
                "reconciliation state changed"
            );
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::mock::MockTickFeed;
    use crate::market::types::Tick;

    const CONTRACT: &str = "BTCUSDT";
    const MINUTE: i64 = 60_000;
    const T0: i64 = 1_700_000_040_000;

    fn historical_bar(open_time: i64, close: f64) -> Bar {
        Bar {
            open_time,
            interval_ms: MINUTE,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 2.0,
            is_partial: false,
        }
    }

    fn historical_window(start: i64, count: i64) -> Vec<Bar> {
        (0..count)
            .map(|index| historical_bar(start + index * MINUTE, 100.0 + index as f64))
            .collect()
    }

    fn live_aggregator(ticks: &[(i64, f64)]) -> BarAggregator {
        let mut aggregator = BarAggregator::new(CONTRACT, Interval::M1);
        for (timestamp, price) in ticks {
            let _ = aggregator
                .ingest(&Tick::new(CONTRACT, *timestamp, *price, 1.0))
                .expect("valid tick should apply");
        }
        aggregator
    }

    fn reconciler(history_limit: usize) -> SeriesReconciler {
        SeriesReconciler::new(CONTRACT, Interval::M1, history_limit, RetryPolicy::default())
    }

    #[test]
    fn retry_policy_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(2_000)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(4_000)));
        assert_eq!(policy.delay_for(3), None);

        let longer = RetryPolicy {
            max_attempts: 5,
            ..RetryPolicy::default()
        };
        assert_eq!(longer.delay_for(3), Some(Duration::from_millis(5_000)));
        assert_eq!(longer.delay_for(4), Some(Duration::from_millis(5_000)));
        assert_eq!(policy.backoff(0), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(5_000));
    }

    #[test]
    fn live_bar_replaces_overlapping_historical_bucket() {
        let historical = historical_window(T0, 5);
        let live = live_aggregator(&[(T0 + 3 * MINUTE + 500, 250.0)]);
        let mut reconciler = reconciler(5_000);

        let series = reconciler.switch_to_live(historical, &live);

        assert_eq!(reconciler.state(), ReconciliationState::Hybrid);
        let open_times: Vec<i64> = series.iter().map(|bar| bar.open_time).collect();
        assert_eq!(
            open_times,
            vec![T0, T0 + MINUTE, T0 + 2 * MINUTE, T0 + 3 * MINUTE]
        );
        let live_bucket = series.last_bar().expect("live bar should be last");
        assert_eq!(live_bucket.close, 250.0);
        assert!(live_bucket.is_partial);
        assert!(series
            .completed_bars
            .iter()
            .all(|bar| bar.open_time < T0 + 3 * MINUTE));
        assert_eq!(reconciler.conflict_count(), 1);
    }

    #[test]
    fn series_has_unique_increasing_open_times_after_merge() {
        let historical = historical_window(T0, 10);
        let live = live_aggregator(&[
            (T0 + 7 * MINUTE, 1.0),
            (T0 + 8 * MINUTE, 2.0),
            (T0 + 9 * MINUTE + 10, 3.0),
            (T0 + 11 * MINUTE, 4.0),
        ]);
        let mut reconciler = reconciler(5_000);

        let series = reconciler.switch_to_live(historical, &live);
        let open_times: Vec<i64> = series.iter().map(|bar| bar.open_time).collect();

        assert!(open_times.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(open_times.len(), 7 + 4);
    }

    #[test]
    fn keeps_historical_only_until_live_data_arrives() {
        let mut reconciler = reconciler(5_000);
        let live = live_aggregator(&[(T0 + 3 * MINUTE, 10.0)]);

        let _ = reconciler.load_historical(historical_window(T0, 3));
        let _ = reconciler.merged_snapshot(&live);
        assert_eq!(reconciler.state(), ReconciliationState::HistoricalOnly);

        let empty = BarAggregator::new(CONTRACT, Interval::M1);
        let series = reconciler.switch_to_live(historical_window(T0, 3), &empty);
        assert_eq!(series.len(), 3);
        assert!(series.current_partial.is_none());
        assert_eq!(reconciler.state(), ReconciliationState::Loading);

        let _ = reconciler.merged_snapshot(&live);
        assert_eq!(reconciler.state(), ReconciliationState::Hybrid);
    }

    #[test]
    fn walks_loading_hybrid_live_only() {
        let mut reconciler = reconciler(4);
        let _ = reconciler.request_subscription();
        let _ = reconciler.load_historical(historical_window(T0, 3));

        let mut live = live_aggregator(&[(T0 + 3 * MINUTE, 10.0)]);
        let _ = reconciler.merged_snapshot(&live);
        assert_eq!(reconciler.state(), ReconciliationState::Hybrid);

        for minute in 4..8 {
            let _ = live
                .ingest(&Tick::new(CONTRACT, T0 + minute * MINUTE, 11.0, 1.0))
                .expect("valid tick should apply");
        }
        let series = reconciler.merged_snapshot(&live);

        assert_eq!(reconciler.state(), ReconciliationState::LiveOnly);
        assert_eq!(series.len(), 4);
        assert_eq!(
            series.completed_bars.first().map(|bar| bar.open_time),
            Some(T0 + 4 * MINUTE)
        );
    }

    #[test]
    fn late_history_is_cut_at_first_live_bucket() {
        let mut reconciler = reconciler(5_000);
        let _ = reconciler.request_subscription();
        let live = live_aggregator(&[(T0 + 2 * MINUTE, 50.0), (T0 + 3 * MINUTE, 51.0)]);

        let before = reconciler.merged_snapshot(&live);
        assert_eq!(before.len(), 2);
        assert_eq!(reconciler.state(), ReconciliationState::Hybrid);

        let _ = reconciler.load_historical(historical_window(T0, 4));
        let after = reconciler.merged_snapshot(&live);

        let closes: Vec<f64> = after.iter().map(|bar| bar.close).collect();
        assert_eq!(closes, vec![100.0, 101.0, 50.0, 51.0]);
        assert_eq!(reconciler.conflict_count(), 2);
        assert_eq!(reconciler.state(), ReconciliationState::Hybrid);
    }

    #[test]
    fn sanitizes_unordered_and_malformed_history() {
        let mut bars = historical_window(T0, 3);
        bars.push(historical_bar(T0 + MINUTE, 1.0));
        let mut broken = historical_bar(T0 + 5 * MINUTE, 5.0);
        broken.high = 1.0;
        bars.push(broken);
        let mut wrong_interval = historical_bar(T0 + 6 * MINUTE, 5.0);
        wrong_interval.interval_ms = 300_000;
        bars.push(wrong_interval);
        let mut partial = historical_bar(T0 + 7 * MINUTE, 6.0);
        partial.is_partial = true;
        bars.push(partial);

        let accepted = sanitize_history(CONTRACT, Interval::M1, bars);

        let open_times: Vec<i64> = accepted.iter().map(|bar| bar.open_time).collect();
        assert_eq!(
            open_times,
            vec![T0, T0 + MINUTE, T0 + 2 * MINUTE, T0 + 7 * MINUTE]
        );
        assert!(accepted.iter().all(|bar| !bar.is_partial));
    }

    #[test]
    fn reuses_merged_bars_while_only_partial_changes() {
        let mut reconciler = reconciler(5_000);
        let _ = reconciler.load_historical(historical_window(T0, 3));
        let mut live = live_aggregator(&[(T0 + 3 * MINUTE, 10.0)]);

        let first = reconciler.merged_snapshot(&live);
        let _ = live
            .ingest(&Tick::new(CONTRACT, T0 + 3 * MINUTE + 1, 12.0, 1.0))
            .expect("valid tick should apply");
        let second = reconciler.merged_snapshot(&live);

        assert!(Arc::ptr_eq(&first.completed_bars, &second.completed_bars));
        assert_eq!(second.current_partial.map(|bar| bar.high), Some(12.0));
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_terminal_error_after_backoff_exhausted() {
        let feed = MockTickFeed::new();
        feed.fail_next_subscribes(10);
        let mut reconciler = reconciler(5_000);
        let _ = reconciler.request_subscription();
        let started = tokio::time::Instant::now();

        let result = reconciler.subscribe(&feed).await;

        match result {
            Err(SubscriptionError::Exhausted { attempts, .. }) => assert_eq!(attempts, 4),
            Err(other) => panic!("expected exhausted retries, got {other:?}"),
            Ok(_) => panic!("expected exhausted retries, got a stream"),
        }
        assert_eq!(feed.subscribe_calls(), 4);
        assert_eq!(reconciler.state(), ReconciliationState::Error);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(7_000));
        assert!(waited < Duration::from_millis(8_000));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_when_feed_comes_back_within_budget() {
        let feed = MockTickFeed::new();
        feed.fail_next_subscribes(2);
        let mut reconciler = reconciler(5_000);
        let _ = reconciler.request_subscription();

        let result = reconciler.subscribe(&feed).await;

        assert!(result.is_ok());
        assert_eq!(feed.subscribe_calls(), 3);
        assert_eq!(reconciler.state(), ReconciliationState::Loading);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_is_idempotent_and_stops_retries() {
        let feed = MockTickFeed::new();
        let reconciler_token = CancellationToken::new();
        let mut reconciler = reconciler(5_000).with_cancellation(reconciler_token.clone());

        assert!(reconciler.unsubscribe());
        assert!(!reconciler.unsubscribe());
        assert!(reconciler_token.is_cancelled());

        let result = reconciler.subscribe(&feed).await;
        assert!(matches!(result, Err(SubscriptionError::Cancelled { .. })));
        assert_eq!(feed.subscribe_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn feed_giving_up_moves_to_error() {
        let feed = MockTickFeed::new();
        feed.reject_permanently();
        let mut reconciler = reconciler(5_000);
        let _ = reconciler.request_subscription();

        let result = reconciler.subscribe(&feed).await;

        assert!(matches!(result, Err(SubscriptionError::Exhausted { .. })));
        assert_eq!(feed.subscribe_calls(), 1);
        assert_eq!(reconciler.state(), ReconciliationState::Error);
    }
}
