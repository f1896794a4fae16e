use crate::error::{ChartError, SubscriptionError};
use crate::market::config::MAX_BAR_WINDOW;
use crate::market::feed::{HistoricalBarSource, TickFeed, TickStream};
use crate::market::pipeline::now_unix_ms;
use crate::market::types::{Bar, Interval, Tick};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type TickSender = mpsc::UnboundedSender<Result<Tick, ChartError>>;

#[derive(Debug, Default)]
struct MockFeedState {
    pending_failures: u32,
    pending_closes: u32,
    rejected: bool,
    subscribe_calls: u32,
    unsubscribe_calls: u32,
    senders: HashMap<String, TickSender>,
}

/// In-process feed driven by `push`; subscribe failures can be injected.
#[derive(Debug, Default)]
pub struct MockTickFeed {
    state: Mutex<MockFeedState>,
}

impl MockTickFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_subscribes(&self, count: u32) {
        self.state.lock().pending_failures = count;
    }

    /// Every later subscribe fails with a terminal error.
    pub fn reject_permanently(&self) {
        self.state.lock().rejected = true;
    }

    /// The next `count` subscribes succeed but their streams end immediately.
    pub fn close_next_streams(&self, count: u32) {
        self.state.lock().pending_closes = count;
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.state.lock().subscribe_calls
    }

    pub fn unsubscribe_calls(&self) -> u32 {
        self.state.lock().unsubscribe_calls
    }

    pub fn is_subscribed(&self, contract_id: &str) -> bool {
        self.state.lock().senders.contains_key(contract_id)
    }

    /// Returns `false` when nobody is subscribed to the tick's contract.
    pub fn push(&self, tick: Tick) -> bool {
        let state = self.state.lock();
        match state.senders.get(&tick.contract_id) {
            Some(sender) => sender.send(Ok(tick)).is_ok(),
            None => false,
        }
    }

    pub fn push_error(&self, contract_id: &str, error: ChartError) -> bool {
        let state = self.state.lock();
        match state.senders.get(contract_id) {
            Some(sender) => sender.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Ends the current stream as if the connection dropped.
    pub fn disconnect(&self, contract_id: &str) -> bool {
        self.state.lock().senders.remove(contract_id).is_some()
    }
}

impl TickFeed for MockTickFeed {
    fn subscribe<'a>(
        &'a self,
        contract_id: &'a str,
    ) -> BoxFuture<'a, Result<TickStream, SubscriptionError>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.subscribe_calls = state.subscribe_calls.saturating_add(1);
            if state.rejected {
                return Err(SubscriptionError::Exhausted {
                    contract_id: contract_id.to_string(),
                    attempts: 1,
                    last_error: "mock feed rejected contract".to_string(),
                });
            }
            if state.pending_failures > 0 {
                state.pending_failures -= 1;
                return Err(SubscriptionError::connect(contract_id, "mock feed refused connection"));
            }

            let (sender, receiver) = mpsc::unbounded_channel();
            if state.pending_closes > 0 {
                state.pending_closes -= 1;
                state.senders.remove(contract_id);
                drop(sender);
            } else {
                state.senders.insert(contract_id.to_string(), sender);
            }
            debug!(contract = %contract_id, "mock feed subscribed");

            let ticks = stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|item| (item, receiver))
            })
            .boxed();
            Ok(ticks)
        })
    }

    fn unsubscribe(&self, contract_id: &str) {
        let mut state = self.state.lock();
        state.unsubscribe_calls = state.unsubscribe_calls.saturating_add(1);
        state.senders.remove(contract_id);
    }
}

/// Alternating synthetic trades, one every `period`, until cancelled.
pub fn spawn_synthetic_ticks(
    feed: Arc<MockTickFeed>,
    contract_id: String,
    period: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sequence = 0_u64;
        let mut synthetic_price = 100_000.0_f64;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    sequence = sequence.saturating_add(1);
                    let upward_move = sequence % 2 == 0;
                    synthetic_price += if upward_move { 0.6 } else { -0.4 };
                    let quantity = 0.12 + ((sequence % 5) as f64 * 0.01);
                    let tick = Tick::new(contract_id.clone(), now_unix_ms(), synthetic_price, quantity)
                        .with_sequence(sequence);
                    let _ = feed.push(tick);
                }
            }
        }
    })
}

#[derive(Debug, Clone)]
enum HistoryScript {
    Synthetic { base_price: f64 },
    Fixed(Vec<Bar>),
}

/// Deterministic history: either generated on demand or a fixed bar list.
#[derive(Debug)]
pub struct MockBarSource {
    script: HistoryScript,
    failing: AtomicBool,
    fetch_calls: AtomicU32,
    delay: Option<Duration>,
}

impl MockBarSource {
    pub fn synthetic(base_price: f64) -> Self {
        Self::with_script(HistoryScript::Synthetic { base_price })
    }

    pub fn from_bars(bars: Vec<Bar>) -> Self {
        Self::with_script(HistoryScript::Fixed(bars))
    }

    fn with_script(script: HistoryScript) -> Self {
        Self {
            script,
            failing: AtomicBool::new(false),
            fetch_calls: AtomicU32::new(0),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::Relaxed)
    }
}

impl HistoricalBarSource for MockBarSource {
    fn fetch_bars<'a>(
        &'a self,
        contract_id: &'a str,
        interval: Interval,
        start_time: i64,
        end_time: i64,
    ) -> BoxFuture<'a, Result<Vec<Bar>, ChartError>> {
        Box::pin(async move {
            self.fetch_calls.fetch_add(1, Ordering::Relaxed);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::Relaxed) {
                return Err(ChartError::InvalidArgument(format!(
                    "mock history for '{contract_id}' is unavailable"
                )));
            }

            let bars = match &self.script {
                HistoryScript::Synthetic { base_price } => {
                    build_mock_history(interval, *base_price, start_time, end_time)
                }
                HistoryScript::Fixed(bars) => bars
                    .iter()
                    .filter(|bar| bar.open_time >= start_time && bar.open_time < end_time)
                    .copied()
                    .collect(),
            };
            Ok(bars)
        })
    }
}

fn build_mock_history(interval: Interval, base_price: f64, start_time: i64, end_time: i64) -> Vec<Bar> {
    let interval_ms = interval.duration_ms();
    let mut open_time = interval.bucket_open_time(start_time);
    if open_time < start_time {
        open_time += interval_ms;
    }
    let available = ((end_time - open_time).max(0) / interval_ms) as usize;
    let skipped = available.saturating_sub(MAX_BAR_WINDOW);
    open_time += skipped as i64 * interval_ms;

    let mut bars = Vec::with_capacity(available - skipped);
    while open_time < end_time {
        let step = open_time.div_euclid(interval_ms);
        let open = base_price + ((step % 7) as f64 - 3.0) * 2.1;
        let close = (base_price + (((step + 1) % 7) as f64 - 3.0) * 2.1).max(1.0);
        bars.push(Bar {
            open_time,
            interval_ms,
            open,
            high: open.max(close) + 1.25,
            low: (open.min(close) - 1.1).max(0.5),
            close,
            volume: 2.0 + (step % 5) as f64 * 0.3,
            is_partial: false,
        });
        open_time += interval_ms;
    }
    bars
}
