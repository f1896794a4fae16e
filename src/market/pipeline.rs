use crate::error::{ChartError, StarvationWarning, SubscriptionError};
use crate::market::aggregator::{BarAggregator, IngestOutcome};
use crate::market::config::ChartStreamConfig;
use crate::market::feed::{HistoricalBarSource, TickFeed, TickStream};
use crate::market::range::PriceRangeTracker;
use crate::market::reconciler::SeriesReconciler;
use crate::market::scheduler::{Flush, RenderScheduler};
use crate::market::types::{
    Bar, BarUpdateEvent, ChartFrame, ReconciliationState, SessionStatus, Tick,
};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;
const WATCHDOG_INTERVAL_MS: u64 = 1_000;
const STATUS_REPEAT_THROTTLE_MS: u64 = 1_000;

pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

type HistoryTask = JoinHandle<Result<Vec<Bar>, ChartError>>;

pub fn system_clock() -> Clock {
    Arc::new(now_unix_ms)
}

#[derive(Clone)]
pub struct ChartStreamSources {
    pub feed: Arc<dyn TickFeed>,
    pub history: Arc<dyn HistoricalBarSource>,
    pub clock: Clock,
}

impl ChartStreamSources {
    pub fn new(feed: Arc<dyn TickFeed>, history: Arc<dyn HistoricalBarSource>) -> Self {
        Self {
            feed,
            history,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

/// Flush receiver that goes quiet once the session is cancelled, including
/// for flushes already buffered.
#[derive(Debug)]
pub struct FrameReceiver {
    frames: mpsc::Receiver<Flush<ChartFrame>>,
    cancel_token: CancellationToken,
}

impl FrameReceiver {
    pub async fn recv(&mut self) -> Option<Flush<ChartFrame>> {
        if self.cancel_token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => None,
            flush = self.frames.recv() => flush,
        }
    }

    pub fn try_recv(&mut self) -> Result<Flush<ChartFrame>, mpsc::error::TryRecvError> {
        if self.cancel_token.is_cancelled() {
            return Err(mpsc::error::TryRecvError::Disconnected);
        }
        self.frames.try_recv()
    }
}

/// Subscribe-only handle to a session's bar events.
#[derive(Debug, Clone)]
pub struct BarEventHub {
    sender: broadcast::Sender<BarUpdateEvent>,
    cancel_token: CancellationToken,
}

impl BarEventHub {
    pub fn subscribe(&self) -> BarEventReceiver {
        BarEventReceiver {
            events: self.sender.subscribe(),
            cancel_token: self.cancel_token.clone(),
        }
    }
}

/// Reports `Closed` once the session is cancelled, even with events still queued.
#[derive(Debug)]
pub struct BarEventReceiver {
    events: broadcast::Receiver<BarUpdateEvent>,
    cancel_token: CancellationToken,
}

impl BarEventReceiver {
    pub async fn recv(&mut self) -> Result<BarUpdateEvent, broadcast::error::RecvError> {
        if self.cancel_token.is_cancelled() {
            return Err(broadcast::error::RecvError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(broadcast::error::RecvError::Closed),
            event = self.events.recv() => event,
        }
    }

    pub fn try_recv(&mut self) -> Result<BarUpdateEvent, broadcast::error::TryRecvError> {
        if self.cancel_token.is_cancelled() {
            return Err(broadcast::error::TryRecvError::Closed);
        }
        self.events.try_recv()
    }
}

/// Consumer side of a running session.
pub struct ChartStream {
    pub frames: FrameReceiver,
    pub status: watch::Receiver<SessionStatus>,
    pub cancel_token: CancellationToken,
    pub task: JoinHandle<Result<(), ChartError>>,
    events: BarEventHub,
}

impl ChartStream {
    pub fn subscribe_events(&self) -> BarEventReceiver {
        self.events.subscribe()
    }

    pub fn event_hub(&self) -> BarEventHub {
        self.events.clone()
    }
}

pub fn spawn_chart_stream(
    config: ChartStreamConfig,
    sources: ChartStreamSources,
    cancel_token: CancellationToken,
) -> ChartStream {
    let (scheduler, frames) =
        RenderScheduler::spawn(config.throttle_window, config.throttle_max_wait, &cancel_token);
    let (status_tx, status) = watch::channel(SessionStatus::idle(
        config.contract_id.clone(),
        config.interval,
        None,
    ));
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let runtime = StreamRuntime {
        aggregator: BarAggregator::new(config.contract_id.clone(), config.interval),
        reconciler: SeriesReconciler::new(
            config.contract_id.clone(),
            config.interval,
            config.history_limit,
            config.retry,
        )
        .with_cancellation(cancel_token.child_token()),
        range: PriceRangeTracker::new(config.range),
        scheduler,
        status_tx,
        status_throttle: StatusPublishThrottle::default(),
        events: events.clone(),
        reason: None,
        last_tick_received_ms: None,
        subscribed_at_ms: None,
        idle_reconnects: 0,
        starvation: None,
        feed: sources.feed,
        history: sources.history,
        clock: sources.clock,
        cancel_token: cancel_token.clone(),
        config,
    };

    ChartStream {
        frames: FrameReceiver {
            frames,
            cancel_token: cancel_token.clone(),
        },
        status,
        events: BarEventHub {
            sender: events,
            cancel_token: cancel_token.clone(),
        },
        cancel_token,
        task: tokio::spawn(runtime.run()),
    }
}

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_state: Option<ReconciliationState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

impl StatusPublishThrottle {
    fn allow(&mut self, status: &SessionStatus, now: Instant) -> bool {
        let repeated = self.last_state == Some(status.state) && self.last_reason == status.reason;
        if repeated
            && self
                .last_emit
                .map(|instant| {
                    now.duration_since(instant) < Duration::from_millis(STATUS_REPEAT_THROTTLE_MS)
                })
                .unwrap_or(false)
        {
            return false;
        }

        self.last_state = Some(status.state);
        self.last_reason = status.reason.clone();
        self.last_emit = Some(now);
        true
    }
}

struct StreamRuntime {
    config: ChartStreamConfig,
    feed: Arc<dyn TickFeed>,
    history: Arc<dyn HistoricalBarSource>,
    clock: Clock,
    aggregator: BarAggregator,
    reconciler: SeriesReconciler,
    range: PriceRangeTracker,
    scheduler: RenderScheduler<ChartFrame>,
    status_tx: watch::Sender<SessionStatus>,
    status_throttle: StatusPublishThrottle,
    events: broadcast::Sender<BarUpdateEvent>,
    reason: Option<String>,
    last_tick_received_ms: Option<i64>,
    subscribed_at_ms: Option<i64>,
    idle_reconnects: u32,
    starvation: Option<StarvationWarning>,
    cancel_token: CancellationToken,
}

impl StreamRuntime {
    async fn run(mut self) -> Result<(), ChartError> {
        let result = self.drive().await;

        self.feed.unsubscribe(&self.config.contract_id);
        let _ = self.reconciler.unsubscribe();
        self.scheduler.close().await;

        match &result {
            Ok(()) => info!(contract = %self.config.contract_id, "chart stream stopped"),
            Err(error) => {
                error!(contract = %self.config.contract_id, %error, "chart stream failed")
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<(), ChartError> {
        let cancel_token = self.cancel_token.clone();
        let contract_id = self.config.contract_id.clone();
        let interval = self.config.interval;
        let (start_time, end_time) = self.history_window();
        info!(
            contract = %contract_id,
            interval = interval.as_str(),
            prefer_realtime = self.config.prefer_realtime,
            "starting chart stream"
        );

        let mut history_task: Option<HistoryTask> = None;
        if self.config.prefer_realtime {
            let history = Arc::clone(&self.history);
            let history_contract = contract_id.clone();
            history_task = Some(tokio::spawn(async move {
                history
                    .fetch_bars(&history_contract, interval, start_time, end_time)
                    .await
            }));
        } else {
            self.reason = Some("loading historical bars".to_string());
            self.publish_status();
            let history = Arc::clone(&self.history);
            let fetched = tokio::select! {
                _ = cancel_token.cancelled() => return Ok(()),
                fetched = history.fetch_bars(&contract_id, interval, start_time, end_time) => fetched,
            };
            self.apply_history(fetched);
        }

        let _ = self.reconciler.request_subscription();
        self.reason = Some("subscribing to live ticks".to_string());
        self.publish_status();

        let mut ticks = match self.subscribe().await {
            Ok(Some(stream)) => stream,
            Ok(None) => return self.abort_history(history_task, Ok(())),
            Err(error) => return self.abort_history(history_task, Err(error)),
        };

        let mut watchdog = tokio::time::interval(Duration::from_millis(WATCHDOG_INTERVAL_MS));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    break;
                }
                joined = join_history(&mut history_task), if history_task.is_some() => {
                    history_task = None;
                    let fetched = joined.unwrap_or_else(|error| Err(ChartError::from(error)));
                    self.apply_history(fetched);
                }
                item = ticks.next() => {
                    match item {
                        Some(Ok(tick)) => {
                            self.on_tick(tick);
                            continue;
                        }
                        Some(Err(error)) => {
                            warn!(contract = %contract_id, %error, "live feed failed, resubscribing");
                        }
                        None => {
                            warn!(contract = %contract_id, "live feed ended, resubscribing");
                        }
                    }
                    self.reason = Some("live feed disconnected, resubscribing".to_string());
                    self.publish_status();
                    if self.last_tick_received_ms.is_none() {
                        let delay = self.config.retry.backoff(self.idle_reconnects);
                        self.idle_reconnects = self.idle_reconnects.saturating_add(1);
                        warn!(
                            contract = %contract_id,
                            attempt = self.idle_reconnects,
                            delay_ms = delay.as_millis() as u64,
                            "live feed closed before any tick, backing off"
                        );
                        let cancelled = tokio::select! {
                            _ = cancel_token.cancelled() => true,
                            _ = tokio::time::sleep(delay) => false,
                        };
                        if cancelled {
                            break;
                        }
                    }
                    match self.subscribe().await {
                        Ok(Some(stream)) => ticks = stream,
                        Ok(None) => break,
                        Err(error) => return self.abort_history(history_task, Err(error)),
                    }
                }
                _ = watchdog.tick() => {
                    self.on_watchdog();
                }
            }
        }

        self.abort_history(history_task, Ok(()))
    }

    fn abort_history(
        &self,
        history_task: Option<HistoryTask>,
        result: Result<(), ChartError>,
    ) -> Result<(), ChartError> {
        if let Some(task) = history_task {
            task.abort();
        }
        result
    }

    async fn subscribe(&mut self) -> Result<Option<TickStream>, ChartError> {
        let feed = Arc::clone(&self.feed);
        match self.reconciler.subscribe(feed.as_ref()).await {
            Ok(stream) => {
                self.subscribed_at_ms = Some(self.now());
                self.last_tick_received_ms = None;
                self.reason = None;
                self.publish_status();
                Ok(Some(stream))
            }
            Err(SubscriptionError::Cancelled { .. }) => Ok(None),
            Err(failure) => {
                self.reason = Some(failure.to_string());
                self.publish_frame(None);
                self.publish_status();
                Err(failure.into())
            }
        }
    }

    fn history_window(&self) -> (i64, i64) {
        let interval_ms = self.config.interval.duration_ms();
        let end_time = self.config.interval.bucket_open_time(self.now());
        let span = interval_ms.saturating_mul(self.config.history_limit as i64);
        (end_time.saturating_sub(span), end_time)
    }

    fn apply_history(&mut self, fetched: Result<Vec<Bar>, ChartError>) {
        match fetched {
            Ok(bars) => {
                let received = bars.len();
                let accepted = self.reconciler.load_historical(bars);
                info!(
                    contract = %self.config.contract_id,
                    received,
                    accepted,
                    "historical bars loaded"
                );
                if self.reason.as_deref() == Some("loading historical bars") {
                    self.reason = None;
                }
            }
            Err(error) => {
                warn!(contract = %self.config.contract_id, %error, "historical bars unavailable");
                let _ = self.reconciler.load_historical(Vec::new());
                self.reason = Some(format!("historical bars unavailable: {error}"));
            }
        }
        self.publish_frame(None);
        self.publish_status();
    }

    fn on_tick(&mut self, tick: Tick) {
        if self.cancel_token.is_cancelled() || self.reconciler.is_unsubscribed() {
            return;
        }
        self.last_tick_received_ms = Some(self.now());
        self.idle_reconnects = 0;
        if let Some(warning) = self.starvation.take() {
            info!(contract = %warning.contract_id, "live ticks resumed");
            if self.reason.as_deref() == Some(warning.to_string().as_str()) {
                self.reason = None;
            }
            self.publish_status();
        }

        match self.aggregator.ingest(&tick) {
            Ok(IngestOutcome::Applied(event)) => {
                let _ = self.events.send(event.clone());
                let _ = self.aggregator.trim_front(self.config.history_limit);
                self.publish_frame(Some(event));
            }
            Ok(IngestOutcome::Late { .. } | IngestOutcome::Duplicate { .. }) => {}
            Err(error) => {
                warn!(contract = %self.config.contract_id, %error, "rejected tick");
            }
        }
    }

    fn on_watchdog(&mut self) {
        let now = self.now();
        if let Some(closed) = self.aggregator.close_elapsed(now) {
            debug!(
                contract = %self.config.contract_id,
                bucket = closed.open_time,
                "closed elapsed bar"
            );
            self.publish_frame(None);
        }

        if self.starvation.is_none() {
            if let Some(since) = self.last_tick_received_ms.or(self.subscribed_at_ms) {
                let threshold_ms = self.config.starvation_threshold_ms();
                let silent_ms = now.saturating_sub(since);
                if silent_ms > threshold_ms {
                    let warning = StarvationWarning {
                        contract_id: self.config.contract_id.clone(),
                        last_tick_time: self.aggregator.last_tick_time(),
                        silent_ms,
                        threshold_ms,
                    };
                    warn!(
                        contract = %warning.contract_id,
                        silent_ms,
                        threshold_ms,
                        "live feed is starving"
                    );
                    self.reason = Some(warning.to_string());
                    self.starvation = Some(warning);
                }
            }
        }

        self.publish_status();
    }

    fn publish_frame(&mut self, last_event: Option<BarUpdateEvent>) {
        let snapshot = self.reconciler.merged_snapshot(&self.aggregator);
        let _ = self
            .range
            .compute_range(snapshot.visible(self.config.visible_bars));
        let state = self.reconciler.state();
        self.scheduler.notify(ChartFrame {
            snapshot,
            range: self.range.last_emitted(),
            state,
            last_event,
        });
        if self.status_throttle.last_state != Some(state) {
            self.publish_status();
        }
    }

    fn publish_status(&mut self) {
        let status = SessionStatus {
            state: self.reconciler.state(),
            contract_id: self.config.contract_id.clone(),
            interval: self.config.interval,
            last_tick_time: self.aggregator.last_tick_time(),
            late_ticks: self.aggregator.late_ticks(),
            reason: self.reason.clone(),
        };
        if !self.status_throttle.allow(&status, Instant::now()) {
            return;
        }
        let _ = self.status_tx.send_replace(status);
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }
}

async fn join_history(
    task: &mut Option<HistoryTask>,
) -> Result<Result<Vec<Bar>, ChartError>, JoinError> {
    match task.as_mut() {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
