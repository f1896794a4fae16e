use crate::error::ChartError;
use crate::market::config::{ChartStreamArgs, DEFAULT_INTERVAL};
use crate::market::pipeline::{spawn_chart_stream, BarEventReceiver, FrameReceiver};
use crate::market::types::{Interval, SessionStatus};
use crate::state::{AppState, ChartSessionHandle};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartStreamSession {
    pub contract_id: String,
    pub interval: Interval,
    pub prefer_realtime: bool,
    pub throttle_window_ms: u64,
    pub history_limit: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChartStreamStopResult {
    pub stopped: bool,
}

pub struct ChartStreamSubscription {
    pub session: ChartStreamSession,
    pub frames: FrameReceiver,
    pub status: watch::Receiver<SessionStatus>,
    pub events: BarEventReceiver,
}

/// Starting a contract that already streams replaces its session. The registry
/// stays locked until the new session is recorded.
pub async fn start_chart_stream(
    state: &AppState,
    args: Option<ChartStreamArgs>,
) -> Result<ChartStreamSubscription, ChartError> {
    let config = args.unwrap_or_default().normalize()?;
    let contract_id = config.contract_id.clone();

    let mut sessions = state.sessions.lock().await;
    if let Some(handle) = sessions.remove(&contract_id) {
        info!(contract = %contract_id, "replacing running chart stream");
        shutdown_session(handle).await;
    }

    let cancellation_token = CancellationToken::new();
    let stream = spawn_chart_stream(config.clone(), state.sources(), cancellation_token.clone());
    let events = stream.event_hub();
    let session = ChartStreamSession {
        contract_id: contract_id.clone(),
        interval: config.interval,
        prefer_realtime: config.prefer_realtime,
        throttle_window_ms: config.throttle_window.as_millis() as u64,
        history_limit: config.history_limit,
    };
    let subscription = ChartStreamSubscription {
        session,
        frames: stream.frames,
        status: stream.status.clone(),
        events: events.subscribe(),
    };

    let displaced = sessions.insert(
        contract_id,
        ChartSessionHandle {
            config,
            cancellation_token,
            join_handle: stream.task,
            status: stream.status,
            events,
        },
    );
    if let Some(handle) = displaced {
        shutdown_session(handle).await;
    }

    Ok(subscription)
}

/// Idempotent: stopping an unknown or already stopped contract reports `stopped: false`.
pub async fn stop_chart_stream(
    state: &AppState,
    contract_id: &str,
) -> Result<ChartStreamStopResult, ChartError> {
    let existing_handle = {
        let mut sessions = state.sessions.lock().await;
        sessions.remove(&contract_id.trim().to_ascii_uppercase())
    };

    let stopped = match existing_handle {
        Some(handle) => {
            shutdown_session(handle).await;
            true
        }
        None => false,
    };

    Ok(ChartStreamStopResult { stopped })
}

pub async fn stop_all_chart_streams(state: &AppState) -> usize {
    let handles: Vec<ChartSessionHandle> = {
        let mut sessions = state.sessions.lock().await;
        sessions.drain().map(|(_, handle)| handle).collect()
    };
    let count = handles.len();
    for handle in handles {
        shutdown_session(handle).await;
    }
    count
}

pub async fn chart_stream_status(
    state: &AppState,
    contract_id: &str,
) -> Result<SessionStatus, ChartError> {
    let contract_id = contract_id.trim().to_ascii_uppercase();
    let sessions = state.sessions.lock().await;
    let snapshot = match sessions.get(&contract_id) {
        Some(handle) => handle.status.borrow().clone(),
        None => SessionStatus::idle(contract_id, DEFAULT_INTERVAL, Some("stream idle".to_string())),
    };
    Ok(snapshot)
}

pub async fn subscribe_bar_events(
    state: &AppState,
    contract_id: &str,
) -> Option<BarEventReceiver> {
    let sessions = state.sessions.lock().await;
    sessions
        .get(&contract_id.trim().to_ascii_uppercase())
        .map(|handle| handle.events.subscribe())
}

async fn shutdown_session(handle: ChartSessionHandle) {
    handle.cancellation_token.cancel();
    match handle.join_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            warn!(contract = %handle.config.contract_id, %error, "chart stream had already failed");
        }
        Err(error) => {
            warn!(contract = %handle.config.contract_id, %error, "chart stream task did not join");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::config::DEFAULT_CONTRACT_ID;
    use crate::market::mock::{MockBarSource, MockTickFeed};
    use crate::market::types::{ReconciliationState, Tick};
    use tokio::sync::broadcast::error::TryRecvError;
    use std::sync::Arc;
    use std::time::Duration;

    fn app_state(feed: Arc<MockTickFeed>) -> AppState {
        AppState::new(feed, Arc::new(MockBarSource::from_bars(Vec::new())))
    }

    fn args(contract_id: &str, interval_ms: i64) -> Option<ChartStreamArgs> {
        Some(ChartStreamArgs {
            contract_id: Some(contract_id.to_string()),
            interval_ms: Some(interval_ms),
            ..ChartStreamArgs::default()
        })
    }

    async fn wait_until_subscribed(feed: &MockTickFeed, contract_id: &str) {
        for _ in 0..1_000 {
            if feed.is_subscribed(contract_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("feed was never subscribed to {contract_id}");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let feed = Arc::new(MockTickFeed::new());
        let state = app_state(feed.clone());

        let _subscription = start_chart_stream(&state, args("btcusdt", 60_000))
            .await
            .expect("start should succeed");
        assert_eq!(state.active_contracts().await, vec!["BTCUSDT".to_string()]);

        let first = stop_chart_stream(&state, "BTCUSDT")
            .await
            .expect("stop should succeed");
        let second = stop_chart_stream(&state, "BTCUSDT")
            .await
            .expect("repeated stop should succeed");

        assert!(first.stopped);
        assert!(!second.stopped);
        assert!(state.active_contracts().await.is_empty());
        assert!(!feed.is_subscribed("BTCUSDT"));
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_a_contract_replaces_its_series() {
        let feed = Arc::new(MockTickFeed::new());
        let state = app_state(feed.clone());

        let first = start_chart_stream(&state, args("BTCUSDT", 60_000))
            .await
            .expect("first start should succeed");
        let second = start_chart_stream(&state, args("BTCUSDT", 300_000))
            .await
            .expect("second start should succeed");

        assert_eq!(first.session.interval, Interval::M1);
        assert_eq!(second.session.interval, Interval::M5);
        assert_eq!(state.active_contracts().await.len(), 1);

        let _ = stop_all_chart_streams(&state).await;
    }

    #[tokio::test(start_paused = true)]
    async fn contracts_stream_independently() {
        let feed = Arc::new(MockTickFeed::new());
        let state = app_state(feed.clone());

        let mut btc = start_chart_stream(&state, args("BTCUSDT", 60_000))
            .await
            .expect("btc start should succeed");
        let _eth = start_chart_stream(&state, args("ETHUSDT", 60_000))
            .await
            .expect("eth start should succeed");
        wait_until_subscribed(&feed, "BTCUSDT").await;
        wait_until_subscribed(&feed, "ETHUSDT").await;

        let now = crate::market::pipeline::now_unix_ms();
        assert!(feed.push(Tick::new("BTCUSDT", now, 42.0, 1.0)));
        let event = btc.events.recv().await.expect("btc bar event should arrive");
        assert_eq!(event.contract_id, "BTCUSDT");

        let stopped = stop_chart_stream(&state, "ETHUSDT")
            .await
            .expect("stop should succeed");
        assert!(stopped.stopped);
        assert!(feed.is_subscribed("BTCUSDT"));

        let status = chart_stream_status(&state, "BTCUSDT")
            .await
            .expect("status should be readable");
        assert_ne!(status.state, ReconciliationState::Error);

        assert_eq!(stop_all_chart_streams(&state).await, 1);
    }

    #[tokio::test]
    async fn unknown_contract_reports_idle_status() {
        let state = app_state(Arc::new(MockTickFeed::new()));
        let status = chart_stream_status(&state, "solusdt")
            .await
            .expect("status should be readable");

        assert_eq!(status.contract_id, "SOLUSDT");
        assert_eq!(status.state, ReconciliationState::HistoricalOnly);
        assert_eq!(status.reason.as_deref(), Some("stream idle"));
    }

    #[tokio::test]
    async fn rejects_invalid_arguments() {
        let state = app_state(Arc::new(MockTickFeed::new()));
        let result = start_chart_stream(&state, args("BTCUSDT", 12_345)).await;
        assert!(result.is_err());
        assert!(state.active_contracts().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_silences_buffered_frames_and_events() {
        let feed = Arc::new(MockTickFeed::new());
        let state = app_state(feed.clone());

        let mut subscription = start_chart_stream(&state, args("BTCUSDT", 60_000))
            .await
            .expect("start should succeed");
        wait_until_subscribed(&feed, "BTCUSDT").await;
        let now = crate::market::pipeline::now_unix_ms();
        assert!(feed.push(Tick::new("BTCUSDT", now, 42.0, 1.0)));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let result = stop_chart_stream(&state, "BTCUSDT")
            .await
            .expect("stop should succeed");

        assert!(result.stopped);
        assert!(subscription.frames.recv().await.is_none());
        assert!(matches!(subscription.events.try_recv(), Err(TryRecvError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_keep_a_single_session() {
        let feed = Arc::new(MockTickFeed::new());
        let state = Arc::new(app_state(feed.clone()));

        let registry = state.sessions.lock().await;
        let starts: Vec<_> = (0..2)
            .map(|_| {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    start_chart_stream(&state, None)
                        .await
                        .map(|subscription| subscription.session)
                })
            })
            .collect();
        tokio::task::yield_now().await;
        drop(registry);

        for start in starts {
            let _ = start
                .await
                .expect("start task should join")
                .expect("start should succeed");
        }
        assert_eq!(
            state.active_contracts().await,
            vec![DEFAULT_CONTRACT_ID.to_string()]
        );
        wait_until_subscribed(&feed, DEFAULT_CONTRACT_ID).await;

        assert_eq!(stop_all_chart_streams(&state).await, 1);
        let calls_after_stop = feed.subscribe_calls();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!feed.is_subscribed(DEFAULT_CONTRACT_ID));
        assert_eq!(feed.subscribe_calls(), calls_after_stop);
        assert!(feed.subscribe_calls() <= 2);
    }
}
