use clap::Parser;
use live_bars::commands::chart_stream::{
    start_chart_stream, stop_all_chart_streams, ChartStreamSubscription,
};
use live_bars::db::initialize_pool;
use live_bars::market::binance::{BinanceBarSource, BinanceTickFeed};
use live_bars::market::config::{
    ChartStreamArgs, DEFAULT_CONTRACT_ID, DEFAULT_THROTTLE_WINDOW_MS, DEFAULT_VISIBLE_BARS,
};
use live_bars::market::feed::{HistoricalBarSource, TickFeed};
use live_bars::market::mock::{spawn_synthetic_ticks, MockBarSource, MockTickFeed};
use live_bars::market::persistence::{BarStore, CachedHistory};
use live_bars::market::types::Interval;
use live_bars::state::AppState;
use live_bars::ChartError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MOCK_TICK_PERIOD_MS: u64 = 25;
const MOCK_BASE_PRICE: f64 = 100_000.0;

#[derive(Debug, Parser)]
#[command(name = "live-bars")]
#[command(about = "Stream live OHLCV bars for one contract", long_about = None)]
#[command(version)]
struct Cli {
    /// Contract identifier (e.g., BTCUSDT)
    #[arg(short, long, default_value = DEFAULT_CONTRACT_ID)]
    symbol: String,

    /// Bar interval: 1m, 5m, 15m, 30m, 1h, 4h, 1d or 1w
    #[arg(short, long, default_value = "1m")]
    interval: String,

    /// Use the in-process synthetic feed instead of the venue
    #[arg(long)]
    mock: bool,

    /// Wait for the full historical snapshot before going live
    #[arg(long)]
    history_first: bool,

    /// SQLite file used to cache completed historical bars
    #[arg(long)]
    cache_db: Option<PathBuf>,

    /// Render throttle window in milliseconds
    #[arg(long, default_value_t = DEFAULT_THROTTLE_WINDOW_MS)]
    throttle_ms: u64,

    /// Number of newest bars used for the display range
    #[arg(long, default_value_t = DEFAULT_VISIBLE_BARS)]
    visible_bars: usize,
}

#[tokio::main]
async fn main() -> Result<(), ChartError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let interval = Interval::parse_str(&cli.interval)?;
    let shutdown = CancellationToken::new();

    let (feed, history, mock_feed) = if cli.mock {
        let mock_feed = Arc::new(MockTickFeed::new());
        let feed: Arc<dyn TickFeed> = mock_feed.clone();
        let history: Arc<dyn HistoricalBarSource> =
            Arc::new(MockBarSource::synthetic(MOCK_BASE_PRICE));
        (feed, history, Some(mock_feed))
    } else {
        let history: Arc<dyn HistoricalBarSource> = match cli.cache_db.as_deref() {
            Some(path) => {
                let pool = initialize_pool(Some(path)).await?;
                Arc::new(CachedHistory::new(BinanceBarSource::new(), BarStore::new(pool)))
            }
            None => Arc::new(BinanceBarSource::new()),
        };
        let feed: Arc<dyn TickFeed> = Arc::new(BinanceTickFeed::new());
        (feed, history, None)
    };

    let state = AppState::new(feed, history);
    let args = ChartStreamArgs {
        contract_id: Some(cli.symbol),
        interval_ms: Some(interval.duration_ms()),
        prefer_realtime: Some(!cli.history_first),
        throttle_window_ms: Some(cli.throttle_ms),
        visible_bars: Some(cli.visible_bars),
        ..ChartStreamArgs::default()
    };
    let subscription = start_chart_stream(&state, Some(args)).await?;
    info!(
        contract = %subscription.session.contract_id,
        interval = subscription.session.interval.as_str(),
        prefer_realtime = subscription.session.prefer_realtime,
        "chart stream started"
    );

    let producer = mock_feed.map(|feed| {
        spawn_synthetic_ticks(
            feed,
            subscription.session.contract_id.clone(),
            Duration::from_millis(MOCK_TICK_PERIOD_MS),
            shutdown.clone(),
        )
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(error) = signal {
                warn!(%error, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
        }
        _ = log_frames(subscription) => {}
    }

    shutdown.cancel();
    let stopped = stop_all_chart_streams(&state).await;
    if let Some(producer) = producer {
        let _ = producer.await;
    }
    info!(stopped, "all chart streams stopped");
    Ok(())
}

async fn log_frames(mut subscription: ChartStreamSubscription) {
    while let Some(flush) = subscription.frames.recv().await {
        let frame = flush.state;
        let last = frame.snapshot.last_bar().copied();
        info!(
            seq = flush.seq,
            coalesced = flush.coalesced,
            state = frame.state.as_str(),
            bars = frame.snapshot.len(),
            open_time = last.map(|bar| bar.open_time),
            close = last.map(|bar| bar.close),
            low = frame.range.map(|range| range.low),
            high = frame.range.map(|range| range.high),
            "frame"
        );
    }

    let status = subscription.status.borrow().clone();
    warn!(
        state = status.state.as_str(),
        reason = status.reason.as_deref().unwrap_or("none"),
        "chart stream ended"
    );
}
