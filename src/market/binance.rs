use crate::error::{ChartError, SubscriptionError};
use crate::market::feed::{HistoricalBarSource, TickFeed, TickStream};
use crate::market::types::{parse_agg_trade_payload, Bar, Interval, KlineWire, Tick};
use futures_util::future::{self, BoxFuture};
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BINANCE_STREAM_BASE_URL: &str = "wss://stream.binance.com:9443/ws";
const BINANCE_REST_BASE_URL: &str = "https://api.binance.com";
const BINANCE_MAX_KLINES_PER_REQUEST: usize = 1_000;

pub type BinanceWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn ws_endpoint(symbol: &str) -> String {
    format!(
        "{BINANCE_STREAM_BASE_URL}/{}@aggTrade",
        symbol.to_ascii_lowercase()
    )
}

fn klines_endpoint(
    symbol: &str,
    interval: Interval,
    limit: u16,
    start_time: i64,
    end_time: Option<i64>,
) -> String {
    let mut endpoint = format!("{BINANCE_REST_BASE_URL}/api/v3/klines")
        + &format!(
            "?symbol={}&interval={}&limit={limit}&startTime={start_time}",
            symbol.to_ascii_uppercase(),
            interval.as_str()
        );
    if let Some(value) = end_time {
        endpoint.push_str(&format!("&endTime={value}"));
    }
    endpoint
}

pub async fn connect_agg_trade_stream(symbol: &str) -> Result<BinanceWsStream, ChartError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let request = ws_endpoint(symbol);
    let (stream, _) = connect_async_with_config(request, Some(ws_config), true).await?;
    Ok(stream)
}

fn decode_message(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<Tick, ChartError>> {
    let mut payload = match message {
        Ok(Message::Text(text_payload)) => text_payload.into_bytes(),
        Ok(Message::Binary(binary_payload)) => binary_payload,
        Ok(Message::Close(frame)) => {
            debug!(?frame, "aggTrade stream closed by venue");
            return None;
        }
        Ok(_) => return None,
        Err(error) => return Some(Err(error.into())),
    };

    match parse_agg_trade_payload(payload.as_mut_slice()) {
        Ok(tick) => Some(Ok(tick)),
        Err(error) => {
            warn!(%error, "failed to decode aggTrade payload");
            None
        }
    }
}

/// Live ticks from the venue's aggregate-trade websocket, one connection per contract.
#[derive(Debug, Default)]
pub struct BinanceTickFeed {
    sessions: Mutex<HashMap<String, CancellationToken>>,
}

impl BinanceTickFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_contracts(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl TickFeed for BinanceTickFeed {
    fn subscribe<'a>(
        &'a self,
        contract_id: &'a str,
    ) -> BoxFuture<'a, Result<TickStream, SubscriptionError>> {
        Box::pin(async move {
            let stream = connect_agg_trade_stream(contract_id)
                .await
                .map_err(|error| SubscriptionError::connect(contract_id, error))?;

            let token = CancellationToken::new();
            let previous = self
                .sessions
                .lock()
                .insert(contract_id.to_ascii_uppercase(), token.clone());
            if let Some(previous) = previous {
                previous.cancel();
            }
            info!(contract = %contract_id, "aggTrade stream connected");

            let ticks = stream
                .take_until(token.cancelled_owned())
                .filter_map(|message| future::ready(decode_message(message)))
                .boxed();
            Ok(ticks)
        })
    }

    fn unsubscribe(&self, contract_id: &str) {
        let removed = self.sessions.lock().remove(&contract_id.to_ascii_uppercase());
        if let Some(token) = removed {
            token.cancel();
            info!(contract = %contract_id, "aggTrade stream released");
        }
    }
}

/// Completed klines over REST, paged forward from `start_time`.
#[derive(Debug, Clone, Default)]
pub struct BinanceBarSource {
    client: Client,
}

impl BinanceBarSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl HistoricalBarSource for BinanceBarSource {
    fn fetch_bars<'a>(
        &'a self,
        contract_id: &'a str,
        interval: Interval,
        start_time: i64,
        end_time: i64,
    ) -> BoxFuture<'a, Result<Vec<Bar>, ChartError>> {
        Box::pin(async move {
            let klines =
                fetch_klines_wire_range(&self.client, contract_id, interval, start_time, end_time)
                    .await?;
            let interval_ms = interval.duration_ms();

            let mut bars = Vec::with_capacity(klines.len());
            for kline in klines {
                let open_time = kline.0;
                match kline.into_bar(interval_ms) {
                    Ok(bar) => bars.push(bar),
                    Err(error) => {
                        warn!(contract = %contract_id, open_time, %error, "skipping malformed kline");
                    }
                }
            }
            Ok(bars)
        })
    }
}

async fn fetch_klines_wire_range(
    client: &Client,
    symbol: &str,
    interval: Interval,
    start_time: i64,
    end_time: i64,
) -> Result<Vec<KlineWire>, ChartError> {
    if end_time <= start_time {
        return Ok(Vec::new());
    }

    let interval_ms = interval.duration_ms();
    let mut cursor = start_time;
    let mut klines = Vec::new();

    while cursor < end_time {
        let endpoint = klines_endpoint(
            symbol,
            interval,
            BINANCE_MAX_KLINES_PER_REQUEST as u16,
            cursor,
            Some(end_time - 1),
        );
        let response = client.get(endpoint).send().await?.error_for_status()?;
        let mut payload = response.json::<Vec<KlineWire>>().await?;
        let page_len = payload.len();
        let Some(newest_open_time) = payload.last().map(|kline| kline.0) else {
            break;
        };
        klines.append(&mut payload);

        if page_len < BINANCE_MAX_KLINES_PER_REQUEST || newest_open_time < cursor {
            break;
        }
        cursor = newest_open_time.saturating_add(interval_ms);
    }

    klines.sort_unstable_by_key(|kline| kline.0);
    klines.dedup_by_key(|kline| kline.0);
    klines.retain(|kline| kline.0 >= start_time && kline.0 < end_time);
    debug!(symbol, count = klines.len(), "fetched klines");

    Ok(klines)
}
