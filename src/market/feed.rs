use crate::error::{ChartError, SubscriptionError};
use crate::market::types::{Bar, Interval, Tick};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

pub type TickStream = BoxStream<'static, Result<Tick, ChartError>>;

/// Live market-data connector. Streams end when the connection drops or
/// `unsubscribe` is called for the contract.
pub trait TickFeed: Send + Sync {
    fn subscribe<'a>(
        &'a self,
        contract_id: &'a str,
    ) -> BoxFuture<'a, Result<TickStream, SubscriptionError>>;

    fn unsubscribe(&self, contract_id: &str);
}

/// Returns completed bars with `start_time <= open_time < end_time`, ascending.
pub trait HistoricalBarSource: Send + Sync {
    fn fetch_bars<'a>(
        &'a self,
        contract_id: &'a str,
        interval: Interval,
        start_time: i64,
        end_time: i64,
    ) -> BoxFuture<'a, Result<Vec<Bar>, ChartError>>;
}
