use crate::error::ChartError;
use crate::market::feed::HistoricalBarSource;
use crate::market::pipeline::now_unix_ms;
use crate::market::types::{Bar, Interval};
use futures_util::future::BoxFuture;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

fn map_bar_row(row: &sqlx::sqlite::SqliteRow) -> Result<Bar, ChartError> {
    Ok(Bar {
        open_time: row.try_get("open_time")?,
        interval_ms: row.try_get("interval_ms")?,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        volume: row.try_get("volume")?,
        is_partial: false,
    })
}

/// Completed bars keyed by contract, interval and open time.
#[derive(Debug, Clone)]
pub struct BarStore {
    pool: SqlitePool,
}

impl BarStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Partial bars are never written.
    pub async fn upsert_bars(&self, contract_id: &str, bars: &[Bar]) -> Result<usize, ChartError> {
        let updated_at_ms = now_unix_ms();
        let mut transaction = self.pool.begin().await?;
        let mut written = 0_usize;

        for bar in bars.iter().filter(|bar| !bar.is_partial) {
            sqlx::query(
                "INSERT INTO bars (contract_id, interval_ms, open_time, open, high, low, close, volume, updated_at_ms) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(contract_id, interval_ms, open_time) DO UPDATE SET \
                 open=excluded.open, high=excluded.high, low=excluded.low, close=excluded.close, \
                 volume=excluded.volume, updated_at_ms=excluded.updated_at_ms",
            )
            .bind(contract_id)
            .bind(bar.interval_ms)
            .bind(bar.open_time)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .bind(updated_at_ms)
            .execute(&mut *transaction)
            .await?;
            written += 1;
        }

        transaction.commit().await?;
        Ok(written)
    }

    pub async fn fetch_bars(
        &self,
        contract_id: &str,
        interval: Interval,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<Bar>, ChartError> {
        let rows = sqlx::query(
            "SELECT open_time, interval_ms, open, high, low, close, volume \
             FROM bars \
             WHERE contract_id = ? AND interval_ms = ? AND open_time >= ? AND open_time < ? \
             ORDER BY open_time ASC",
        )
        .bind(contract_id)
        .bind(interval.duration_ms())
        .bind(start_time)
        .bind(end_time)
        .fetch_all(&self.pool)
        .await?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            bars.push(map_bar_row(&row)?);
        }
        Ok(bars)
    }

    pub async fn count_bars(&self, contract_id: &str, interval: Interval) -> Result<i64, ChartError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM bars WHERE contract_id = ? AND interval_ms = ?",
        )
        .bind(contract_id)
        .bind(interval.duration_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

/// Writes upstream history through to the store and serves the store when
/// upstream fails.
pub struct CachedHistory<S> {
    upstream: S,
    store: BarStore,
}

impl<S> CachedHistory<S> {
    pub fn new(upstream: S, store: BarStore) -> Self {
        Self { upstream, store }
    }

    pub fn store(&self) -> &BarStore {
        &self.store
    }
}

impl<S: HistoricalBarSource> HistoricalBarSource for CachedHistory<S> {
    fn fetch_bars<'a>(
        &'a self,
        contract_id: &'a str,
        interval: Interval,
        start_time: i64,
        end_time: i64,
    ) -> BoxFuture<'a, Result<Vec<Bar>, ChartError>> {
        Box::pin(async move {
            match self
                .upstream
                .fetch_bars(contract_id, interval, start_time, end_time)
                .await
            {
                Ok(bars) => {
                    if let Err(error) = self.store.upsert_bars(contract_id, &bars).await {
                        warn!(contract = %contract_id, %error, "failed to cache historical bars");
                    }
                    Ok(bars)
                }
                Err(upstream_error) => {
                    let cached = self
                        .store
                        .fetch_bars(contract_id, interval, start_time, end_time)
                        .await?;
                    if cached.is_empty() {
                        return Err(upstream_error);
                    }
                    debug!(
                        contract = %contract_id,
                        count = cached.len(),
                        error = %upstream_error,
                        "serving cached history"
                    );
                    Ok(cached)
                }
            }
        })
    }
}
