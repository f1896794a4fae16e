use crate::error::ChartError;
use crate::market::config::ChartStreamConfig;
use crate::market::feed::{HistoricalBarSource, TickFeed};
use crate::market::pipeline::{system_clock, BarEventHub, ChartStreamSources, Clock};
use crate::market::types::SessionStatus;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ChartSessionHandle {
    pub config: ChartStreamConfig,
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<Result<(), ChartError>>,
    pub status: watch::Receiver<SessionStatus>,
    pub events: BarEventHub,
}

/// One session per contract; different contracts run independently.
pub struct AppState {
    pub feed: Arc<dyn TickFeed>,
    pub history: Arc<dyn HistoricalBarSource>,
    pub clock: Clock,
    pub sessions: Mutex<HashMap<String, ChartSessionHandle>>,
}

impl AppState {
    pub fn new(feed: Arc<dyn TickFeed>, history: Arc<dyn HistoricalBarSource>) -> Self {
        Self {
            feed,
            history,
            clock: system_clock(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn sources(&self) -> ChartStreamSources {
        ChartStreamSources::new(Arc::clone(&self.feed), Arc::clone(&self.history))
            .with_clock(Arc::clone(&self.clock))
    }

    pub async fn active_contracts(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        let mut contracts: Vec<String> = sessions.keys().cloned().collect();
        contracts.sort_unstable();
        contracts
    }
}
