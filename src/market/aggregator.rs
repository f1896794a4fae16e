use crate::error::ValidationError;
use crate::market::types::{Bar, BarUpdateEvent, BarUpdateKind, Interval, SeriesSnapshot, Tick};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Applied(BarUpdateEvent),
    /// The tick's bucket is already closed. Nothing was mutated.
    Late {
        bucket_open_time: i64,
        current_open_time: i64,
    },
    Duplicate {
        sequence: u64,
        last_sequence: u64,
    },
}

/// Sole mutator of one contract's completed bars and partial bar.
#[derive(Debug, Clone)]
pub struct BarAggregator {
    contract_id: String,
    interval: Interval,
    completed: Arc<Vec<Bar>>,
    partial: Option<Bar>,
    last_sequence: Option<u64>,
    last_tick_time: Option<i64>,
    late_ticks: u64,
}

impl BarAggregator {
    pub fn new(contract_id: impl Into<String>, interval: Interval) -> Self {
        Self {
            contract_id: contract_id.into(),
            interval,
            completed: Arc::new(Vec::new()),
            partial: None,
            last_sequence: None,
            last_tick_time: None,
            late_ticks: 0,
        }
    }

    pub fn contract_id(&self) -> &str {
        &self.contract_id
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn completed_bars(&self) -> &[Bar] {
        &self.completed
    }

    pub fn current_partial(&self) -> Option<&Bar> {
        self.partial.as_ref()
    }

    pub fn last_tick_time(&self) -> Option<i64> {
        self.last_tick_time
    }

    pub fn late_ticks(&self) -> u64 {
        self.late_ticks
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.partial.is_none()
    }

    pub fn first_open_time(&self) -> Option<i64> {
        self.completed
            .first()
            .or(self.partial.as_ref())
            .map(|bar| bar.open_time)
    }

    fn newest_open_time(&self) -> Option<i64> {
        self.partial
            .as_ref()
            .or_else(|| self.completed.last())
            .map(|bar| bar.open_time)
    }

    pub fn snapshot(&self) -> SeriesSnapshot {
        SeriesSnapshot {
            contract_id: self.contract_id.clone(),
            interval_ms: self.interval.duration_ms(),
            completed_bars: Arc::clone(&self.completed),
            current_partial: self.partial,
        }
    }

    pub fn ingest(&mut self, tick: &Tick) -> Result<IngestOutcome, ValidationError> {
        tick.validate()?;
        if tick.contract_id != self.contract_id {
            return Err(ValidationError::ContractMismatch {
                expected: self.contract_id.clone(),
                found: tick.contract_id.clone(),
            });
        }

        if let (Some(sequence), Some(last_sequence)) = (tick.sequence, self.last_sequence) {
            if sequence <= last_sequence {
                debug!(
                    contract = %self.contract_id,
                    sequence,
                    last_sequence,
                    "dropping replayed tick"
                );
                return Ok(IngestOutcome::Duplicate {
                    sequence,
                    last_sequence,
                });
            }
        }
        if tick.sequence.is_some() {
            self.last_sequence = tick.sequence;
        }

        let interval_ms = self.interval.duration_ms();
        let bucket_open_time = self.interval.bucket_open_time(tick.timestamp);

        if let Some(current_open_time) = self.newest_open_time() {
            let closed = match self.partial {
                Some(_) => bucket_open_time < current_open_time,
                None => bucket_open_time <= current_open_time,
            };
            if closed {
                self.late_ticks = self.late_ticks.saturating_add(1);
                warn!(
                    contract = %self.contract_id,
                    bucket = bucket_open_time,
                    current = current_open_time,
                    price = tick.price,
                    "dropping tick for closed bucket"
                );
                return Ok(IngestOutcome::Late {
                    bucket_open_time,
                    current_open_time,
                });
            }
        }

        self.last_tick_time = Some(tick.timestamp);

        match self.partial.as_mut() {
            Some(current) if current.open_time == bucket_open_time => {
                current.apply_tick(tick.price, tick.volume);
                Ok(IngestOutcome::Applied(BarUpdateEvent {
                    contract_id: self.contract_id.clone(),
                    bar: *current,
                    kind: BarUpdateKind::UpdateBar,
                }))
            }
            _ => {
                self.finalize_partial();
                let next = Bar::from_tick(bucket_open_time, interval_ms, tick.price, tick.volume);
                self.partial = Some(next);
                Ok(IngestOutcome::Applied(BarUpdateEvent {
                    contract_id: self.contract_id.clone(),
                    bar: next,
                    kind: BarUpdateKind::NewBar,
                }))
            }
        }
    }

    /// Closes the partial bar once `now_ms` has moved past its bucket.
    pub fn close_elapsed(&mut self, now_ms: i64) -> Option<Bar> {
        let current_bucket = self.interval.bucket_open_time(now_ms);
        match self.partial {
            Some(partial) if partial.open_time < current_bucket => self.finalize_partial(),
            _ => None,
        }
    }

    /// Drops the oldest completed bars beyond `max_completed`.
    pub fn trim_front(&mut self, max_completed: usize) -> usize {
        let overflow = self.completed.len().saturating_sub(max_completed);
        if overflow > 0 {
            Arc::make_mut(&mut self.completed).drain(0..overflow);
        }
        overflow
    }

    fn finalize_partial(&mut self) -> Option<Bar> {
        let mut finished = self.partial.take()?;
        finished.is_partial = false;
        Arc::make_mut(&mut self.completed).push(finished);
        Some(finished)
    }
}
