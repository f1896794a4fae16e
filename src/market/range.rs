use crate::market::config::RangeConfig;
use crate::market::types::{Bar, DisplayRange, RangeUpdate};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct PriceRangeTracker {
    config: RangeConfig,
    last_emitted: Option<DisplayRange>,
}

impl PriceRangeTracker {
    pub fn new(config: RangeConfig) -> Self {
        Self {
            config,
            last_emitted: None,
        }
    }

    pub fn with_last_emitted(mut self, range: DisplayRange) -> Self {
        self.last_emitted = Some(range);
        self
    }

    pub fn last_emitted(&self) -> Option<DisplayRange> {
        self.last_emitted
    }

    pub fn reset(&mut self) {
        self.last_emitted = None;
    }

    /// Pads the high/low extrema of `bars` and emits only when a bound moves by
    /// more than the hysteresis threshold relative to the last emitted range.
    pub fn compute_range<'a>(&mut self, bars: impl IntoIterator<Item = &'a Bar>) -> RangeUpdate {
        let Some((min, max)) = extrema(bars) else {
            return RangeUpdate::NoChange;
        };
        let candidate = self.pad(min, max);

        if let Some(previous) = self.last_emitted {
            let low_moved = exceeds_threshold(previous.low, candidate.low, self.config.hysteresis_pct);
            let high_moved =
                exceeds_threshold(previous.high, candidate.high, self.config.hysteresis_pct);
            if !low_moved && !high_moved {
                return RangeUpdate::NoChange;
            }
        }

        trace!(low = candidate.low, high = candidate.high, "display range changed");
        self.last_emitted = Some(candidate);
        RangeUpdate::Changed(candidate)
    }

    fn pad(&self, min: f64, max: f64) -> DisplayRange {
        let fraction = self.config.padding_pct / 100.0;
        let span = max - min;
        let padding = if span > 0.0 {
            span * fraction
        } else if max != 0.0 {
            max.abs() * fraction
        } else {
            1.0
        };

        let mut low = min - padding;
        if let Some(floor) = self.config.floor {
            low = low.max(floor);
        }
        DisplayRange {
            low,
            high: max + padding,
        }
    }
}

fn extrema<'a>(bars: impl IntoIterator<Item = &'a Bar>) -> Option<(f64, f64)> {
    bars.into_iter()
        .filter(|bar| bar.low.is_finite() && bar.high.is_finite())
        .fold(None, |acc, bar| match acc {
            None => Some((bar.low, bar.high)),
            Some((min, max)) => Some((min.min(bar.low), max.max(bar.high))),
        })
}

fn exceeds_threshold(previous: f64, next: f64, hysteresis_pct: f64) -> bool {
    if previous == 0.0 {
        return next != 0.0;
    }
    ((next - previous) / previous).abs() * 100.0 > hysteresis_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time: i64, low: f64, high: f64) -> Bar {
        Bar {
            open_time,
            interval_ms: 60_000,
            open: low,
            high,
            low,
            close: high,
            volume: 1.0,
            is_partial: false,
        }
    }

    fn tracker_after(previous: DisplayRange) -> PriceRangeTracker {
        PriceRangeTracker::new(RangeConfig::default()).with_last_emitted(previous)
    }

    #[test]
    fn suppresses_sub_percent_moves() {
        let mut tracker = tracker_after(DisplayRange {
            low: 100.0,
            high: 110.0,
        });
        let bars = [bar(0, 100.3, 105.0), bar(60_000, 104.0, 109.8)];

        assert_eq!(tracker.compute_range(bars.iter()), RangeUpdate::NoChange);
        assert_eq!(
            tracker.last_emitted(),
            Some(DisplayRange {
                low: 100.0,
                high: 110.0
            })
        );
    }

    #[test]
    fn emits_padded_range_on_large_move() {
        let mut tracker = tracker_after(DisplayRange {
            low: 100.0,
            high: 110.0,
        });
        let bars = [bar(0, 90.0, 100.0), bar(60_000, 95.0, 120.0)];

        match tracker.compute_range(bars.iter()) {
            RangeUpdate::Changed(range) => {
                assert!((range.low - 87.0).abs() < 1e-9);
                assert!((range.high - 123.0).abs() < 1e-9);
            }
            RangeUpdate::NoChange => panic!("expected a new range"),
        }
    }

    #[test]
    fn first_computation_always_emits() {
        let mut tracker = PriceRangeTracker::new(RangeConfig::default());
        let bars = [bar(0, 10.0, 20.0)];

        assert_eq!(
            tracker.compute_range(bars.iter()),
            RangeUpdate::Changed(DisplayRange {
                low: 9.0,
                high: 21.0
            })
        );
        assert_eq!(tracker.compute_range(bars.iter()), RangeUpdate::NoChange);
    }

    #[test]
    fn empty_series_has_no_range() {
        let mut tracker = PriceRangeTracker::new(RangeConfig::default());
        assert_eq!(tracker.compute_range(std::iter::empty()), RangeUpdate::NoChange);
        assert!(tracker.last_emitted().is_none());
    }

    #[test]
    fn flat_series_pads_around_price() {
        let mut tracker = PriceRangeTracker::new(RangeConfig::default());
        let bars = [bar(0, 50.0, 50.0)];

        assert_eq!(
            tracker.compute_range(bars.iter()),
            RangeUpdate::Changed(DisplayRange {
                low: 45.0,
                high: 55.0
            })
        );
    }

    #[test]
    fn clamps_low_bound_to_floor() {
        let mut tracker = PriceRangeTracker::new(RangeConfig {
            padding_pct: 50.0,
            floor: Some(0.0),
            ..RangeConfig::default()
        });
        let bars = [bar(0, 1.0, 5.0)];

        match tracker.compute_range(bars.iter()) {
            RangeUpdate::Changed(range) => {
                assert_eq!(range.low, 0.0);
                assert_eq!(range.high, 7.0);
            }
            RangeUpdate::NoChange => panic!("expected a new range"),
        }
    }

    #[test]
    fn zero_hysteresis_emits_every_change() {
        let mut tracker = PriceRangeTracker::new(RangeConfig {
            hysteresis_pct: 0.0,
            ..RangeConfig::default()
        });
        let _ = tracker.compute_range([bar(0, 100.0, 110.0)].iter());

        let update = tracker.compute_range([bar(0, 100.0, 110.01)].iter());
        assert!(matches!(update, RangeUpdate::Changed(_)));
    }
}
