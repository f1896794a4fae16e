pub mod commands;
pub mod db;
pub mod error;
pub mod market;
pub mod state;

pub use error::{ChartError, SubscriptionError, ValidationError};
pub use market::aggregator::{BarAggregator, IngestOutcome};
pub use market::range::PriceRangeTracker;
pub use market::reconciler::{RetryPolicy, SeriesReconciler};
pub use market::scheduler::{Flush, RenderScheduler};
