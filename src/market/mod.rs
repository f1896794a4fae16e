pub mod aggregator;
pub mod binance;
pub mod config;
pub mod feed;
pub mod mock;
pub mod persistence;
pub mod pipeline;
pub mod range;
pub mod reconciler;
pub mod scheduler;
pub mod types;
