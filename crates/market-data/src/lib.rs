pub mod client;
pub mod indicators;
pub mod snapshot;

pub use client::{BinanceMarketClient, Kline, MarketDataError};
pub use snapshot::{IntradaySeries, MarketDataService, MarketSnapshot};
