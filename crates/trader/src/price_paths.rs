//! Live price-path provider backing tracker evaluation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use perppilot_market_data::{BinanceMarketClient, MarketDataService};
use perppilot_tracker::{PricePathProvider, RealizedPath};

pub struct MarketPricePaths {
    client: Arc<BinanceMarketClient>,
    service: Arc<MarketDataService>,
}

impl MarketPricePaths {
    #[must_use]
    pub fn new(service: Arc<MarketDataService>) -> Self {
        Self { client: service.client(), service }
    }
}

#[async_trait]
impl PricePathProvider for MarketPricePaths {
    async fn price_path(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<RealizedPath> {
        let klines = self.client.klines_between(symbol, start, end).await?;
        let last = klines
            .last()
            .ok_or_else(|| anyhow::anyhow!("no klines for {symbol} in the window"))?;

        let high = klines.iter().map(|k| k.high).fold(f64::MIN, f64::max);
        let low = klines.iter().map(|k| k.low).fold(f64::MAX, f64::min);

        Ok(RealizedPath { final_price: last.close, high, low })
    }

    async fn current_price(&self, symbol: &str) -> anyhow::Result<f64> {
        Ok(self.service.get(symbol).await?.price)
    }
}
