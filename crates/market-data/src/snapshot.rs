//! Per-symbol market snapshots with a TTL cache and stale fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::client::{
    interval_minutes, kline_limit_for, BinanceMarketClient, Kline, MarketDataError,
};
use crate::indicators;
use perppilot_core::types::normalize_symbol;

const INTRADAY_TAIL: usize = 10;
const SNAPSHOT_TTL: Duration = Duration::from_secs(60);

/// Recent tail windows of the intraday series, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntradaySeries {
    pub mid_prices: Vec<f64>,
    pub ema20: Vec<f64>,
    pub macd: Vec<f64>,
    pub rsi7: Vec<f64>,
    pub rsi14: Vec<f64>,
}

/// Everything the decision pipeline knows about one symbol at one tick.
///
/// Indicators are computed over confirmed bars only; `price` alone comes
/// from the currently-forming bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    /// Realtime price from the forming bar.
    pub price: f64,
    pub ema20: f64,
    pub ema50: f64,
    pub ema200: f64,
    pub atr3: f64,
    pub atr14: f64,
    pub rsi7: f64,
    pub rsi14: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub price_change_15m: f64,
    pub price_change_30m: f64,
    pub price_change_1h: f64,
    pub price_change_4h: f64,
    pub price_change_24h: f64,
    /// 24h quote volume in USDT.
    pub volume_24h: f64,
    pub current_volume: f64,
    pub avg_volume: f64,
    /// Latest open interest in base units; zero when unavailable.
    pub open_interest: f64,
    pub funding_rate: f64,
    pub intraday: IntradaySeries,
    /// Close time of the last confirmed bar, epoch seconds.
    pub timestamp: i64,
}

impl MarketSnapshot {
    /// ATR14 as a percentage of price; the volatility proxy used everywhere.
    #[must_use]
    pub fn atr_pct(&self) -> f64 {
        if self.price > 0.0 {
            (self.atr14 / self.price) * 100.0
        } else {
            0.0
        }
    }

    /// Price deviation from EMA20, in percent.
    #[must_use]
    pub fn price_vs_ema20_pct(&self) -> f64 {
        if self.ema20 > 0.0 {
            ((self.price - self.ema20) / self.ema20) * 100.0
        } else {
            0.0
        }
    }

    /// Price deviation from EMA50, in percent.
    #[must_use]
    pub fn price_vs_ema50_pct(&self) -> f64 {
        if self.ema50 > 0.0 {
            ((self.price - self.ema50) / self.ema50) * 100.0
        } else {
            0.0
        }
    }

    /// Open interest expressed in quote currency.
    #[must_use]
    pub fn open_interest_notional(&self) -> f64 {
        self.open_interest * self.price
    }
}

/// Builds a snapshot from a raw kline series.
///
/// The last (still forming) bar supplies the realtime price and nothing
/// else; every indicator sees only the confirmed prefix.
pub fn build_snapshot(
    symbol: &str,
    klines: &[Kline],
    interval: &str,
    open_interest: f64,
    funding_rate: f64,
) -> Result<MarketSnapshot, MarketDataError> {
    // EMA200 needs 200 confirmed bars; anything shorter is unusable.
    const MIN_BARS: usize = 201;
    if klines.len() < MIN_BARS {
        return Err(MarketDataError::InsufficientHistory {
            symbol: symbol.to_string(),
            got: klines.len(),
            need: MIN_BARS,
        });
    }

    let confirmed = &klines[..klines.len() - 1];
    let price = klines[klines.len() - 1].close;

    let bar_minutes = interval_minutes(interval).unwrap_or(5);
    let bars_for = |minutes: i64| (minutes / bar_minutes) as usize;

    let ema20_series = indicators::ema_series(confirmed, 20);
    let macd_series = indicators::macd_series(confirmed);
    let rsi7_series = indicators::rsi_series(confirmed, 7);
    let rsi14_series = indicators::rsi_series(confirmed, 14);
    let dmi = indicators::dmi(confirmed, 14);

    let tail = |series: &[f64]| -> Vec<f64> {
        let start = series.len().saturating_sub(INTRADAY_TAIL);
        series[start..].to_vec()
    };

    let current_volume = confirmed.last().map_or(0.0, |k| k.volume);
    let avg_volume =
        confirmed.iter().map(|k| k.volume).sum::<f64>() / confirmed.len() as f64;

    Ok(MarketSnapshot {
        symbol: symbol.to_string(),
        price,
        ema20: ema20_series.last().copied().unwrap_or(0.0),
        ema50: indicators::ema(confirmed, 50),
        ema200: indicators::ema(confirmed, 200),
        atr3: indicators::atr(confirmed, 3),
        atr14: indicators::atr(confirmed, 14),
        rsi7: rsi7_series.last().copied().unwrap_or(0.0),
        rsi14: rsi14_series.last().copied().unwrap_or(0.0),
        macd: macd_series.last().copied().unwrap_or(0.0),
        macd_signal: indicators::macd_signal(confirmed),
        adx: dmi.adx,
        plus_di: dmi.plus_di,
        minus_di: dmi.minus_di,
        price_change_15m: indicators::price_change_pct(confirmed, bars_for(15)),
        price_change_30m: indicators::price_change_pct(confirmed, bars_for(30)),
        price_change_1h: indicators::price_change_pct(confirmed, bars_for(60)),
        price_change_4h: indicators::price_change_pct(confirmed, bars_for(240)),
        price_change_24h: indicators::price_change_pct(confirmed, bars_for(1440)),
        volume_24h: indicators::quote_volume(confirmed, bars_for(1440)),
        current_volume,
        avg_volume,
        open_interest,
        funding_rate,
        intraday: IntradaySeries {
            mid_prices: confirmed
                [confirmed.len().saturating_sub(INTRADAY_TAIL)..]
                .iter()
                .map(|k| k.close)
                .collect(),
            ema20: tail(&ema20_series),
            macd: tail(&macd_series),
            rsi7: tail(&rsi7_series),
            rsi14: tail(&rsi14_series),
        },
        timestamp: confirmed.last().map_or(0, |k| k.close_time / 1000),
    })
}

struct CacheEntry {
    snapshot: MarketSnapshot,
    fetched_at: Instant,
}

/// Snapshot service: fetch, compute, cache, degrade to stale.
pub struct MarketDataService {
    client: Arc<BinanceMarketClient>,
    interval: String,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl MarketDataService {
    #[must_use]
    pub fn new(client: Arc<BinanceMarketClient>, interval: impl Into<String>) -> Self {
        Self {
            client,
            interval: interval.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn client(&self) -> Arc<BinanceMarketClient> {
        Arc::clone(&self.client)
    }

    /// Returns the snapshot for `symbol`, serving the cache within its TTL
    /// and falling back to the last cached value when the upstream fails.
    pub async fn get(&self, symbol: &str) -> Result<MarketSnapshot, MarketDataError> {
        let symbol = normalize_symbol(symbol);

        if let Some(entry) = self.cache.read().get(&symbol) {
            if entry.fetched_at.elapsed() < SNAPSHOT_TTL {
                return Ok(entry.snapshot.clone());
            }
        }

        match self.fetch(&symbol).await {
            Ok(snapshot) => {
                self.cache.write().insert(
                    symbol,
                    CacheEntry { snapshot: snapshot.clone(), fetched_at: Instant::now() },
                );
                Ok(snapshot)
            }
            Err(err) => {
                if let Some(entry) = self.cache.read().get(&symbol) {
                    warn!(%symbol, error = %err, "serving stale market snapshot");
                    return Ok(entry.snapshot.clone());
                }
                Err(err)
            }
        }
    }

    async fn fetch(&self, symbol: &str) -> Result<MarketSnapshot, MarketDataError> {
        let limit = kline_limit_for(&self.interval);
        let klines = self.client.klines(symbol, &self.interval, limit).await?;

        // OI and funding are advisory; their failure never sinks a snapshot.
        let open_interest = self.client.open_interest(symbol).await.unwrap_or(0.0);
        let funding_rate = self.client.funding_rate(symbol).await.unwrap_or(0.0);

        build_snapshot(symbol, &klines, &self.interval, open_interest, funding_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(len: usize, last_close: f64) -> Vec<Kline> {
        (0..len)
            .map(|i| {
                let close = if i == len - 1 { last_close } else { 100.0 + (i % 7) as f64 * 0.1 };
                Kline {
                    open_time: i as i64 * 300_000,
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 50.0,
                    close_time: (i as i64 + 1) * 300_000 - 1,
                }
            })
            .collect()
    }

    #[test]
    fn forming_bar_is_excluded_from_indicators() {
        // A wild forming bar must not leak into any indicator.
        let mut klines = series(320, 100.0);
        let n = klines.len();
        klines[n - 1].close = 500.0;
        klines[n - 1].high = 510.0;
        klines[n - 1].low = 490.0;

        let snap = build_snapshot("BTCUSDT", &klines, "5m", 0.0, 0.0).unwrap();

        assert!((snap.price - 500.0).abs() < 1e-9);
        // EMA20 over the confirmed prefix stays near 100.
        assert!(snap.ema20 > 99.0 && snap.ema20 < 101.0, "ema20 {}", snap.ema20);
        assert!(snap.rsi14 < 80.0);
        // Timestamp is the close of the last confirmed bar, not the forming one.
        assert_eq!(snap.timestamp, klines[n - 2].close_time / 1000);
    }

    #[test]
    fn insufficient_history_is_an_error() {
        let klines = series(120, 100.0);
        assert!(matches!(
            build_snapshot("BTCUSDT", &klines, "5m", 0.0, 0.0),
            Err(MarketDataError::InsufficientHistory { .. })
        ));
    }

    #[test]
    fn intraday_tail_is_bounded() {
        let klines = series(320, 101.0);
        let snap = build_snapshot("ETHUSDT", &klines, "5m", 0.0, 0.0).unwrap();
        assert_eq!(snap.intraday.mid_prices.len(), INTRADAY_TAIL);
        assert!(snap.intraday.ema20.len() <= INTRADAY_TAIL);
        assert!(snap.intraday.rsi7.len() <= INTRADAY_TAIL);
    }

    #[test]
    fn atr_pct_and_ema_deviation_helpers() {
        let klines = series(320, 100.0);
        let snap = build_snapshot("BTCUSDT", &klines, "5m", 2000.0, 0.0001).unwrap();
        assert!(snap.atr_pct() > 0.0);
        assert!(snap.price_vs_ema20_pct().abs() < 5.0);
        assert!((snap.open_interest_notional() - 2000.0 * snap.price).abs() < 1e-6);
    }
}
