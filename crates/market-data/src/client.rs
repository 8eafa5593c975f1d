//! REST client for Binance USDⓈ-M futures market data.
//!
//! All requests flow through one process-wide rate limiter so concurrent
//! snapshot fetches cannot burst past the venue limits.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{direct::NotKeyed, InMemoryState};
use governor::{Quota, RateLimiter};
use serde_json::Value;
use thiserror::Error;

/// Errors from the market-data layer.
#[derive(Error, Debug)]
pub enum MarketDataError {
    /// The venue could not be reached or answered with an error status.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Not enough confirmed bars to compute the indicator set.
    #[error("insufficient history for {symbol}: {got} bars, need {need}")]
    InsufficientHistory {
        symbol: String,
        got: usize,
        need: usize,
    },

    /// The venue answered with a payload we could not interpret.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// One kline bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Close time in epoch milliseconds.
    pub close_time: i64,
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct BinanceMarketClient {
    http: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<DirectLimiter>,
}

impl BinanceMarketClient {
    /// Creates a client against the production futures endpoint.
    #[must_use]
    pub fn new() -> Self {
        Self::with_base_url("https://fapi.binance.com".to_string())
    }

    #[must_use]
    pub fn with_base_url(base_url: String) -> Self {
        // One request per 150 ms toward the venue, process-wide.
        let quota = Quota::with_period(Duration::from_millis(150))
            .unwrap_or_else(|| Quota::per_second(nonzero_ext::nonzero!(6u32)))
            .allow_burst(NonZeroU32::new(1).unwrap());
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    async fn get_json(&self, path_and_query: &str) -> Result<Value, MarketDataError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path_and_query);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| MarketDataError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MarketDataError::UpstreamUnavailable(format!(
                "HTTP {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| MarketDataError::MalformedPayload(e.to_string()))
    }

    /// Fetches up to `limit` klines for `symbol` at `interval`.
    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, MarketDataError> {
        let value = self
            .get_json(&format!(
                "/fapi/v1/klines?symbol={symbol}&interval={interval}&limit={limit}"
            ))
            .await?;
        parse_klines(&value)
    }

    /// Fetches the klines covering `[start, end]` for evaluation of a
    /// realized price path. The window is widened by one bar on the left so
    /// the path includes the bar containing `start`.
    pub async fn klines_between(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Kline>, MarketDataError> {
        let end = if end < start { start + chrono::Duration::hours(1) } else { end };
        let span = end - start;
        let interval = choose_evaluation_interval(span);
        let interval_ms = interval_minutes(interval).unwrap_or(1) * 60_000;
        let limit = ((span.num_milliseconds() / interval_ms) + 5).clamp(10, 1500);

        let value = self
            .get_json(&format!(
                "/fapi/v1/klines?symbol={symbol}&interval={interval}&startTime={}&endTime={}&limit={limit}",
                start.timestamp_millis() - interval_ms,
                end.timestamp_millis(),
            ))
            .await?;

        let mut klines = parse_klines(&value)?;
        klines.retain(|k| k.close_time >= start.timestamp_millis());
        Ok(klines)
    }

    /// Latest open interest, in base-asset units.
    pub async fn open_interest(&self, symbol: &str) -> Result<f64, MarketDataError> {
        let value = self
            .get_json(&format!("/fapi/v1/openInterest?symbol={symbol}"))
            .await?;
        value
            .get("openInterest")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| MarketDataError::MalformedPayload("openInterest missing".to_string()))
    }

    /// Last funding rate for the perpetual.
    pub async fn funding_rate(&self, symbol: &str) -> Result<f64, MarketDataError> {
        let value = self
            .get_json(&format!("/fapi/v1/premiumIndex?symbol={symbol}"))
            .await?;
        value
            .get("lastFundingRate")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| MarketDataError::MalformedPayload("lastFundingRate missing".to_string()))
    }
}

impl Default for BinanceMarketClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses the venue's raw kline array-of-arrays payload.
pub(crate) fn parse_klines(value: &Value) -> Result<Vec<Kline>, MarketDataError> {
    let rows = value
        .as_array()
        .ok_or_else(|| MarketDataError::MalformedPayload("klines payload not an array".to_string()))?;

    let mut klines = Vec::with_capacity(rows.len());
    for row in rows {
        let fields = row
            .as_array()
            .ok_or_else(|| MarketDataError::MalformedPayload("kline row not an array".to_string()))?;
        if fields.len() < 7 {
            continue;
        }
        klines.push(Kline {
            open_time: fields[0].as_i64().unwrap_or(0),
            open: field_f64(&fields[1]),
            high: field_f64(&fields[2]),
            low: field_f64(&fields[3]),
            close: field_f64(&fields[4]),
            volume: field_f64(&fields[5]),
            close_time: fields[6].as_i64().unwrap_or(0),
        });
    }
    Ok(klines)
}

fn field_f64(value: &Value) -> f64 {
    match value {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Bar length used to reconstruct a realized price path of the given span.
fn choose_evaluation_interval(span: chrono::Duration) -> &'static str {
    if span <= chrono::Duration::hours(6) {
        "1m"
    } else if span <= chrono::Duration::hours(24) {
        "5m"
    } else {
        "15m"
    }
}

/// Minutes per interval string, `None` for unknown intervals.
#[must_use]
pub fn interval_minutes(interval: &str) -> Option<i64> {
    match interval {
        "1m" => Some(1),
        "3m" => Some(3),
        "5m" => Some(5),
        "15m" => Some(15),
        "30m" => Some(30),
        "1h" => Some(60),
        "2h" => Some(120),
        "4h" => Some(240),
        _ => None,
    }
}

/// Number of bars of `interval` needed to cover roughly 25 hours, so EMA200
/// and the 24 h change always have history.
#[must_use]
pub fn kline_limit_for(interval: &str) -> usize {
    let minutes = interval_minutes(interval).unwrap_or(5);
    (1500 / minutes as usize) + 10
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_raw_kline_rows() {
        let payload = json!([
            [1_700_000_000_000_i64, "100.0", "101.5", "99.5", "100.7", "1234.5", 1_700_000_299_999_i64, "0", 0, "0", "0", "0"],
            [1_700_000_300_000_i64, "100.7", "102.0", "100.1", "101.9", "987.0", 1_700_000_599_999_i64, "0", 0, "0", "0", "0"]
        ]);
        let klines = parse_klines(&payload).unwrap();
        assert_eq!(klines.len(), 2);
        assert!((klines[0].close - 100.7).abs() < 1e-9);
        assert!((klines[1].high - 102.0).abs() < 1e-9);
        assert_eq!(klines[1].close_time, 1_700_000_599_999);
    }

    #[test]
    fn rejects_non_array_payload() {
        let payload = json!({"code": -1121, "msg": "Invalid symbol."});
        assert!(matches!(
            parse_klines(&payload),
            Err(MarketDataError::MalformedPayload(_))
        ));
    }

    #[test]
    fn kline_limit_covers_25_hours() {
        assert_eq!(kline_limit_for("5m"), 310);
        assert_eq!(kline_limit_for("1m"), 1510);
        assert_eq!(kline_limit_for("1h"), 35);
    }

    #[test]
    fn evaluation_interval_scales_with_span() {
        assert_eq!(choose_evaluation_interval(chrono::Duration::hours(2)), "1m");
        assert_eq!(choose_evaluation_interval(chrono::Duration::hours(12)), "5m");
        assert_eq!(choose_evaluation_interval(chrono::Duration::hours(30)), "15m");
    }
}
