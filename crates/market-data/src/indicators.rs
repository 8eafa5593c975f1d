//! Single-pass indicator calculations over confirmed kline series.
//!
//! Every series function is O(n) and returns the full sequence so callers can
//! take both the current value and a tail window without recomputation.

use crate::client::Kline;

/// Exponential moving average of closes; returns the final value.
#[must_use]
pub fn ema(klines: &[Kline], period: usize) -> f64 {
    ema_series(klines, period).last().copied().unwrap_or(0.0)
}

/// Full EMA series. Entries before `period - 1` are zero (seeded with SMA).
#[must_use]
pub fn ema_series(klines: &[Kline], period: usize) -> Vec<f64> {
    if period == 0 || klines.len() < period {
        return Vec::new();
    }

    let mut result = vec![0.0; klines.len()];
    let seed: f64 = klines[..period].iter().map(|k| k.close).sum::<f64>() / period as f64;
    let mut value = seed;
    result[period - 1] = value;

    let multiplier = 2.0 / (period as f64 + 1.0);
    for (i, k) in klines.iter().enumerate().skip(period) {
        value = (k.close - value) * multiplier + value;
        result[i] = value;
    }

    result
}

/// MACD line (EMA12 - EMA26); returns the final value.
#[must_use]
pub fn macd(klines: &[Kline]) -> f64 {
    macd_series(klines).last().copied().unwrap_or(0.0)
}

/// Full MACD series; entries before index 25 are zero.
#[must_use]
pub fn macd_series(klines: &[Kline]) -> Vec<f64> {
    if klines.len() < 26 {
        return Vec::new();
    }

    let ema12 = ema_series(klines, 12);
    let ema26 = ema_series(klines, 26);

    let mut result = vec![0.0; klines.len()];
    for i in 25..klines.len() {
        result[i] = ema12[i] - ema26[i];
    }
    result
}

/// MACD signal line: 9-period EMA of the (non-zero) MACD series.
#[must_use]
pub fn macd_signal(klines: &[Kline]) -> f64 {
    if klines.len() < 35 {
        return 0.0;
    }

    let valid: Vec<f64> = macd_series(klines).into_iter().filter(|v| *v != 0.0).collect();
    if valid.len() < 9 {
        return 0.0;
    }

    let mut signal: f64 = valid[..9].iter().sum::<f64>() / 9.0;
    let multiplier = 2.0 / 10.0;
    for v in &valid[9..] {
        signal = (v - signal) * multiplier + signal;
    }
    signal
}

/// Wilder-smoothed RSI; returns the final value.
#[must_use]
pub fn rsi(klines: &[Kline], period: usize) -> f64 {
    rsi_series(klines, period).last().copied().unwrap_or(0.0)
}

/// Full RSI series; entries before `period` are zero.
#[must_use]
pub fn rsi_series(klines: &[Kline], period: usize) -> Vec<f64> {
    if period == 0 || klines.len() <= period {
        return Vec::new();
    }

    let mut result = vec![0.0; klines.len()];

    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let change = klines[i].close - klines[i - 1].close;
        if change > 0.0 {
            gains += change;
        } else {
            losses += -change;
        }
    }

    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;
    result[period] = rsi_from_averages(avg_gain, avg_loss);

    let p = period as f64;
    for i in period + 1..klines.len() {
        let change = klines[i].close - klines[i - 1].close;
        if change > 0.0 {
            avg_gain = (avg_gain * (p - 1.0) + change) / p;
            avg_loss = (avg_loss * (p - 1.0)) / p;
        } else {
            avg_gain = (avg_gain * (p - 1.0)) / p;
            avg_loss = (avg_loss * (p - 1.0) + (-change)) / p;
        }
        result[i] = rsi_from_averages(avg_gain, avg_loss);
    }

    result
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// Wilder-smoothed average true range.
#[must_use]
pub fn atr(klines: &[Kline], period: usize) -> f64 {
    if period == 0 || klines.len() <= period {
        return 0.0;
    }

    let trs = true_ranges(klines);

    let mut value: f64 = trs[1..=period].iter().sum::<f64>() / period as f64;
    let p = period as f64;
    for tr in &trs[period + 1..] {
        value = (value * (p - 1.0) + tr) / p;
    }
    value
}

fn true_ranges(klines: &[Kline]) -> Vec<f64> {
    let mut trs = vec![0.0; klines.len()];
    for i in 1..klines.len() {
        let high = klines[i].high;
        let low = klines[i].low;
        let prev_close = klines[i - 1].close;
        trs[i] = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
    }
    trs
}

/// Trend-strength output of the directional movement system.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Dmi {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Wilder ADX with +DI/-DI over `period` (14 by convention).
///
/// Needs at least `2 * period + 1` bars for a meaningful ADX; returns the
/// default (all zero) below that.
#[must_use]
pub fn dmi(klines: &[Kline], period: usize) -> Dmi {
    if period == 0 || klines.len() < 2 * period + 1 {
        return Dmi::default();
    }

    let n = klines.len();
    let trs = true_ranges(klines);
    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];
    for i in 1..n {
        let up_move = klines[i].high - klines[i - 1].high;
        let down_move = klines[i - 1].low - klines[i].low;
        if up_move > down_move && up_move > 0.0 {
            plus_dm[i] = up_move;
        }
        if down_move > up_move && down_move > 0.0 {
            minus_dm[i] = down_move;
        }
    }

    // Wilder smoothing: seed with the first `period` sums, then
    // smoothed = prev - prev/period + current.
    let mut tr_s: f64 = trs[1..=period].iter().sum();
    let mut plus_s: f64 = plus_dm[1..=period].iter().sum();
    let mut minus_s: f64 = minus_dm[1..=period].iter().sum();

    let p = period as f64;
    let mut dx_values = Vec::with_capacity(n - period);
    let (mut plus_di, mut minus_di) = (0.0, 0.0);

    for i in period..n {
        if i > period {
            tr_s = tr_s - tr_s / p + trs[i];
            plus_s = plus_s - plus_s / p + plus_dm[i];
            minus_s = minus_s - minus_s / p + minus_dm[i];
        }

        if tr_s > 0.0 {
            plus_di = 100.0 * plus_s / tr_s;
            minus_di = 100.0 * minus_s / tr_s;
        }

        let di_sum = plus_di + minus_di;
        if di_sum > 0.0 {
            dx_values.push(100.0 * (plus_di - minus_di).abs() / di_sum);
        } else {
            dx_values.push(0.0);
        }
    }

    if dx_values.len() < period {
        return Dmi { adx: 0.0, plus_di, minus_di };
    }

    let mut adx: f64 = dx_values[..period].iter().sum::<f64>() / p;
    for dx in &dx_values[period..] {
        adx = (adx * (p - 1.0) + dx) / p;
    }

    Dmi { adx, plus_di, minus_di }
}

/// Percent change of the latest confirmed close vs `bars_back` bars earlier.
#[must_use]
pub fn price_change_pct(klines: &[Kline], bars_back: usize) -> f64 {
    if klines.len() < bars_back + 1 {
        return 0.0;
    }
    let current = klines[klines.len() - 1].close;
    let ago = klines[klines.len() - 1 - bars_back].close;
    if ago > 0.0 {
        ((current - ago) / ago) * 100.0
    } else {
        0.0
    }
}

/// Quote-denominated volume over the trailing `bars` bars.
#[must_use]
pub fn quote_volume(klines: &[Kline], bars: usize) -> f64 {
    if bars == 0 || klines.len() < bars {
        return 0.0;
    }
    let window = &klines[klines.len() - bars..];
    let total: f64 = window.iter().map(|k| k.volume).sum();
    let avg_price: f64 = window.iter().map(|k| k.close).sum::<f64>() / bars as f64;
    total * avg_price
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Kline {
        Kline {
            open_time: 0,
            open,
            high,
            low,
            close,
            volume: 100.0,
            close_time: 0,
        }
    }

    fn flat_series(price: f64, len: usize) -> Vec<Kline> {
        (0..len).map(|_| bar(price, price, price, price)).collect()
    }

    fn ramp_series(start: f64, step: f64, len: usize) -> Vec<Kline> {
        (0..len)
            .map(|i| {
                let c = start + step * i as f64;
                bar(c - step / 2.0, c + 1.0, c - 1.0, c)
            })
            .collect()
    }

    // ============================================
    // EMA
    // ============================================

    #[test]
    fn ema_of_constant_series_is_the_constant() {
        let klines = flat_series(50.0, 60);
        assert!((ema(&klines, 20) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn ema_tracks_rising_prices_from_below() {
        let klines = ramp_series(100.0, 1.0, 60);
        let value = ema(&klines, 20);
        let last = klines.last().unwrap().close;
        assert!(value < last);
        assert!(value > last - 25.0);
    }

    #[test]
    fn ema_series_empty_when_insufficient() {
        let klines = flat_series(10.0, 5);
        assert!(ema_series(&klines, 20).is_empty());
    }

    // ============================================
    // MACD
    // ============================================

    #[test]
    fn macd_positive_in_uptrend_negative_in_downtrend() {
        assert!(macd(&ramp_series(100.0, 1.0, 80)) > 0.0);
        assert!(macd(&ramp_series(200.0, -1.0, 80)) < 0.0);
    }

    #[test]
    fn macd_zero_for_flat_series() {
        assert!(macd(&flat_series(42.0, 80)).abs() < 1e-9);
    }

    #[test]
    fn macd_signal_lags_macd_in_steady_trend() {
        let klines = ramp_series(100.0, 1.0, 120);
        let line = macd(&klines);
        let signal = macd_signal(&klines);
        assert!(signal > 0.0);
        assert!(signal <= line + 1e-9);
    }

    // ============================================
    // RSI
    // ============================================

    #[test]
    fn rsi_is_100_for_monotonic_gains() {
        let klines = ramp_series(100.0, 1.0, 40);
        assert!((rsi(&klines, 14) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_is_low_for_monotonic_losses() {
        let klines = ramp_series(200.0, -1.0, 40);
        assert!(rsi(&klines, 14) < 1.0);
    }

    #[test]
    fn rsi_midrange_for_alternating_moves() {
        let mut klines = Vec::new();
        let mut price = 100.0;
        for i in 0..60 {
            price += if i % 2 == 0 { 1.0 } else { -1.0 };
            klines.push(bar(price, price + 0.5, price - 0.5, price));
        }
        let value = rsi(&klines, 14);
        assert!(value > 35.0 && value < 65.0, "rsi was {value}");
    }

    // ============================================
    // ATR
    // ============================================

    #[test]
    fn atr_matches_constant_range() {
        // Every bar spans exactly 2.0 with no gaps.
        let klines: Vec<Kline> = (0..40).map(|_| bar(100.0, 101.0, 99.0, 100.0)).collect();
        assert!((atr(&klines, 14) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn atr_zero_when_insufficient_history() {
        let klines = flat_series(10.0, 10);
        assert_eq!(atr(&klines, 14), 0.0);
    }

    // ============================================
    // ADX / DMI
    // ============================================

    #[test]
    fn dmi_uptrend_has_plus_di_dominant() {
        let klines = ramp_series(100.0, 1.0, 60);
        let d = dmi(&klines, 14);
        assert!(d.plus_di > d.minus_di);
        assert!(d.adx > 25.0, "adx was {}", d.adx);
    }

    #[test]
    fn dmi_downtrend_has_minus_di_dominant() {
        let klines = ramp_series(300.0, -1.0, 60);
        let d = dmi(&klines, 14);
        assert!(d.minus_di > d.plus_di);
        assert!(d.adx > 25.0);
    }

    #[test]
    fn dmi_default_when_insufficient() {
        let klines = flat_series(10.0, 20);
        assert_eq!(dmi(&klines, 14), Dmi::default());
    }

    // ============================================
    // Price change / volume
    // ============================================

    #[test]
    fn price_change_uses_confirmed_closes() {
        let klines = ramp_series(100.0, 1.0, 30);
        // 12 bars back on a +1/bar ramp ending at 129: (129-117)/117.
        let expected = (129.0 - 117.0) / 117.0 * 100.0;
        assert!((price_change_pct(&klines, 12) - expected).abs() < 1e-9);
    }

    #[test]
    fn quote_volume_sums_window() {
        let klines = flat_series(10.0, 20);
        // 10 bars * 100 volume * avg price 10.
        assert!((quote_volume(&klines, 10) - 10_000.0).abs() < 1e-9);
    }
}
