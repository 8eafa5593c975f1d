//! Entry-timing gate: a pure function of direction and market snapshot.
//!
//! Rejects chase and capitulation entries, asks for a pullback limit order
//! when the move is stretched but not broken, and otherwise lets the entry
//! through immediately. No LLM involvement.

use perppilot_core::types::{Confidence, Direction, Timeframe};
use perppilot_market_data::MarketSnapshot;

/// Directional-strength dominance factor: the opposing DI must exceed the
/// supporting DI by this much before the trend is considered hostile.
const DI_DOMINANCE: f64 = 1.5;
/// Tolerance band around EMA50 treated as range rather than trend.
const EMA50_TOLERANCE_PCT: f64 = 1.0;
/// Funding-rate crowding threshold (0.01%).
const FUNDING_LIMIT: f64 = 0.0001;
/// Minimum ADX for any entry.
const ADX_FLOOR: f64 = 25.0;

/// Outcome of the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryTiming {
    /// Enter at market now.
    Immediate,
    /// Rest a limit order at `limit_price` and wait for the pullback.
    WaitPullback {
        limit_price: f64,
        pullback_pct: f64,
        expiry_hours: u8,
        reason: String,
    },
    /// Do not enter this tick.
    Reject { reason: String },
}

/// Decides entry timing for a directional prediction.
#[must_use]
pub fn decide(direction: Direction, timeframe: Timeframe, snapshot: &MarketSnapshot) -> EntryTiming {
    debug_assert!(direction != Direction::Neutral);

    if let Some(reason) = trend_rejection(direction, snapshot) {
        return EntryTiming::Reject { reason };
    }

    if snapshot.adx < ADX_FLOOR {
        return EntryTiming::Reject {
            reason: format!("ADX {:.1} below {ADX_FLOOR:.0}: chop, no trend to join", snapshot.adx),
        };
    }

    if let Some(reason) = funding_rejection(direction, snapshot) {
        return EntryTiming::Reject { reason };
    }

    match classify(direction, snapshot) {
        Classification::Reject(reason) => EntryTiming::Reject { reason },
        Classification::Wait(reason) => {
            let limit_price = pullback_target(direction, snapshot);
            let pullback_pct = (limit_price - snapshot.price) / snapshot.price * 100.0;
            EntryTiming::WaitPullback {
                limit_price,
                pullback_pct,
                expiry_hours: expiry_hours(timeframe, snapshot),
                reason,
            }
        }
        Classification::Immediate => EntryTiming::Immediate,
    }
}

fn trend_rejection(direction: Direction, snapshot: &MarketSnapshot) -> Option<String> {
    if snapshot.ema50 <= 0.0 {
        return Some("no EMA50 context".to_string());
    }
    let dist_pct = snapshot.price_vs_ema50_pct();

    match direction {
        Direction::Up => {
            if snapshot.minus_di > snapshot.plus_di * DI_DOMINANCE {
                return Some(format!(
                    "-DI {:.1} dominates +DI {:.1}: sellers own this trend",
                    snapshot.minus_di, snapshot.plus_di
                ));
            }
            if dist_pct < -EMA50_TOLERANCE_PCT {
                return Some(format!(
                    "price {:.2}% below EMA50: longer-term trend is down",
                    dist_pct
                ));
            }
        }
        Direction::Down => {
            if snapshot.plus_di > snapshot.minus_di * DI_DOMINANCE {
                return Some(format!(
                    "+DI {:.1} dominates -DI {:.1}: buyers own this trend",
                    snapshot.plus_di, snapshot.minus_di
                ));
            }
            if dist_pct > EMA50_TOLERANCE_PCT {
                return Some(format!(
                    "price {:.2}% above EMA50: longer-term trend is up",
                    dist_pct
                ));
            }
        }
        Direction::Neutral => {}
    }
    None
}

fn funding_rejection(direction: Direction, snapshot: &MarketSnapshot) -> Option<String> {
    match direction {
        Direction::Up if snapshot.funding_rate > FUNDING_LIMIT => Some(format!(
            "funding {:.4}% over {:.2}%: longs are crowded",
            snapshot.funding_rate * 100.0,
            FUNDING_LIMIT * 100.0
        )),
        Direction::Down if snapshot.funding_rate < -FUNDING_LIMIT => Some(format!(
            "funding {:.4}% under -{:.2}%: shorts are crowded",
            snapshot.funding_rate * 100.0,
            FUNDING_LIMIT * 100.0
        )),
        _ => None,
    }
}

enum Classification {
    Immediate,
    Wait(String),
    Reject(String),
}

fn classify(direction: Direction, snapshot: &MarketSnapshot) -> Classification {
    let rsi14 = snapshot.rsi14;
    let change_1h = snapshot.price_change_1h;
    let vs_ema20 = snapshot.price_vs_ema20_pct();

    match direction {
        Direction::Up => {
            if rsi14 > 80.0 {
                return Classification::Reject(format!("RSI14 {rsi14:.1} extreme overbought"));
            }
            if change_1h > 5.0 {
                return Classification::Reject(format!(
                    "1h move {change_1h:+.2}% is a chase entry"
                ));
            }
            if vs_ema20 > 4.0 {
                return Classification::Reject(format!(
                    "price {vs_ema20:.1}% above EMA20: overextended"
                ));
            }
            if rsi14 > 70.0 || change_1h > 3.0 || vs_ema20 > 2.5 {
                return Classification::Wait(format!(
                    "stretched (rsi14 {rsi14:.1}, 1h {change_1h:+.2}%, vsEMA20 {vs_ema20:+.1}%): wait for the pullback"
                ));
            }
            Classification::Immediate
        }
        Direction::Down => {
            if rsi14 < 20.0 {
                return Classification::Reject(format!("RSI14 {rsi14:.1} extreme oversold"));
            }
            if change_1h < -5.0 {
                return Classification::Reject(format!(
                    "1h move {change_1h:+.2}% is a capitulation entry"
                ));
            }
            if vs_ema20 < -4.0 {
                return Classification::Reject(format!(
                    "price {:.1}% below EMA20: overextended",
                    vs_ema20
                ));
            }
            if rsi14 < 30.0 || change_1h < -3.0 || vs_ema20 < -2.5 {
                return Classification::Wait(format!(
                    "stretched (rsi14 {rsi14:.1}, 1h {change_1h:+.2}%, vsEMA20 {vs_ema20:+.1}%): wait for the bounce"
                ));
            }
            Classification::Immediate
        }
        Direction::Neutral => Classification::Reject("neutral direction".to_string()),
    }
}

/// Pullback limit target: the closest of EMA20, a 50% retracement of the 1h
/// move, and a fixed pullback scaled by RSI intensity.
fn pullback_target(direction: Direction, snapshot: &MarketSnapshot) -> f64 {
    let price = snapshot.price;
    let mut candidates = Vec::with_capacity(3);

    match direction {
        Direction::Up => {
            let ema_dist = (price - snapshot.ema20) / price * 100.0;
            if (0.3..2.5).contains(&ema_dist) {
                candidates.push(snapshot.ema20);
            }
            if snapshot.price_change_1h > 2.0 {
                let price_ago = price / (1.0 + snapshot.price_change_1h / 100.0);
                candidates.push(price - (price - price_ago) * 0.5);
            }
            let fixed_pct = if snapshot.rsi14 > 70.0 {
                1.5
            } else if snapshot.rsi14 > 65.0 {
                1.0
            } else {
                0.5
            };
            candidates.push(price * (1.0 - fixed_pct / 100.0));
        }
        _ => {
            let ema_dist = (snapshot.ema20 - price) / price * 100.0;
            if (0.3..2.5).contains(&ema_dist) {
                candidates.push(snapshot.ema20);
            }
            if snapshot.price_change_1h < -2.0 {
                let price_ago = price / (1.0 + snapshot.price_change_1h / 100.0);
                candidates.push(price + (price_ago - price) * 0.5);
            }
            let fixed_pct = if snapshot.rsi14 < 30.0 {
                1.5
            } else if snapshot.rsi14 < 35.0 {
                1.0
            } else {
                0.5
            };
            candidates.push(price * (1.0 + fixed_pct / 100.0));
        }
    }

    // The closest candidate fills soonest.
    candidates
        .into_iter()
        .min_by(|a, b| {
            (a - price)
                .abs()
                .partial_cmp(&(b - price).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(price)
}

/// Limit-order lifetime: base hours from the prediction horizon, shortened
/// in high volatility and stretched in low volatility, clamped to 1..=8.
fn expiry_hours(timeframe: Timeframe, snapshot: &MarketSnapshot) -> u8 {
    let base = match timeframe {
        Timeframe::H1 => 1.0,
        Timeframe::H4 => 3.0,
        Timeframe::H24 => 6.0,
    };
    let atr_pct = snapshot.atr_pct();
    let scaled = if atr_pct > 2.0 {
        base * 0.7
    } else if atr_pct < 0.5 {
        base * 1.3
    } else {
        base
    };
    (scaled as u8).clamp(1, 8)
}

/// Dynamic limit price when limit mode is on but the gate said immediate:
/// the nearest support/resistance within 0.3-2.0% of price, else an
/// ATR-scaled offset shrunk by confidence.
#[must_use]
pub fn dynamic_limit_price(
    direction: Direction,
    snapshot: &MarketSnapshot,
    confidence: Confidence,
) -> f64 {
    let price = snapshot.price;

    let mut levels: Vec<f64> = vec![snapshot.ema20, snapshot.ema50];
    if let (Some(low), Some(high)) = (
        snapshot.intraday.mid_prices.iter().copied().reduce(f64::min),
        snapshot.intraday.mid_prices.iter().copied().reduce(f64::max),
    ) {
        levels.push(low);
        levels.push(high);
    }

    let candidate = levels
        .into_iter()
        .filter(|level| {
            let dist_pct = (price - level) / price * 100.0;
            match direction {
                // Longs rest below price at support.
                Direction::Up => (0.3..=2.0).contains(&dist_pct),
                // Shorts rest above price at resistance.
                _ => (0.3..=2.0).contains(&(-dist_pct)),
            }
        })
        .min_by(|a, b| {
            (a - price)
                .abs()
                .partial_cmp(&(b - price).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

    if let Some(level) = candidate {
        return level;
    }

    // Fallback: offset by a slice of ATR, tighter when conviction is higher.
    let confidence_scale = match confidence {
        Confidence::High => 0.3,
        Confidence::Medium => 0.6,
        Confidence::Low => 1.0,
    };
    let offset_pct = (snapshot.atr_pct() * 0.25 * confidence_scale).clamp(0.15, 0.50);
    match direction {
        Direction::Up => price * (1.0 - offset_pct / 100.0),
        _ => price * (1.0 + offset_pct / 100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_uptrend() -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            price: 108_200.0,
            ema20: 107_500.0,
            ema50: 107_200.0,
            ema200: 100_000.0,
            atr3: 500.0,
            atr14: 800.0,
            rsi7: 60.0,
            rsi14: 55.0,
            macd: 100.0,
            macd_signal: 80.0,
            adx: 30.0,
            plus_di: 25.0,
            minus_di: 12.0,
            price_change_15m: 0.1,
            price_change_30m: 0.2,
            price_change_1h: 0.8,
            price_change_4h: 1.5,
            price_change_24h: 2.5,
            volume_24h: 1.0e9,
            current_volume: 1000.0,
            avg_volume: 900.0,
            open_interest: 80_000.0,
            funding_rate: 0.00005,
            intraday: Default::default(),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn healthy_entry_is_immediate() {
        let snap = healthy_uptrend();
        assert_eq!(decide(Direction::Up, Timeframe::H4, &snap), EntryTiming::Immediate);
    }

    #[test]
    fn weak_adx_rejects_both_sides() {
        let mut snap = healthy_uptrend();
        snap.adx = 18.0;
        assert!(matches!(
            decide(Direction::Up, Timeframe::H4, &snap),
            EntryTiming::Reject { .. }
        ));
    }

    #[test]
    fn hostile_di_rejects_long() {
        let mut snap = healthy_uptrend();
        snap.plus_di = 10.0;
        snap.minus_di = 16.0; // > 10 * 1.5
        assert!(matches!(
            decide(Direction::Up, Timeframe::H4, &snap),
            EntryTiming::Reject { .. }
        ));
    }

    #[test]
    fn price_below_ema50_band_rejects_long() {
        let mut snap = healthy_uptrend();
        snap.ema50 = snap.price * 1.02; // price 1.96% below EMA50
        assert!(matches!(
            decide(Direction::Up, Timeframe::H4, &snap),
            EntryTiming::Reject { .. }
        ));
        // Inside the 1% band the long survives the trend check.
        snap.ema50 = snap.price * 1.005;
        assert_eq!(decide(Direction::Up, Timeframe::H4, &snap), EntryTiming::Immediate);
    }

    #[test]
    fn crowded_funding_rejects_long() {
        let mut snap = healthy_uptrend();
        snap.funding_rate = 0.0002; // 0.02% > 0.01%
        assert!(matches!(
            decide(Direction::Up, Timeframe::H4, &snap),
            EntryTiming::Reject { .. }
        ));
        // Negative funding is fine for longs.
        snap.funding_rate = -0.0002;
        assert_eq!(decide(Direction::Up, Timeframe::H4, &snap), EntryTiming::Immediate);
    }

    #[test]
    fn extreme_overbought_rejects_long() {
        let mut snap = healthy_uptrend();
        snap.rsi14 = 81.0;
        assert!(matches!(
            decide(Direction::Up, Timeframe::H4, &snap),
            EntryTiming::Reject { .. }
        ));
    }

    #[test]
    fn big_1h_candle_rejects_long() {
        let mut snap = healthy_uptrend();
        snap.price_change_1h = 5.5;
        assert!(matches!(
            decide(Direction::Up, Timeframe::H4, &snap),
            EntryTiming::Reject { .. }
        ));
    }

    #[test]
    fn moderately_stretched_long_waits_for_pullback() {
        let mut snap = healthy_uptrend();
        snap.rsi14 = 72.0;
        match decide(Direction::Up, Timeframe::H4, &snap) {
            EntryTiming::WaitPullback { limit_price, pullback_pct, expiry_hours, .. } => {
                assert!(limit_price < snap.price);
                assert!(pullback_pct < 0.0);
                assert!((1..=8).contains(&expiry_hours));
            }
            other => panic!("expected wait, got {other:?}"),
        }
    }

    #[test]
    fn short_mirror_rules() {
        let mut snap = healthy_uptrend();
        // A healthy downtrend context.
        snap.ema50 = snap.price * 1.002;
        snap.plus_di = 10.0;
        snap.minus_di = 20.0;
        snap.rsi14 = 45.0;
        snap.price_change_1h = -0.8;
        assert_eq!(decide(Direction::Down, Timeframe::H4, &snap), EntryTiming::Immediate);

        // Extreme oversold is a reject.
        snap.rsi14 = 18.0;
        assert!(matches!(
            decide(Direction::Down, Timeframe::H4, &snap),
            EntryTiming::Reject { .. }
        ));

        // Moderately oversold waits for the bounce above price.
        snap.rsi14 = 28.0;
        match decide(Direction::Down, Timeframe::H4, &snap) {
            EntryTiming::WaitPullback { limit_price, .. } => assert!(limit_price > snap.price),
            other => panic!("expected wait, got {other:?}"),
        }
    }

    #[test]
    fn expiry_scales_with_timeframe_and_volatility() {
        let snap = healthy_uptrend(); // atr% 0.74
        assert_eq!(expiry_hours(Timeframe::H1, &snap), 1);
        assert_eq!(expiry_hours(Timeframe::H4, &snap), 3);
        assert_eq!(expiry_hours(Timeframe::H24, &snap), 6);

        let mut high_vol = healthy_uptrend();
        high_vol.atr14 = 3000.0; // atr% 2.8
        assert_eq!(expiry_hours(Timeframe::H24, &high_vol), 4);

        let mut low_vol = healthy_uptrend();
        low_vol.atr14 = 400.0; // atr% 0.37
        assert_eq!(expiry_hours(Timeframe::H24, &low_vol), 7);
    }

    #[test]
    fn dynamic_limit_prefers_nearby_support() {
        let snap = healthy_uptrend();
        // EMA20 is 0.65% below price: inside the 0.3-2.0% window.
        let limit = dynamic_limit_price(Direction::Up, &snap, Confidence::High);
        assert!((limit - snap.ema20).abs() < 1e-9);
    }

    #[test]
    fn dynamic_limit_falls_back_to_atr_offset() {
        let mut snap = healthy_uptrend();
        // Push the EMAs out of the window so no level qualifies.
        snap.ema20 = snap.price * 0.96;
        snap.ema50 = snap.price * 0.95;
        let limit = dynamic_limit_price(Direction::Up, &snap, Confidence::High);
        let offset_pct = (snap.price - limit) / snap.price * 100.0;
        assert!((0.15..=0.50).contains(&offset_pct));

        // Lower confidence rests further away.
        let limit_low = dynamic_limit_price(Direction::Up, &snap, Confidence::Low);
        assert!(limit_low < limit);
    }
}
