//! Trailing-stop promotion rules.
//!
//! The ladder protects a growing share of the open profit as price runs:
//! 40/50/60/70/80% at price moves of <3/3/5/7/10%. A stop is proposed only
//! once profit on margin reaches 5% and at least 1 USDT; the first stop is
//! clamped to break-even plus fees, and an existing stop may only move in
//! the favorable direction.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use perppilot_core::types::{PositionInfo, PositionSide};

/// Minimum profit on margin before trailing activates, percent.
const ACTIVATION_PROFIT_PCT: f64 = 5.0;
/// Minimum absolute profit before trailing activates, USDT.
const ACTIVATION_PROFIT_ABS: f64 = 1.0;
/// Fee allowance applied to the break-even clamp.
const BREAK_EVEN_FEE_PCT: f64 = 0.1;

/// A proposed trailing-stop update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingStop {
    pub stop_price: f64,
    /// Share of the price gain being locked in.
    pub protection_ratio: f64,
}

/// Protection ratio for a given favorable price move (percent).
#[must_use]
pub fn protection_ratio(price_move_pct: f64) -> f64 {
    if price_move_pct >= 10.0 {
        0.80
    } else if price_move_pct >= 7.0 {
        0.70
    } else if price_move_pct >= 5.0 {
        0.60
    } else if price_move_pct >= 3.0 {
        0.50
    } else {
        0.40
    }
}

/// Computes the raw trailing stop for a position, or `None` when the
/// activation thresholds are not met.
#[must_use]
pub fn propose(position: &PositionInfo) -> Option<TrailingStop> {
    let entry = position.entry_price.to_f64()?;
    let mark = position.mark_price.to_f64()?;
    let quantity = position.quantity.to_f64()?.abs();
    let pnl = position.unrealized_pnl.to_f64()?;

    if entry <= 0.0 || mark <= 0.0 || quantity <= 0.0 || position.leverage == 0 {
        return None;
    }

    let margin = quantity * entry / f64::from(position.leverage);
    if margin <= 0.0 {
        return None;
    }
    let profit_pct = pnl / margin * 100.0;
    if profit_pct < ACTIVATION_PROFIT_PCT || pnl.abs() < ACTIVATION_PROFIT_ABS {
        return None;
    }

    let price_move_pct = match position.side {
        PositionSide::Long => (mark - entry) / entry * 100.0,
        PositionSide::Short => (entry - mark) / entry * 100.0,
    };
    if price_move_pct <= 0.0 {
        return None;
    }

    let ratio = protection_ratio(price_move_pct);
    let stop_price = match position.side {
        PositionSide::Long => entry + (mark - entry) * ratio,
        PositionSide::Short => entry - (entry - mark) * ratio,
    };

    Some(TrailingStop { stop_price, protection_ratio: ratio })
}

/// Break-even price including the fee allowance.
#[must_use]
pub fn break_even_price(entry: f64, side: PositionSide) -> f64 {
    match side {
        PositionSide::Long => entry * (1.0 + BREAK_EVEN_FEE_PCT / 100.0),
        PositionSide::Short => entry * (1.0 - BREAK_EVEN_FEE_PCT / 100.0),
    }
}

/// Resolves a proposal against the current stop.
///
/// With no existing stop the proposal is clamped to at least break-even;
/// with one, the stop may only move favorably (up for longs, down for
/// shorts). Returns the stop to set, or `None` when nothing should change.
#[must_use]
pub fn resolve(
    proposal: TrailingStop,
    current_stop: Option<f64>,
    entry: f64,
    side: PositionSide,
) -> Option<f64> {
    match current_stop {
        None => {
            let break_even = break_even_price(entry, side);
            let clamped = match side {
                PositionSide::Long => proposal.stop_price.max(break_even),
                PositionSide::Short => proposal.stop_price.min(break_even),
            };
            Some(clamped)
        }
        Some(current) => match side {
            PositionSide::Long if proposal.stop_price > current => Some(proposal.stop_price),
            PositionSide::Short if proposal.stop_price < current => Some(proposal.stop_price),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_position(entry: f64, mark: f64, quantity: f64, leverage: u32) -> PositionInfo {
        let pnl = (mark - entry) * quantity;
        PositionInfo {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            entry_price: Decimal::try_from(entry).unwrap(),
            mark_price: Decimal::try_from(mark).unwrap(),
            quantity: Decimal::try_from(quantity).unwrap(),
            leverage,
            unrealized_pnl: Decimal::try_from(pnl).unwrap(),
            unrealized_pnl_pct: 0.0,
            liquidation_price: dec!(0),
            margin_used: dec!(0),
            open_time: None,
        }
    }

    fn short_position(entry: f64, mark: f64, quantity: f64, leverage: u32) -> PositionInfo {
        let pnl = (entry - mark) * quantity;
        PositionInfo {
            side: PositionSide::Short,
            unrealized_pnl: Decimal::try_from(pnl).unwrap(),
            mark_price: Decimal::try_from(mark).unwrap(),
            ..long_position(entry, entry, quantity, leverage)
        }
    }

    // ============================================
    // Ladder
    // ============================================

    #[test]
    fn ratio_ladder_thresholds() {
        assert_eq!(protection_ratio(1.0), 0.40);
        assert_eq!(protection_ratio(3.0), 0.50);
        assert_eq!(protection_ratio(5.0), 0.60);
        assert_eq!(protection_ratio(7.0), 0.70);
        assert_eq!(protection_ratio(10.0), 0.80);
        assert_eq!(protection_ratio(15.0), 0.80);
    }

    // ============================================
    // Activation
    // ============================================

    #[test]
    fn no_proposal_below_profit_threshold() {
        // 6x leverage, price +0.5% => profit 3% on margin: below 5%.
        let pos = long_position(100_000.0, 100_500.0, 0.01, 6);
        assert!(propose(&pos).is_none());
    }

    #[test]
    fn no_proposal_for_tiny_absolute_profit() {
        // Profit percent clears 5% but the absolute gain is under 1 USDT.
        let pos = long_position(100.0, 107.0, 0.1, 6);
        // margin = 0.1*100/6 = 1.67; pnl = 0.7 USDT < 1.0.
        assert!(propose(&pos).is_none());
    }

    #[test]
    fn trailing_promotion_at_seven_percent_move() {
        // Long from 100000 at 6x, mark 107000: 7% move, 42% on margin.
        let pos = long_position(100_000.0, 107_000.0, 0.1, 6);
        let proposal = propose(&pos).unwrap();
        assert!((proposal.protection_ratio - 0.70).abs() < 1e-9);
        // stop = 100000 + 7000 * 0.70 = 104900.
        assert!((proposal.stop_price - 104_900.0).abs() < 1e-6);

        // Prior stop at 99000: the new stop is higher, so it applies.
        let resolved = resolve(proposal, Some(99_000.0), 100_000.0, PositionSide::Long).unwrap();
        assert!((resolved - 104_900.0).abs() < 1e-6);
    }

    // ============================================
    // Favorable-only movement
    // ============================================

    #[test]
    fn stop_never_moves_backward_for_long() {
        let pos = long_position(100_000.0, 107_000.0, 0.1, 6);
        let proposal = propose(&pos).unwrap();
        assert!(resolve(proposal, Some(105_500.0), 100_000.0, PositionSide::Long).is_none());
    }

    #[test]
    fn stop_never_moves_backward_for_short() {
        let pos = short_position(100_000.0, 93_000.0, 0.1, 6);
        let proposal = propose(&pos).unwrap();
        // stop = 100000 - 7000*0.70 = 95100; an existing 94000 stop is better.
        assert!(resolve(proposal, Some(94_000.0), 100_000.0, PositionSide::Short).is_none());
        let applied = resolve(proposal, Some(97_000.0), 100_000.0, PositionSide::Short).unwrap();
        assert!((applied - 95_100.0).abs() < 1e-6);
    }

    // ============================================
    // Break-even clamp
    // ============================================

    #[test]
    fn first_stop_clamps_to_break_even() {
        // 5.2% move: raw stop = entry + gain*0.6 which is above break-even,
        // so no clamp needed.
        let pos = long_position(100_000.0, 105_200.0, 0.1, 6);
        let proposal = propose(&pos).unwrap();
        let resolved = resolve(proposal, None, 100_000.0, PositionSide::Long).unwrap();
        assert!(resolved >= break_even_price(100_000.0, PositionSide::Long));
        assert!((resolved - proposal.stop_price).abs() < 1e-9);
    }

    #[test]
    fn break_even_prices_include_fee() {
        assert!((break_even_price(100.0, PositionSide::Long) - 100.1).abs() < 1e-9);
        assert!((break_even_price(100.0, PositionSide::Short) - 99.9).abs() < 1e-9);
    }
}
