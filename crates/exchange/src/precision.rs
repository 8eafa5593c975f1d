//! Lot-size / tick-size precision handling and the minimum-notional floor.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use perppilot_core::constants::MIN_NOTIONAL_USDT;

/// Precision discovered from the venue's symbol filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolFilters {
    pub quantity_precision: u32,
    pub price_precision: u32,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self { quantity_precision: 3, price_precision: 2 }
    }
}

/// Number of decimal places implied by a step/tick size string like
/// `"0.00100000"`.
#[must_use]
pub fn precision_from_step(step: &str) -> u32 {
    let trimmed = step.trim_end_matches('0').trim_end_matches('.');
    match trimmed.find('.') {
        Some(dot) => (trimmed.len() - dot - 1) as u32,
        None => 0,
    }
}

/// Truncates `quantity` to the lot precision and renders it.
#[must_use]
pub fn format_quantity(quantity: Decimal, filters: SymbolFilters) -> String {
    quantity
        .round_dp_with_strategy(
            filters.quantity_precision,
            rust_decimal::RoundingStrategy::ToZero,
        )
        .to_string()
}

/// Rounds `price` to the tick precision and renders it.
#[must_use]
pub fn format_price(price: Decimal, filters: SymbolFilters) -> String {
    price.round_dp(filters.price_precision).to_string()
}

/// Ensures `quantity * price` clears the venue's minimum notional after
/// precision truncation, rounding the quantity up when it does not.
#[must_use]
pub fn enforce_min_notional(quantity: Decimal, price: Decimal, filters: SymbolFilters) -> Decimal {
    let truncated = quantity.round_dp_with_strategy(
        filters.quantity_precision,
        rust_decimal::RoundingStrategy::ToZero,
    );
    let min_notional = Decimal::try_from(MIN_NOTIONAL_USDT).unwrap_or(Decimal::ONE_HUNDRED);

    if price <= Decimal::ZERO || truncated * price >= min_notional {
        return truncated;
    }

    let min_quantity = min_notional / price;
    min_quantity.round_dp_with_strategy(
        filters.quantity_precision,
        rust_decimal::RoundingStrategy::AwayFromZero,
    )
}

/// Notional value as f64 (for logging only).
#[must_use]
pub fn notional_f64(quantity: Decimal, price: Decimal) -> f64 {
    (quantity * price).to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn precision_from_step_strings() {
        assert_eq!(precision_from_step("0.00100000"), 3);
        assert_eq!(precision_from_step("0.1"), 1);
        assert_eq!(precision_from_step("1"), 0);
        assert_eq!(precision_from_step("1.0000"), 0);
        assert_eq!(precision_from_step("0.00000001"), 8);
    }

    #[test]
    fn quantity_truncates_never_rounds_up() {
        let filters = SymbolFilters { quantity_precision: 3, price_precision: 2 };
        assert_eq!(format_quantity(dec!(0.0019999), filters), "0.001");
        assert_eq!(format_quantity(dec!(1.2345), filters), "1.234");
    }

    #[test]
    fn price_rounds_to_tick() {
        let filters = SymbolFilters { quantity_precision: 3, price_precision: 2 };
        assert_eq!(format_price(dec!(108_200.456), filters), "108200.46");
    }

    #[test]
    fn min_notional_rounds_quantity_up() {
        let filters = SymbolFilters { quantity_precision: 3, price_precision: 2 };
        // 0.0009 BTC at 100k = 90 USDT < 100 USDT; bumped up to 0.001.
        let adjusted = enforce_min_notional(dec!(0.0009), dec!(100000), filters);
        assert_eq!(adjusted, dec!(0.001));
        assert!(adjusted * dec!(100000) >= dec!(100));
    }

    #[test]
    fn min_notional_leaves_large_orders_alone() {
        let filters = SymbolFilters { quantity_precision: 3, price_precision: 2 };
        let adjusted = enforce_min_notional(dec!(0.5), dec!(100000), filters);
        assert_eq!(adjusted, dec!(0.5));
    }

    #[test]
    fn truncation_below_notional_is_repaired() {
        let filters = SymbolFilters { quantity_precision: 0, price_precision: 2 };
        // 10.9 units at 10 USDT truncates to 10 units = 100 exactly.
        let adjusted = enforce_min_notional(dec!(10.9), dec!(10), filters);
        assert_eq!(adjusted, dec!(10));
        // 9.9 truncates to 9 = 90 < 100, bumped to 10.
        let adjusted = enforce_min_notional(dec!(9.9), dec!(10), filters);
        assert_eq!(adjusted, dec!(10));
    }
}
