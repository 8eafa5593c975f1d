//! Portfolio-level risk gate: aggregate exposure, correlation groups and
//! concentration checks before any open.

use tracing::warn;

use crate::AgentError;
use perppilot_core::types::{PositionInfo, PositionSide};

/// Max risk for a single symbol, percent of equity.
const MAX_SINGLE_SYMBOL_RISK_PCT: f64 = 10.0;
/// Max aggregate risk, percent of equity.
const MAX_TOTAL_RISK_PCT: f64 = 20.0;
/// Existing positions are assumed to risk this share of their margin.
const POSITION_RISK_FACTOR: f64 = 0.20;
/// Max same-side positions within one correlation group.
const MAX_CORRELATED_SAME_SIDE: usize = 2;

/// Fixed correlation groups; symbols outside any group are uncorrelated.
const CORRELATION_GROUPS: &[(&str, &[&str])] = &[
    ("majors", &["BTCUSDT", "ETHUSDT"]),
    ("l1", &["SOLUSDT", "AVAXUSDT", "NEARUSDT", "APTUSDT", "SUIUSDT"]),
    ("defi", &["UNIUSDT", "AAVEUSDT", "MKRUSDT", "COMPUSDT"]),
    ("meme", &["DOGEUSDT", "SHIBUSDT", "PEPEUSDT", "FLOKIUSDT"]),
    ("l2", &["ARBUSDT", "OPUSDT", "MATICUSDT"]),
];

#[must_use]
pub fn correlation_group(symbol: &str) -> Option<&'static str> {
    CORRELATION_GROUPS
        .iter()
        .find(|(_, members)| members.contains(&symbol))
        .map(|(name, _)| *name)
}

pub struct PortfolioRiskGate;

impl PortfolioRiskGate {
    /// Validates a prospective open against the existing book.
    ///
    /// Blocks on per-symbol risk, aggregate risk and correlated same-side
    /// concentration; an all-one-side book is only warned about.
    pub fn validate_new_position(
        positions: &[PositionInfo],
        symbol: &str,
        side: PositionSide,
        new_risk_usd: f64,
        total_equity: f64,
    ) -> Result<(), AgentError> {
        if total_equity <= 0.0 {
            return Err(AgentError::PortfolioRisk("no equity".to_string()));
        }

        let single_pct = new_risk_usd / total_equity * 100.0;
        if single_pct > MAX_SINGLE_SYMBOL_RISK_PCT {
            return Err(AgentError::PortfolioRisk(format!(
                "{symbol} risk {single_pct:.2}% exceeds the {MAX_SINGLE_SYMBOL_RISK_PCT:.0}% per-symbol cap"
            )));
        }

        let existing_risk: f64 = positions
            .iter()
            .map(|p| p.margin_used_f64() * POSITION_RISK_FACTOR)
            .sum();
        let total_pct = (existing_risk + new_risk_usd) / total_equity * 100.0;
        if total_pct > MAX_TOTAL_RISK_PCT {
            return Err(AgentError::PortfolioRisk(format!(
                "aggregate risk {total_pct:.2}% exceeds the {MAX_TOTAL_RISK_PCT:.0}% cap"
            )));
        }

        if let Some(group) = correlation_group(symbol) {
            let same_group_same_side = positions
                .iter()
                .filter(|p| p.side == side && correlation_group(&p.symbol) == Some(group))
                .count();
            if same_group_same_side >= MAX_CORRELATED_SAME_SIDE {
                return Err(AgentError::PortfolioRisk(format!(
                    "already {same_group_same_side} {} positions in the {group} group",
                    side.as_str()
                )));
            }
        }

        let longs = positions.iter().filter(|p| p.side == PositionSide::Long).count()
            + usize::from(side == PositionSide::Long);
        let shorts = positions.iter().filter(|p| p.side == PositionSide::Short).count()
            + usize::from(side == PositionSide::Short);
        let total = longs + shorts;
        if total >= 3 && (longs == total || shorts == total) {
            warn!(
                side = side.as_str(),
                positions = total,
                "entire book is one-sided; a reversal hits every position at once"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn position(symbol: &str, side: PositionSide, margin: i64) -> PositionInfo {
        PositionInfo {
            symbol: symbol.to_string(),
            side,
            entry_price: Decimal::ONE_HUNDRED,
            mark_price: Decimal::ONE_HUNDRED,
            quantity: Decimal::ONE,
            leverage: 5,
            unrealized_pnl: Decimal::ZERO,
            unrealized_pnl_pct: 0.0,
            liquidation_price: Decimal::ZERO,
            margin_used: Decimal::from(margin),
            open_time: None,
        }
    }

    #[test]
    fn accepts_reasonable_open() {
        let positions = vec![position("BTCUSDT", PositionSide::Long, 100)];
        assert!(PortfolioRiskGate::validate_new_position(
            &positions,
            "SOLUSDT",
            PositionSide::Long,
            50.0,
            1000.0
        )
        .is_ok());
    }

    #[test]
    fn rejects_oversized_single_symbol_risk() {
        let err = PortfolioRiskGate::validate_new_position(
            &[],
            "BTCUSDT",
            PositionSide::Long,
            150.0,
            1000.0,
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::PortfolioRisk(msg) if msg.contains("per-symbol")));
    }

    #[test]
    fn rejects_aggregate_risk_over_cap() {
        // Three positions with 300 margin each risk 60 each = 180 total;
        // adding 40 pushes to 220 = 22% of 1000.
        let positions = vec![
            position("BTCUSDT", PositionSide::Long, 300),
            position("SOLUSDT", PositionSide::Short, 300),
            position("UNIUSDT", PositionSide::Long, 300),
        ];
        let err = PortfolioRiskGate::validate_new_position(
            &positions,
            "DOGEUSDT",
            PositionSide::Long,
            40.0,
            1000.0,
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::PortfolioRisk(msg) if msg.contains("aggregate")));
    }

    #[test]
    fn rejects_third_correlated_same_side_position() {
        let positions = vec![
            position("SOLUSDT", PositionSide::Long, 50),
            position("AVAXUSDT", PositionSide::Long, 50),
        ];
        let err = PortfolioRiskGate::validate_new_position(
            &positions,
            "NEARUSDT",
            PositionSide::Long,
            30.0,
            1000.0,
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::PortfolioRisk(msg) if msg.contains("l1")));

        // The opposite side in the same group is fine.
        assert!(PortfolioRiskGate::validate_new_position(
            &positions,
            "NEARUSDT",
            PositionSide::Short,
            30.0,
            1000.0
        )
        .is_ok());
    }

    #[test]
    fn ungrouped_symbols_skip_the_correlation_check() {
        let positions = vec![
            position("XRPUSDT", PositionSide::Long, 50),
            position("LTCUSDT", PositionSide::Long, 50),
        ];
        assert!(PortfolioRiskGate::validate_new_position(
            &positions,
            "ADAUSDT",
            PositionSide::Long,
            30.0,
            1000.0
        )
        .is_ok());
    }

    #[test]
    fn correlation_group_lookup() {
        assert_eq!(correlation_group("BTCUSDT"), Some("majors"));
        assert_eq!(correlation_group("PEPEUSDT"), Some("meme"));
        assert_eq!(correlation_group("XRPUSDT"), None);
    }
}
