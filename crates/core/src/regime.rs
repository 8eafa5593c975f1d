//! Deterministic market-regime classification.
//!
//! The regime drives take-profit expectations and which R/R rescue path the
//! risk engine may take. It is computed from the reference symbol's snapshot
//! (price vs EMA50/EMA200 plus the ATR% tier) so the LLM never gets to pick
//! it.

use serde::{Deserialize, Serialize};

use crate::constants::ATR_PCT_NARROW;

/// Coarse market state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    TrendingUp,
    TrendingDown,
    Range,
    Narrow,
}

impl Regime {
    /// Trending regimes let profit run; the R/R floor may be met by scaling
    /// the take-profit target instead of aborting.
    #[must_use]
    pub const fn is_trending(self) -> bool {
        matches!(self, Self::TrendingUp | Self::TrendingDown)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TrendingUp => "trending_up",
            Self::TrendingDown => "trending_down",
            Self::Range => "range",
            Self::Narrow => "narrow",
        }
    }

    /// Classifies from the reference snapshot values.
    ///
    /// ATR% below [`ATR_PCT_NARROW`] is a narrow consolidation regardless of
    /// the EMA stack; otherwise the EMA50/EMA200 alignment decides.
    #[must_use]
    pub fn classify(price: f64, ema50: f64, ema200: f64, atr_pct: f64) -> Self {
        if atr_pct < ATR_PCT_NARROW {
            return Self::Narrow;
        }
        if price > ema50 && ema50 > ema200 {
            Self::TrendingUp
        } else if price < ema50 && ema50 < ema200 {
            Self::TrendingDown
        } else {
            Self::Range
        }
    }
}
