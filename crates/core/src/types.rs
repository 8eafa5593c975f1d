//! Domain types shared across the decision pipeline.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Predicted price direction for a symbol over the prediction timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Neutral,
}

impl Direction {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
            Self::Neutral => Self::Neutral,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Neutral => "neutral",
        }
    }
}

/// Prediction confidence tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Risk tier attached to a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Horizon over which a prediction is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "24h")]
    H24,
}

impl Timeframe {
    #[must_use]
    pub const fn hours(self) -> i64 {
        match self {
            Self::H1 => 1,
            Self::H4 => 4,
            Self::H24 => 24,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::H24 => "24h",
        }
    }
}

/// Side of a held position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    /// The prediction direction that agrees with holding this side.
    #[must_use]
    pub const fn agreeing_direction(self) -> Direction {
        match self {
            Self::Long => Direction::Up,
            Self::Short => Direction::Down,
        }
    }
}

/// A validated directional prediction for one symbol at one tick.
///
/// `expected_move`, `best_case` and `worst_case` are price-change
/// percentages (e.g. `4.0` means +4%).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub symbol: String,
    pub direction: Direction,
    /// Win probability in `[0.5, 1.0]`.
    pub probability: f64,
    pub expected_move: f64,
    pub best_case: f64,
    pub worst_case: f64,
    pub timeframe: Timeframe,
    pub confidence: Confidence,
    pub risk_level: RiskLevel,
    pub reasoning: String,
    #[serde(default)]
    pub key_factors: Vec<String>,
}

/// Risk parameters derived deterministically for an open decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameters {
    pub leverage: u32,
    pub position_size_usd: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_reward: f64,
    pub liquidation_price: f64,
    pub risk_pct: f64,
    pub reward_pct: f64,
    pub reasoning: String,
}

/// Action the orchestrator asks the trader to take for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
    Wait,
}

impl DecisionAction {
    /// Execution order within a tick: closes run before opens so a rotation
    /// cannot oversubscribe margin.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::CloseLong | Self::CloseShort => 1,
            Self::OpenLong | Self::OpenShort => 2,
            Self::Hold | Self::Wait => 3,
        }
    }

    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort)
    }

    #[must_use]
    pub const fn is_close(self) -> bool {
        matches!(self, Self::CloseLong | Self::CloseShort)
    }

    #[must_use]
    pub const fn side(self) -> Option<PositionSide> {
        match self {
            Self::OpenLong | Self::CloseLong => Some(PositionSide::Long),
            Self::OpenShort | Self::CloseShort => Some(PositionSide::Short),
            Self::Hold | Self::Wait => None,
        }
    }
}

/// One element of the per-tick decision list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub action: DecisionAction,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub position_size_usd: f64,
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profit: f64,
    /// True when the open should go out as a limit order.
    #[serde(default)]
    pub is_limit_order: bool,
    #[serde(default)]
    pub limit_price: f64,
    #[serde(default)]
    pub current_price: f64,
    /// Rounded probability, 0-100.
    #[serde(default)]
    pub confidence: u8,
    #[serde(default)]
    pub risk_usd: f64,
    pub reasoning: String,
}

impl Decision {
    /// A non-actionable placeholder decision.
    #[must_use]
    pub fn wait(symbol: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            action: DecisionAction::Wait,
            leverage: 0,
            position_size_usd: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            is_limit_order: false,
            limit_price: 0.0,
            current_price: 0.0,
            confidence: 0,
            risk_usd: 0.0,
            reasoning: reasoning.into(),
        }
    }

    #[must_use]
    pub fn hold(symbol: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Hold,
            ..Self::wait(symbol, reasoning)
        }
    }
}

/// A live position as reported by the exchange adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
    /// PnL relative to margin, leveraged, in percent.
    pub unrealized_pnl_pct: f64,
    pub liquidation_price: Decimal,
    pub margin_used: Decimal,
    pub open_time: Option<DateTime<Utc>>,
}

impl PositionInfo {
    #[must_use]
    pub fn margin_used_f64(&self) -> f64 {
        self.margin_used.to_f64().unwrap_or(0.0)
    }

    #[must_use]
    pub fn held_minutes(&self, now: DateTime<Utc>) -> Option<i64> {
        self.open_time.map(|t| (now - t).num_minutes())
    }
}

/// Account snapshot used by the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    pub total_equity: f64,
    pub available_balance: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub margin_used: f64,
    pub margin_used_pct: f64,
    pub position_count: usize,
}

/// A symbol from the candidate-universe provider, with its sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSymbol {
    pub symbol: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Macro market summary produced by the intelligence stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketIntelligence {
    pub market_phase: String,
    #[serde(default)]
    pub key_risks: Vec<String>,
    #[serde(default)]
    pub key_opportunities: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

impl MarketIntelligence {
    /// Fallback value when the intelligence call fails; the tick continues
    /// with whatever data it has.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            market_phase: "unknown".to_string(),
            key_risks: vec!["market intelligence unavailable".to_string()],
            key_opportunities: Vec::new(),
            summary: String::new(),
        }
    }
}

/// Normalizes a ticker to an uppercase USDT-quoted symbol.
#[must_use]
pub fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    if upper.ends_with("USDT") {
        upper
    } else {
        format!("{upper}USDT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_priority_orders_closes_first() {
        assert!(DecisionAction::CloseLong.priority() < DecisionAction::OpenShort.priority());
        assert!(DecisionAction::OpenLong.priority() < DecisionAction::Hold.priority());
        assert!(DecisionAction::OpenLong.priority() < DecisionAction::Wait.priority());
    }

    #[test]
    fn direction_serde_round_trip() {
        let json = serde_json::to_string(&Direction::Up).unwrap();
        assert_eq!(json, "\"up\"");
        let back: Direction = serde_json::from_str("\"neutral\"").unwrap();
        assert_eq!(back, Direction::Neutral);
    }

    #[test]
    fn timeframe_hours() {
        assert_eq!(Timeframe::H1.hours(), 1);
        assert_eq!(Timeframe::H4.hours(), 4);
        assert_eq!(Timeframe::H24.hours(), 24);
        let tf: Timeframe = serde_json::from_str("\"4h\"").unwrap();
        assert_eq!(tf, Timeframe::H4);
    }

    #[test]
    fn normalize_symbol_appends_quote() {
        assert_eq!(normalize_symbol("btc"), "BTCUSDT");
        assert_eq!(normalize_symbol("ETHUSDT"), "ETHUSDT");
        assert_eq!(normalize_symbol(" sol "), "SOLUSDT");
    }

    #[test]
    fn side_agreeing_direction() {
        assert_eq!(PositionSide::Long.agreeing_direction(), Direction::Up);
        assert_eq!(PositionSide::Short.agreeing_direction(), Direction::Down);
    }
}
