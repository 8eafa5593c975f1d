//! Trade-memory data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use perppilot_core::types::{Direction, PositionSide};

/// Number of trades kept in working memory.
pub const WORKING_MEMORY_SIZE: usize = 20;
/// Trades required before the memory is considered mature.
pub const MATURE_TRADE_COUNT: u64 = 100;

/// Outcome of a completed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeResult {
    Win,
    Loss,
    BreakEven,
}

impl TradeResult {
    /// Classifies a realized return; moves within ±0.1% are break-even.
    #[must_use]
    pub fn from_return_pct(return_pct: f64) -> Self {
        if return_pct > 0.1 {
            Self::Win
        } else if return_pct < -0.1 {
            Self::Loss
        } else {
            Self::BreakEven
        }
    }
}

/// What the trade entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Open,
    Close,
}

/// One appended trade record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEntry {
    #[serde(default)]
    pub trade_id: u64,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,

    /// Coarse market phase at decision time.
    #[serde(default)]
    pub market_regime: String,

    pub action: TradeAction,
    pub symbol: String,
    pub side: PositionSide,
    /// Signal keywords extracted from the decision reasoning.
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub reasoning: String,

    #[serde(default)]
    pub predicted_direction: Option<Direction>,
    #[serde(default)]
    pub predicted_prob: f64,
    #[serde(default)]
    pub predicted_move: f64,

    #[serde(default)]
    pub entry_price: f64,
    #[serde(default)]
    pub exit_price: f64,
    /// Margin share of equity at entry, percent.
    #[serde(default)]
    pub position_pct: f64,
    #[serde(default)]
    pub leverage: u32,

    #[serde(default)]
    pub is_limit_order: bool,
    #[serde(default)]
    pub limit_price: f64,
    #[serde(default)]
    pub current_price: f64,

    #[serde(default)]
    pub hold_minutes: i64,
    #[serde(default)]
    pub return_pct: f64,
    /// None while the trade is still open.
    #[serde(default)]
    pub result: Option<TradeResult>,
}

/// Per-signal win/loss statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalStat {
    pub signal_name: String,
    pub total_count: usize,
    pub win_count: usize,
    pub loss_count: usize,
    pub win_rate: f64,
    pub avg_return: f64,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

/// Slowly-updated distillation of the working memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningSummary {
    pub updated_at: Option<DateTime<Utc>>,
    pub signal_stats: BTreeMap<String, SignalStat>,
    pub failure_patterns: Vec<String>,
    pub success_patterns: Vec<String>,
    /// regime -> win rate.
    pub market_preferences: BTreeMap<String, f64>,
}

/// Lifecycle stage of the memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Learning,
    Mature,
}

/// The serialized memory file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeMemory {
    pub version: String,
    pub trader_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_trades: u64,
    pub status: MemoryStatus,
    pub recent_trades: Vec<TradeEntry>,
    pub hard_constraints: Vec<String>,
    #[serde(default)]
    pub learning_summary: Option<LearningSummary>,
}

impl TradeMemory {
    /// Fresh memory with only the hard risk constraints seeded.
    #[must_use]
    pub fn new(trader_id: &str) -> Self {
        let now = Utc::now();
        Self {
            version: "1.0".to_string(),
            trader_id: trader_id.to_string(),
            created_at: now,
            updated_at: now,
            total_trades: 0,
            status: MemoryStatus::Learning,
            recent_trades: Vec::with_capacity(WORKING_MEMORY_SIZE),
            hard_constraints: vec![
                "max loss per trade bounded by the stop order".to_string(),
                "cooldown after closing a symbol before reopening it".to_string(),
                "minimum hold time before a direction-flip close".to_string(),
            ],
            learning_summary: None,
        }
    }

    /// Completed trades currently inside the working memory.
    #[must_use]
    pub fn completed_trades(&self) -> impl Iterator<Item = &TradeEntry> {
        self.recent_trades.iter().filter(|t| t.result.is_some())
    }
}
