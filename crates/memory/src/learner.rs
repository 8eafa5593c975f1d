//! Pattern mining over completed trades.
//!
//! Runs after every appended trade once at least ten completed trades exist.
//! Result keywords (stop-loss, liquidation, ...) are blacklisted so exit
//! mechanics are never mistaken for entry signals.

use std::collections::BTreeMap;

use perppilot_core::types::PositionSide;

use crate::types::{LearningSummary, SignalStat, TradeEntry, TradeMemory, TradeResult};

/// Completed trades needed before any mining runs.
pub const MIN_COMPLETED_FOR_LEARNING: usize = 10;

/// Signal failure pattern: `total >= 10 && win rate < 0.35`.
const SIGNAL_FAIL_MIN_TOTAL: usize = 10;
const SIGNAL_FAIL_WIN_RATE: f64 = 0.35;

/// Signal success pattern: `total >= 20 && win rate > 0.65`; a near-perfect
/// rate needs 30 samples so a small lucky streak is not promoted.
const SIGNAL_SUCCESS_MIN_TOTAL: usize = 20;
const SIGNAL_SUCCESS_WIN_RATE: f64 = 0.65;
const SIGNAL_PERFECT_WIN_RATE: f64 = 0.95;
const SIGNAL_PERFECT_MIN_TOTAL: usize = 30;

/// Direction bias: `total >= 15`, failure < 0.30 / success > 0.65.
const DIRECTION_MIN_TOTAL: usize = 15;
const DIRECTION_FAIL_WIN_RATE: f64 = 0.30;
const DIRECTION_SUCCESS_WIN_RATE: f64 = 0.65;

/// High-confidence overconfidence: `total >= 15 && loss rate > 0.50` among
/// predictions stated above 70%.
const OVERCONFIDENCE_MIN_TOTAL: usize = 15;
const OVERCONFIDENCE_LOSS_RATE: f64 = 0.50;
const OVERCONFIDENCE_PROB: f64 = 0.70;

/// Reasoning-keyword success: `total >= 15 && win rate > 0.70`.
const KEYWORD_MIN_TOTAL: usize = 15;
const KEYWORD_SUCCESS_WIN_RATE: f64 = 0.70;

/// Exit-mechanics words that must never count as signals.
const RESULT_KEYWORD_BLACKLIST: &[&str] =
    &["stop-loss", "liquidation", "take-profit", "break-even"];

/// Indicator vocabulary mined from reasoning text.
const REASONING_KEYWORDS: &[&str] = &[
    "macd", "rsi", "ema", "breakout", "divergence", "support", "resistance", "trend",
    "oversold", "overbought", "pullback", "volume",
];

/// Rebuilds the learning summary from the working memory.
///
/// Returns `None` when fewer than [`MIN_COMPLETED_FOR_LEARNING`] completed
/// trades exist.
#[must_use]
pub fn build_summary(memory: &TradeMemory) -> Option<LearningSummary> {
    let completed: Vec<&TradeEntry> = memory.completed_trades().collect();
    if completed.len() < MIN_COMPLETED_FOR_LEARNING {
        return None;
    }

    let mut summary = LearningSummary {
        updated_at: Some(chrono::Utc::now()),
        signal_stats: signal_stats(&completed),
        failure_patterns: Vec::new(),
        success_patterns: Vec::new(),
        market_preferences: market_preferences(&completed),
    };

    let stats = summary.signal_stats.clone();
    mine_signal_patterns(&stats, &mut summary);
    mine_direction_bias(&completed, &mut summary);
    mine_overconfidence(&completed, &mut summary);
    mine_reasoning_keywords(&completed, &mut summary);

    Some(summary)
}

fn is_blacklisted(signal: &str) -> bool {
    let lower = signal.to_lowercase();
    RESULT_KEYWORD_BLACKLIST.iter().any(|kw| lower.contains(kw))
}

fn signal_stats(completed: &[&TradeEntry]) -> BTreeMap<String, SignalStat> {
    let mut stats: BTreeMap<String, SignalStat> = BTreeMap::new();

    for trade in completed {
        for signal in &trade.signals {
            if is_blacklisted(signal) {
                continue;
            }
            let stat = stats.entry(signal.clone()).or_insert_with(|| SignalStat {
                signal_name: signal.clone(),
                ..SignalStat::default()
            });
            stat.total_count += 1;
            stat.last_used = Some(trade.timestamp);
            match trade.result {
                Some(TradeResult::Win) => stat.win_count += 1,
                Some(TradeResult::Loss) => stat.loss_count += 1,
                _ => {}
            }
            stat.avg_return += trade.return_pct;
        }
    }

    for stat in stats.values_mut() {
        if stat.total_count > 0 {
            stat.win_rate = stat.win_count as f64 / stat.total_count as f64;
            stat.avg_return /= stat.total_count as f64;
        }
    }

    stats
}

fn mine_signal_patterns(stats: &BTreeMap<String, SignalStat>, summary: &mut LearningSummary) {
    for stat in stats.values() {
        if stat.total_count >= SIGNAL_FAIL_MIN_TOTAL && stat.win_rate < SIGNAL_FAIL_WIN_RATE {
            summary.failure_patterns.push(format!(
                "signal \"{}\" wins only {:.0}% ({} wins / {} losses); reduce its weight",
                stat.signal_name,
                stat.win_rate * 100.0,
                stat.win_count,
                stat.loss_count
            ));
        }

        let success_min = if stat.win_rate > SIGNAL_PERFECT_WIN_RATE {
            SIGNAL_PERFECT_MIN_TOTAL
        } else {
            SIGNAL_SUCCESS_MIN_TOTAL
        };
        if stat.total_count >= success_min && stat.win_rate > SIGNAL_SUCCESS_WIN_RATE {
            summary.success_patterns.push(format!(
                "signal \"{}\" wins {:.0}% ({} wins / {} losses); favor it",
                stat.signal_name,
                stat.win_rate * 100.0,
                stat.win_count,
                stat.loss_count
            ));
        }
    }
}

fn mine_direction_bias(completed: &[&TradeEntry], summary: &mut LearningSummary) {
    for side in [PositionSide::Long, PositionSide::Short] {
        let trades: Vec<&&TradeEntry> = completed.iter().filter(|t| t.side == side).collect();
        if trades.len() < DIRECTION_MIN_TOTAL {
            continue;
        }
        let wins = trades
            .iter()
            .filter(|t| t.result == Some(TradeResult::Win))
            .count();
        let win_rate = wins as f64 / trades.len() as f64;

        if win_rate < DIRECTION_FAIL_WIN_RATE {
            summary.failure_patterns.push(format!(
                "{} trades win only {:.0}% ({}/{}); the current market punishes that side",
                side.as_str(),
                win_rate * 100.0,
                wins,
                trades.len()
            ));
        } else if win_rate > DIRECTION_SUCCESS_WIN_RATE {
            summary.success_patterns.push(format!(
                "{} trades win {:.0}% ({}/{}); the current market rewards that side",
                side.as_str(),
                win_rate * 100.0,
                wins,
                trades.len()
            ));
        }
    }
}

fn mine_overconfidence(completed: &[&TradeEntry], summary: &mut LearningSummary) {
    let high_conf: Vec<&&TradeEntry> = completed
        .iter()
        .filter(|t| t.predicted_prob > OVERCONFIDENCE_PROB)
        .collect();
    if high_conf.len() < OVERCONFIDENCE_MIN_TOTAL {
        return;
    }
    let losses = high_conf
        .iter()
        .filter(|t| t.result == Some(TradeResult::Loss))
        .count();
    let loss_rate = losses as f64 / high_conf.len() as f64;
    if loss_rate > OVERCONFIDENCE_LOSS_RATE {
        summary.failure_patterns.push(format!(
            "high-probability calls (>70%) lose {:.0}% of the time; stated confidence is inflated",
            loss_rate * 100.0
        ));
    }
}

fn mine_reasoning_keywords(completed: &[&TradeEntry], summary: &mut LearningSummary) {
    let mut wins: BTreeMap<&str, usize> = BTreeMap::new();
    let mut totals: BTreeMap<&str, usize> = BTreeMap::new();

    for trade in completed {
        if trade.reasoning.is_empty() {
            continue;
        }
        let lower = trade.reasoning.to_lowercase();
        for kw in REASONING_KEYWORDS {
            if lower.contains(kw) {
                *totals.entry(kw).or_default() += 1;
                if trade.result == Some(TradeResult::Win) {
                    *wins.entry(kw).or_default() += 1;
                }
            }
        }
    }

    for (kw, total) in totals {
        if total < KEYWORD_MIN_TOTAL {
            continue;
        }
        let win_rate = *wins.get(kw).unwrap_or(&0) as f64 / total as f64;
        if win_rate > KEYWORD_SUCCESS_WIN_RATE {
            summary.success_patterns.push(format!(
                "reasoning mentioning \"{kw}\" wins {:.0}% of the time; trust those setups",
                win_rate * 100.0
            ));
        }
    }
}

fn market_preferences(completed: &[&TradeEntry]) -> BTreeMap<String, f64> {
    let mut totals: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for trade in completed {
        if trade.market_regime.is_empty() {
            continue;
        }
        let entry = totals.entry(trade.market_regime.clone()).or_default();
        entry.1 += 1;
        if trade.result == Some(TradeResult::Win) {
            entry.0 += 1;
        }
    }

    totals
        .into_iter()
        .map(|(regime, (wins, total))| (regime, wins as f64 / total as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeAction;
    use chrono::Utc;

    fn trade(
        side: PositionSide,
        signals: &[&str],
        result: TradeResult,
        predicted_prob: f64,
        regime: &str,
        reasoning: &str,
    ) -> TradeEntry {
        TradeEntry {
            trade_id: 0,
            cycle: 1,
            timestamp: Utc::now(),
            market_regime: regime.to_string(),
            action: TradeAction::Close,
            symbol: "BTCUSDT".to_string(),
            side,
            signals: signals.iter().map(|s| (*s).to_string()).collect(),
            reasoning: reasoning.to_string(),
            predicted_direction: None,
            predicted_prob,
            predicted_move: 0.0,
            entry_price: 100.0,
            exit_price: 101.0,
            position_pct: 10.0,
            leverage: 5,
            is_limit_order: false,
            limit_price: 0.0,
            current_price: 0.0,
            hold_minutes: 60,
            return_pct: match result {
                TradeResult::Win => 2.0,
                TradeResult::Loss => -2.0,
                TradeResult::BreakEven => 0.0,
            },
            result: Some(result),
        }
    }

    fn memory_with(trades: Vec<TradeEntry>) -> TradeMemory {
        let mut memory = TradeMemory::new("test");
        memory.total_trades = trades.len() as u64;
        memory.recent_trades = trades;
        memory
    }

    #[test]
    fn no_summary_below_ten_completed_trades() {
        let trades: Vec<TradeEntry> = (0..9)
            .map(|_| trade(PositionSide::Long, &["macd"], TradeResult::Win, 0.6, "range", ""))
            .collect();
        assert!(build_summary(&memory_with(trades)).is_none());
    }

    #[test]
    fn failing_signal_is_flagged_at_threshold() {
        // 10 trades carrying "chop": 3 wins = 30% < 35%.
        let mut trades = Vec::new();
        for i in 0..10 {
            let result = if i < 3 { TradeResult::Win } else { TradeResult::Loss };
            trades.push(trade(PositionSide::Long, &["chop"], result, 0.6, "range", ""));
        }
        let summary = build_summary(&memory_with(trades)).unwrap();
        assert!(summary.failure_patterns.iter().any(|p| p.contains("chop")));
    }

    #[test]
    fn perfect_win_rate_needs_thirty_samples() {
        // 20 straight wins is not enough to promote a 100% signal.
        let trades: Vec<TradeEntry> = (0..20)
            .map(|_| trade(PositionSide::Long, &["golden"], TradeResult::Win, 0.6, "range", ""))
            .collect();
        let summary = build_summary(&memory_with(trades)).unwrap();
        assert!(!summary.success_patterns.iter().any(|p| p.contains("golden")));
    }

    #[test]
    fn strong_signal_promoted_at_twenty_samples() {
        // 20 trades, 14 wins = 70% (> 65% and <= 95%).
        let mut trades = Vec::new();
        for i in 0..20 {
            let result = if i < 14 { TradeResult::Win } else { TradeResult::Loss };
            trades.push(trade(PositionSide::Long, &["breakout-confirm"], result, 0.6, "range", ""));
        }
        let summary = build_summary(&memory_with(trades)).unwrap();
        assert!(summary
            .success_patterns
            .iter()
            .any(|p| p.contains("breakout-confirm")));
    }

    #[test]
    fn blacklisted_result_words_are_not_signals() {
        let mut trades = Vec::new();
        for _ in 0..12 {
            trades.push(trade(
                PositionSide::Long,
                &["stop-loss auto-triggered"],
                TradeResult::Loss,
                0.6,
                "range",
                "",
            ));
        }
        let summary = build_summary(&memory_with(trades)).unwrap();
        assert!(summary.signal_stats.is_empty());
        assert!(summary.failure_patterns.is_empty());
    }

    #[test]
    fn short_side_bias_flagged() {
        // 15 shorts with 3 wins = 20% < 30%.
        let mut trades = Vec::new();
        for i in 0..15 {
            let result = if i < 3 { TradeResult::Win } else { TradeResult::Loss };
            trades.push(trade(PositionSide::Short, &[], result, 0.6, "range", ""));
        }
        let summary = build_summary(&memory_with(trades)).unwrap();
        assert!(summary.failure_patterns.iter().any(|p| p.contains("short")));
    }

    #[test]
    fn overconfidence_detected() {
        // 16 high-probability trades, 10 losses.
        let mut trades = Vec::new();
        for i in 0..16 {
            let result = if i < 10 { TradeResult::Loss } else { TradeResult::Win };
            trades.push(trade(PositionSide::Long, &[], result, 0.8, "range", ""));
        }
        let summary = build_summary(&memory_with(trades)).unwrap();
        assert!(summary
            .failure_patterns
            .iter()
            .any(|p| p.contains("confidence is inflated")));
    }

    #[test]
    fn reasoning_keyword_success_mined() {
        // 15 trades mentioning macd, 12 wins = 80% > 70%.
        let mut trades = Vec::new();
        for i in 0..15 {
            let result = if i < 12 { TradeResult::Win } else { TradeResult::Loss };
            trades.push(trade(
                PositionSide::Long,
                &[],
                result,
                0.6,
                "range",
                "MACD golden cross above signal",
            ));
        }
        let summary = build_summary(&memory_with(trades)).unwrap();
        assert!(summary.success_patterns.iter().any(|p| p.contains("macd")));
    }

    #[test]
    fn market_preferences_by_regime() {
        let mut trades = Vec::new();
        for i in 0..10 {
            let result = if i < 7 { TradeResult::Win } else { TradeResult::Loss };
            trades.push(trade(PositionSide::Long, &[], result, 0.6, "trending_up", ""));
        }
        let summary = build_summary(&memory_with(trades)).unwrap();
        let rate = summary.market_preferences.get("trending_up").unwrap();
        assert!((rate - 0.7).abs() < 1e-9);
    }
}
