//! The per-tick decision pipeline.
//!
//! Stage 1 collects market intelligence, stage 2 re-evaluates held
//! positions, stage 3 screens new opportunities, stage 4 sizes and gates
//! them. Every emitted list is ordered closes before opens so rotations
//! cannot oversubscribe margin.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::entry_timing::{self, EntryTiming};
use crate::intelligence::IntelligenceAgent;
use crate::llm::LlmClient;
use crate::portfolio::PortfolioRiskGate;
use crate::prediction::{PredictionAgent, PredictionContext};
use crate::risk::{stop_is_safe, RiskEngine};
use crate::AgentError;
use perppilot_core::config::GatePolicy;
use perppilot_core::constants::{
    required_probability_for_drawdown, MIN_RISK_REWARD, RR_FLOAT_TOLERANCE,
};
use perppilot_core::regime::Regime;
use perppilot_core::types::{
    AccountInfo, CandidateSymbol, Confidence, Decision, DecisionAction, Direction, PositionInfo,
    PositionSide, Prediction, RiskParameters,
};
use perppilot_market_data::MarketSnapshot;
use perppilot_tracker::PredictionTracker;

/// Direction-flip close thresholds (minutes held, required probability).
const FLIP_MIN_HOLD_MINUTES: i64 = 15;
const FLIP_EARLY_PROBABILITY: f64 = 0.80;
const FLIP_SETTLED_HOLD_MINUTES: i64 = 30;
const FLIP_SETTLED_PROBABILITY: f64 = 0.65;
/// Emergency stop on margin PnL.
const HARD_STOP_PNL_PCT: f64 = -20.0;
/// Profit-take when the model has gone neutral.
const PROFIT_TAKE_PNL_PCT: f64 = 20.0;
/// Stale-position close: held longer than this with under 5% to show.
const STALE_HOLD_HOURS: i64 = 24;
const STALE_MAX_PNL_PCT: f64 = 5.0;
/// Quality score floor for a tradable prediction.
const QUALITY_PASS_SCORE: u32 = 60;
/// Retries for one symbol's prediction.
const PREDICT_ATTEMPTS: u32 = 3;

/// Per-tick input assembled by the auto-trader.
pub struct TickContext {
    pub account: AccountInfo,
    pub positions: Vec<PositionInfo>,
    pub candidates: Vec<CandidateSymbol>,
    pub snapshots: HashMap<String, MarketSnapshot>,
    pub memory_prompt: String,
    pub sharpe_ratio: Option<f64>,
}

/// The tick's output: the reasoning trace plus the ordered decision list.
pub struct FullDecision {
    pub cot_trace: String,
    pub decisions: Vec<Decision>,
}

/// Policy knobs resolved from configuration.
pub struct OrchestratorConfig {
    pub gate_policy: GatePolicy,
    pub max_positions: usize,
    pub use_limit_orders: bool,
}

pub struct DecisionOrchestrator {
    intelligence: IntelligenceAgent,
    prediction: PredictionAgent,
    risk: RiskEngine,
    tracker: Arc<PredictionTracker>,
    config: OrchestratorConfig,
}

struct GateSettings {
    min_probability: f64,
    allow_medium_confidence: bool,
    halted: bool,
}

impl DecisionOrchestrator {
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tracker: Arc<PredictionTracker>,
        btc_eth_leverage: u32,
        altcoin_leverage: u32,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            intelligence: IntelligenceAgent::new(Arc::clone(&llm)),
            prediction: PredictionAgent::new(llm),
            risk: RiskEngine::new(btc_eth_leverage, altcoin_leverage),
            tracker,
            config,
        }
    }

    /// Runs the full pipeline for one tick.
    pub async fn decide(&self, ctx: &TickContext) -> Result<FullDecision, AgentError> {
        let mut trace = String::new();
        let mut decisions: Vec<Decision> = Vec::new();
        let now = Utc::now();

        trace.push_str("=== prediction-driven decision pipeline ===\n\n");
        if !ctx.memory_prompt.is_empty() {
            trace.push_str(&ctx.memory_prompt);
            trace.push('\n');
        }

        let gate = self.gate_settings(ctx, &mut trace);

        // Stage 1: market intelligence from the reference symbol.
        let btc = ctx
            .snapshots
            .get("BTCUSDT")
            .ok_or_else(|| AgentError::MissingMarketData("BTCUSDT".to_string()))?;
        let regime = Regime::classify(btc.price, btc.ema50, btc.ema200, btc.atr_pct());

        let candidate_symbols: Vec<String> =
            ctx.candidates.iter().map(|c| c.symbol.clone()).collect();
        let intelligence =
            self.intelligence.collect(btc, &candidate_symbols, &ctx.snapshots).await;
        let _ = writeln!(
            trace,
            "## stage 1: intelligence\nphase: {} | regime: {}\n{}\n",
            intelligence.market_phase,
            regime.as_str(),
            intelligence.summary
        );

        // Stage 2: held positions.
        trace.push_str("## stage 2: held positions\n");
        if ctx.positions.is_empty() {
            trace.push_str("none\n\n");
        }
        for position in &ctx.positions {
            let Some(snapshot) = ctx.snapshots.get(&position.symbol) else {
                warn!(symbol = %position.symbol, "held position without market data, skipping");
                continue;
            };

            let prediction = match self
                .predict_symbol(&intelligence, snapshot, ctx)
                .await
            {
                Ok(mut prediction) => {
                    // The model sometimes answers for the reference symbol.
                    prediction.symbol = position.symbol.clone();
                    prediction
                }
                Err(err) => {
                    warn!(symbol = %position.symbol, error = %err, "position prediction failed");
                    let _ = writeln!(trace, "{}: prediction failed ({err})\n", position.symbol);
                    continue;
                }
            };

            let _ = writeln!(
                trace,
                "{} {}: predicted {} at {:.0}% ({})",
                position.symbol,
                position.side.as_str(),
                prediction.direction.as_str(),
                prediction.probability * 100.0,
                prediction.reasoning
            );

            match should_close_position(position, &prediction, now) {
                Some(reason) => {
                    let action = match position.side {
                        PositionSide::Long => DecisionAction::CloseLong,
                        PositionSide::Short => DecisionAction::CloseShort,
                    };
                    let _ = writeln!(trace, "  -> close: {reason}\n");
                    decisions.push(Decision {
                        symbol: position.symbol.clone(),
                        action,
                        reasoning: reason,
                        ..Decision::wait(position.symbol.clone(), String::new())
                    });
                }
                None => {
                    let _ = writeln!(trace, "  -> hold\n");
                    decisions.push(Decision::hold(
                        position.symbol.clone(),
                        format!(
                            "prediction {} {:.0}% supports holding",
                            prediction.direction.as_str(),
                            prediction.probability * 100.0
                        ),
                    ));
                }
            }
        }

        // Stage 3: new opportunities.
        trace.push_str("## stage 3: new opportunities\n");
        let available_slots = self
            .config
            .max_positions
            .saturating_sub(ctx.positions.len());

        let mut valid: Vec<Prediction> = Vec::new();
        if gate.halted {
            trace.push_str("opens halted by the probability floor policy\n\n");
        } else if available_slots == 0 {
            trace.push_str("position slots full\n\n");
        } else {
            let held: std::collections::HashSet<&str> =
                ctx.positions.iter().map(|p| p.symbol.as_str()).collect();

            for candidate in &ctx.candidates {
                if held.contains(candidate.symbol.as_str()) {
                    continue;
                }
                let Some(snapshot) = ctx.snapshots.get(&candidate.symbol) else {
                    continue;
                };

                let prediction = match self
                    .predict_symbol(&intelligence, snapshot, ctx)
                    .await
                {
                    Ok(mut prediction) => {
                        prediction.symbol = candidate.symbol.clone();
                        prediction
                    }
                    Err(err) => {
                        warn!(symbol = %candidate.symbol, error = %err, "prediction failed");
                        continue;
                    }
                };

                let _ = writeln!(
                    trace,
                    "{}: {} {:.0}% move {:+.1}% [{} / {}]",
                    prediction.symbol,
                    prediction.direction.as_str(),
                    prediction.probability * 100.0,
                    prediction.expected_move,
                    prediction.confidence.as_str(),
                    prediction.timeframe.as_str(),
                );

                if prediction.direction == Direction::Neutral {
                    trace.push_str("  x neutral\n");
                    continue;
                }

                let (quality_ok, score, quality_reason) = quality_score(&prediction);
                if !quality_ok {
                    let _ = writeln!(trace, "  x quality {score}/100: {quality_reason}");
                    self.record_rejection(&prediction, snapshot.price, &quality_reason);
                    continue;
                }

                if prediction.probability < gate.min_probability {
                    let reason = format!(
                        "probability {:.0}% below the {:.0}% floor",
                        prediction.probability * 100.0,
                        gate.min_probability * 100.0
                    );
                    let _ = writeln!(trace, "  x {reason}");
                    self.record_rejection(&prediction, snapshot.price, &reason);
                    continue;
                }

                if !confidence_acceptable(&prediction, &gate) {
                    let reason = format!(
                        "confidence {} insufficient at {:.0}%",
                        prediction.confidence.as_str(),
                        prediction.probability * 100.0
                    );
                    let _ = writeln!(trace, "  x {reason}");
                    self.record_rejection(&prediction, snapshot.price, &reason);
                    continue;
                }

                let _ = writeln!(trace, "  + candidate (quality {score}/100)");
                valid.push(prediction);
            }
            trace.push('\n');
        }

        // Stage 4: sizing and gating.
        if !valid.is_empty() {
            trace.push_str("## stage 4: sizing and gates\n");
            let mut opened = 0usize;

            for prediction in &valid {
                if opened >= available_slots {
                    trace.push_str("slots exhausted\n");
                    break;
                }
                let snapshot = &ctx.snapshots[&prediction.symbol];

                let params = match self.risk.position_from_prediction(
                    prediction,
                    snapshot,
                    regime,
                    ctx.account.total_equity,
                    ctx.account.available_balance,
                ) {
                    Ok(params) => params,
                    Err(err) => {
                        let _ = writeln!(trace, "{}: x sizing: {err}\n", prediction.symbol);
                        self.record_rejection(prediction, snapshot.price, &err.to_string());
                        continue;
                    }
                };

                if let Err(err) = revalidate_parameters(prediction, snapshot, &params) {
                    let _ = writeln!(trace, "{}: x revalidation: {err}\n", prediction.symbol);
                    self.record_rejection(prediction, snapshot.price, &err.to_string());
                    continue;
                }

                let timing =
                    entry_timing::decide(prediction.direction, prediction.timeframe, snapshot);
                let (is_limit_order, limit_price) = match &timing {
                    EntryTiming::Reject { reason } => {
                        let _ = writeln!(trace, "{}: x entry gate: {reason}\n", prediction.symbol);
                        self.record_rejection(prediction, snapshot.price, reason);
                        continue;
                    }
                    EntryTiming::WaitPullback { limit_price, reason, .. } => {
                        let _ = writeln!(trace, "{}: limit entry ({reason})", prediction.symbol);
                        (true, *limit_price)
                    }
                    EntryTiming::Immediate if self.config.use_limit_orders => {
                        let price = entry_timing::dynamic_limit_price(
                            prediction.direction,
                            snapshot,
                            prediction.confidence,
                        );
                        (true, price)
                    }
                    EntryTiming::Immediate => (false, 0.0),
                };

                let side = match prediction.direction {
                    Direction::Up => PositionSide::Long,
                    _ => PositionSide::Short,
                };
                let risk_usd = params.position_size_usd * params.risk_pct / 100.0;
                if let Err(err) = PortfolioRiskGate::validate_new_position(
                    &ctx.positions,
                    &prediction.symbol,
                    side,
                    risk_usd,
                    ctx.account.total_equity,
                ) {
                    let _ = writeln!(trace, "{}: x portfolio: {err}\n", prediction.symbol);
                    self.record_rejection(prediction, snapshot.price, &err.to_string());
                    continue;
                }

                if let Err(err) = self.tracker.record(prediction, snapshot.price) {
                    warn!(symbol = %prediction.symbol, error = %err, "failed to record prediction");
                }

                let action = match side {
                    PositionSide::Long => DecisionAction::OpenLong,
                    PositionSide::Short => DecisionAction::OpenShort,
                };
                let _ = writeln!(
                    trace,
                    "{}: open {} {:.0} USDT at {}x, stop {:.4}, tp {:.4}, rr {:.2}\n",
                    prediction.symbol,
                    side.as_str(),
                    params.position_size_usd,
                    params.leverage,
                    params.stop_loss,
                    params.take_profit,
                    params.risk_reward,
                );

                decisions.push(Decision {
                    symbol: prediction.symbol.clone(),
                    action,
                    leverage: params.leverage,
                    position_size_usd: params.position_size_usd,
                    stop_loss: params.stop_loss,
                    take_profit: params.take_profit,
                    is_limit_order,
                    limit_price,
                    current_price: snapshot.price,
                    confidence: (prediction.probability * 100.0).round().clamp(0.0, 100.0) as u8,
                    risk_usd,
                    reasoning: format!(
                        "prediction {} {:.0}% ({}); {}",
                        prediction.direction.as_str(),
                        prediction.probability * 100.0,
                        prediction.reasoning,
                        params.reasoning
                    ),
                });
                opened += 1;
            }
        }

        if decisions.is_empty() {
            decisions.push(Decision::wait(
                "BTCUSDT",
                format!(
                    "market phase {}: no position and no qualifying prediction",
                    intelligence.market_phase
                ),
            ));
        }

        decisions.sort_by_key(|d| d.action.priority());
        info!(decision_count = decisions.len(), "tick pipeline complete");

        Ok(FullDecision { cot_trace: trace, decisions })
    }

    async fn predict_symbol(
        &self,
        intelligence: &perppilot_core::types::MarketIntelligence,
        snapshot: &MarketSnapshot,
        ctx: &TickContext,
    ) -> Result<Prediction, AgentError> {
        let performance = self.tracker.performance(&snapshot.symbol);
        let feedback = self.tracker.recent_feedback(&snapshot.symbol, 5);

        let prediction_ctx = PredictionContext {
            intelligence,
            snapshot,
            account: &ctx.account,
            positions: &ctx.positions,
            performance: Some(&performance),
            sharpe_ratio: ctx.sharpe_ratio,
            recent_feedback: &feedback,
            memory_prompt: &ctx.memory_prompt,
        };

        self.prediction.predict_with_retry(&prediction_ctx, PREDICT_ATTEMPTS).await
    }

    fn record_rejection(&self, prediction: &Prediction, price: f64, reason: &str) {
        if let Err(err) = self.tracker.record_all(prediction, price, false, reason) {
            warn!(symbol = %prediction.symbol, error = %err, "failed to record rejection");
        }
    }

    /// Resolves the probability floor from the configured policy and the
    /// account drawdown ladder; the stricter of the two wins.
    fn gate_settings(&self, ctx: &TickContext, trace: &mut String) -> GateSettings {
        let (policy_floor, allow_medium) = match self.config.gate_policy {
            GatePolicy::Permissive => (0.65, true),
            GatePolicy::SharpeAdaptive => match ctx.sharpe_ratio {
                None => (0.70, false),
                Some(s) if s < -0.5 => (f64::INFINITY, false),
                Some(s) if s < -0.3 => (0.80, false),
                Some(s) if s < -0.1 => (0.75, false),
                Some(s) if s < 0.7 => (0.70, false),
                Some(_) => (0.65, true),
            },
        };

        let drawdown_floor = required_probability_for_drawdown(ctx.account.total_pnl_pct);
        let min_probability = policy_floor.max(drawdown_floor);
        let halted = min_probability > 1.0;

        let _ = writeln!(
            trace,
            "## gate\npolicy floor {:.2} | drawdown floor {:.2} (pnl {:+.2}%) -> {}\n",
            policy_floor,
            drawdown_floor,
            ctx.account.total_pnl_pct,
            if halted { "opens halted".to_string() } else { format!("{min_probability:.2}") },
        );

        GateSettings { min_probability, allow_medium_confidence: allow_medium, halted }
    }
}

/// First-match close rules for a held position, returning the close reason.
///
/// A position younger than 15 minutes is never closed by a direction flip;
/// between 15 and 30 minutes the flip needs 80% probability, beyond that
/// 65%. The hard stop, profit-take and staleness rules apply regardless of
/// the flip protection.
#[must_use]
pub fn should_close_position(
    position: &PositionInfo,
    prediction: &Prediction,
    now: DateTime<Utc>,
) -> Option<String> {
    let held_minutes = position.held_minutes(now);
    let flipped = prediction.direction != Direction::Neutral
        && prediction.direction == position.side.agreeing_direction().opposite();

    if flipped {
        // Unknown open times are seeded conservatively upstream; treat a
        // missing value as settled.
        let held = held_minutes.unwrap_or(FLIP_SETTLED_HOLD_MINUTES + 1);
        let threshold = if held < FLIP_MIN_HOLD_MINUTES {
            None
        } else if held < FLIP_SETTLED_HOLD_MINUTES {
            Some(FLIP_EARLY_PROBABILITY)
        } else {
            Some(FLIP_SETTLED_PROBABILITY)
        };
        if let Some(threshold) = threshold {
            let closes = if held < FLIP_SETTLED_HOLD_MINUTES {
                prediction.probability >= threshold
            } else {
                prediction.probability > threshold
            };
            if closes {
                return Some(format!(
                    "direction flip: predicted {} at {:.0}% after {held} min held",
                    prediction.direction.as_str(),
                    prediction.probability * 100.0
                ));
            }
        }
    }

    if position.unrealized_pnl_pct < HARD_STOP_PNL_PCT {
        return Some(format!(
            "emergency stop: {:.1}% beyond the {HARD_STOP_PNL_PCT:.0}% hard limit",
            position.unrealized_pnl_pct
        ));
    }

    if position.unrealized_pnl_pct > PROFIT_TAKE_PNL_PCT
        && prediction.direction == Direction::Neutral
    {
        return Some(format!(
            "profit take: {:+.1}% with a neutral outlook",
            position.unrealized_pnl_pct
        ));
    }

    if let Some(held) = held_minutes {
        if held > STALE_HOLD_HOURS * 60 && position.unrealized_pnl_pct < STALE_MAX_PNL_PCT {
            return Some(format!(
                "stale: {held} min held with only {:+.1}%",
                position.unrealized_pnl_pct
            ));
        }
    }

    None
}

/// Prediction quality score out of 100: expected-move size (40), directional
/// risk/reward (30) and confidence (30); 60 passes.
#[must_use]
pub fn quality_score(prediction: &Prediction) -> (bool, u32, String) {
    let mut score = 0u32;

    let abs_move = prediction.expected_move.abs();
    if abs_move >= 3.0 {
        score += 40;
    } else if abs_move >= 2.0 {
        score += 30;
    } else if abs_move >= 1.0 {
        score += 20;
    } else if abs_move >= 0.5 {
        score += 10;
    } else {
        return (false, score, format!("expected move {abs_move:.2}% too small to trade"));
    }

    let (profit, loss) = match prediction.direction {
        Direction::Up => (prediction.best_case.abs(), prediction.worst_case.abs()),
        Direction::Down => (prediction.worst_case.abs(), prediction.best_case.abs()),
        Direction::Neutral => (0.0, 0.0),
    };
    if loss > 0.01 {
        let rr = profit / loss;
        if rr >= 2.0 {
            score += 30;
        } else if rr >= 1.5 {
            score += 20;
        } else if rr >= 1.0 {
            score += 10;
        }
    }

    score += match prediction.confidence {
        Confidence::High => 25,
        Confidence::Medium => 15,
        Confidence::Low => 5,
    };

    if score >= QUALITY_PASS_SCORE {
        (true, score, format!("quality {score}/100"))
    } else {
        (false, score, format!("quality {score}/100 below {QUALITY_PASS_SCORE}"))
    }
}

fn confidence_acceptable(prediction: &Prediction, gate: &GateSettings) -> bool {
    match prediction.confidence {
        Confidence::High => true,
        Confidence::Medium => {
            gate.allow_medium_confidence
                || prediction.probability >= gate.min_probability + 0.03
        }
        Confidence::Low => prediction.probability >= gate.min_probability + 0.07,
    }
}

/// Orchestrator-level re-validation of risk parameters: stops on the right
/// side, R/R at the floor, stop outside the liquidation buffer. The risk
/// engine already enforced these; trusting one layer is not enough when the
/// numbers drive real orders.
fn revalidate_parameters(
    prediction: &Prediction,
    snapshot: &MarketSnapshot,
    params: &RiskParameters,
) -> Result<(), AgentError> {
    let price = snapshot.price;

    match prediction.direction {
        Direction::Up => {
            if params.stop_loss >= price || params.take_profit <= price {
                return Err(AgentError::Validation(
                    "long stop/tp on the wrong side of price".to_string(),
                ));
            }
        }
        Direction::Down => {
            if params.stop_loss <= price || params.take_profit >= price {
                return Err(AgentError::Validation(
                    "short stop/tp on the wrong side of price".to_string(),
                ));
            }
        }
        Direction::Neutral => {
            return Err(AgentError::Validation("neutral cannot be sized".to_string()));
        }
    }

    if params.risk_reward < MIN_RISK_REWARD * (1.0 - RR_FLOAT_TOLERANCE) {
        return Err(AgentError::Validation(format!(
            "risk/reward {:.2} below floor on revalidation",
            params.risk_reward
        )));
    }

    if !stop_is_safe(params.stop_loss, price, params.liquidation_price, prediction.direction) {
        return Err(AgentError::Validation(
            "stop inside the liquidation buffer on revalidation".to_string(),
        ));
    }

    if params.position_size_usd <= 0.0 || params.leverage == 0 {
        return Err(AgentError::Validation("degenerate size or leverage".to_string()));
    }

    Ok(())
}
