//! Deterministic risk sizing.
//!
//! Two entry paths: Kelly sizing from a validated prediction (path A), and
//! ATR-multiple selection where the model only picks discrete multiples and
//! every price, ratio and size is computed here (path B). Both end at the
//! same invariants: R/R at or above the floor, stop on the safe side of the
//! liquidation price, notional above the venue minimum.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::llm::{extract_json, LlmClient};
use crate::AgentError;
use perppilot_core::constants::{
    expected_multiples, AVAILABLE_BALANCE_CAP, CONFIDENCE_HIGH_MULTIPLIER,
    CONFIDENCE_LOW_MULTIPLIER, CONFIDENCE_MEDIUM_MULTIPLIER, LIQUIDATION_MARGIN_RATE,
    LIQUIDATION_SAFETY_RATIO, LOW_VOL_ATR_PCT, LOW_VOL_STOP_RANGE_PCT, LOW_VOL_TP_RANGE_PCT,
    MARGIN_USAGE_LIMIT, MAX_KELLY_FRACTION, MAX_STOP_MULTIPLE, MAX_TP_MULTIPLE, MIN_NOTIONAL_USDT,
    MIN_RISK_REWARD, MIN_STOP_MULTIPLE, MIN_TP_MULTIPLE, RISK_BUDGET_PER_TRADE,
    RR_FLOAT_TOLERANCE, RR_STRICT_TOLERANCE,
};
use perppilot_core::regime::Regime;
use perppilot_core::types::{Confidence, Direction, Prediction, RiskLevel, RiskParameters};
use perppilot_market_data::MarketSnapshot;

pub struct RiskEngine {
    btc_eth_leverage: u32,
    altcoin_leverage: u32,
}

impl RiskEngine {
    #[must_use]
    pub const fn new(btc_eth_leverage: u32, altcoin_leverage: u32) -> Self {
        Self { btc_eth_leverage, altcoin_leverage }
    }

    /// Base leverage for the symbol tier.
    #[must_use]
    pub fn base_leverage(&self, symbol: &str) -> u32 {
        if symbol == "BTCUSDT" || symbol == "ETHUSDT" {
            self.btc_eth_leverage
        } else {
            self.altcoin_leverage
        }
    }

    /// Leverage scaled by the prediction's risk tier with a volatility
    /// override; the more conservative coefficient wins.
    #[must_use]
    pub fn leverage_for(&self, symbol: &str, risk_level: RiskLevel, atr_pct: f64) -> u32 {
        let risk_coeff: f64 = match risk_level {
            RiskLevel::Low => 1.0,
            RiskLevel::Medium => 0.8,
            RiskLevel::High => 0.6,
        };
        let atr_coeff = if atr_pct < 2.0 {
            1.0
        } else if atr_pct < 4.0 {
            0.8
        } else {
            0.6
        };
        let coeff = risk_coeff.min(atr_coeff);

        let leverage = (f64::from(self.base_leverage(symbol)) * coeff) as u32;
        leverage.max(1)
    }

    /// Path A: position parameters from a validated prediction.
    ///
    /// `best_case`/`worst_case` drive payoff and the stop/TP levels; sizing
    /// is full Kelly scaled by confidence, clamped by the per-symbol cap and
    /// available balance.
    pub fn position_from_prediction(
        &self,
        prediction: &Prediction,
        snapshot: &MarketSnapshot,
        regime: Regime,
        total_equity: f64,
        available_balance: f64,
    ) -> Result<RiskParameters, AgentError> {
        let price = snapshot.price;
        if price <= 0.0 {
            return Err(AgentError::RiskInfeasible("no price".to_string()));
        }

        let (profit_pct, loss_pct) = match prediction.direction {
            Direction::Up => (prediction.best_case, prediction.worst_case.abs()),
            Direction::Down => {
                if prediction.best_case <= 1e-6 {
                    return Err(AgentError::RiskInfeasible(
                        "short payoff undefined: best_case must be a positive bounce".to_string(),
                    ));
                }
                (prediction.worst_case.abs(), prediction.best_case)
            }
            Direction::Neutral => {
                return Err(AgentError::RiskInfeasible("neutral prediction".to_string()));
            }
        };
        if loss_pct <= 1e-6 {
            return Err(AgentError::RiskInfeasible("zero loss bound".to_string()));
        }

        let payoff = profit_pct / loss_pct;
        let p = prediction.probability;
        let kelly = (p * payoff - (1.0 - p)) / payoff;
        if kelly <= 0.0 {
            return Err(AgentError::RiskInfeasible(format!(
                "negative Kelly edge ({kelly:.3})"
            )));
        }

        let fraction =
            (kelly * confidence_multiplier(prediction.confidence)).min(MAX_KELLY_FRACTION);

        // Stop and take-profit levels come straight from the predicted
        // bounds; signs were validated upstream.
        let (stop_loss, mut take_profit) = match prediction.direction {
            Direction::Up => (
                price * (1.0 + prediction.worst_case / 100.0),
                price * (1.0 + prediction.best_case / 100.0),
            ),
            _ => (
                price * (1.0 - prediction.worst_case / 100.0),
                price * (1.0 - prediction.best_case / 100.0),
            ),
        };

        let atr_pct = snapshot.atr_pct();
        let mut leverage = self.leverage_for(&prediction.symbol, prediction.risk_level, atr_pct);

        // Liquidation safety: reduce leverage by 30% once if the stop sits
        // inside the buffer, then give up.
        let liquidation_price = {
            let mut adjusted = false;
            loop {
                let liq = liquidation_price(price, prediction.direction, leverage);
                if stop_is_safe(stop_loss, price, liq, prediction.direction) {
                    break liq;
                }
                if adjusted {
                    return Err(AgentError::RiskInfeasible(format!(
                        "stop {stop_loss:.4} remains inside the liquidation buffer at {leverage}x"
                    )));
                }
                leverage = ((f64::from(leverage) * 0.7) as u32).max(1);
                adjusted = true;
            }
        };

        let mut risk_pct = (price - stop_loss).abs() / price * 100.0;
        let mut reward_pct = (take_profit - price).abs() / price * 100.0;

        validate_distances(price, stop_loss, take_profit, snapshot, atr_pct)?;

        let mut risk_reward = reward_pct / risk_pct;
        if risk_reward < MIN_RISK_REWARD * (1.0 - RR_FLOAT_TOLERANCE) {
            if regime.is_trending() {
                // Let profit run: stretch the target until the floor holds.
                reward_pct = risk_pct * MIN_RISK_REWARD;
                take_profit = match prediction.direction {
                    Direction::Up => price * (1.0 + reward_pct / 100.0),
                    _ => price * (1.0 - reward_pct / 100.0),
                };
                risk_reward = MIN_RISK_REWARD;
            } else {
                return Err(AgentError::RiskInfeasible(format!(
                    "risk/reward {risk_reward:.2} below {MIN_RISK_REWARD:.1} floor"
                )));
            }
        }

        let position_size = self.clamp_position_size(
            total_equity * fraction,
            total_equity,
            available_balance,
            leverage,
        )?;

        // Recompute the percentages from the final prices so the reported
        // numbers always agree with the orders sent out.
        risk_pct = (price - stop_loss).abs() / price * 100.0;
        reward_pct = (take_profit - price).abs() / price * 100.0;

        Ok(RiskParameters {
            leverage,
            position_size_usd: position_size,
            stop_loss,
            take_profit,
            risk_reward,
            liquidation_price,
            risk_pct,
            reward_pct,
            reasoning: format!(
                "kelly={kelly:.3} fraction={fraction:.3} payoff={payoff:.2} atr%={atr_pct:.2} \
leverage={leverage}x stop={stop_loss:.4} tp={take_profit:.4} rr={risk_reward:.2}"
            ),
        })
    }

    /// Path B: the model picked ATR multiples; verify them against the
    /// expectation table and derive everything else here.
    #[allow(clippy::too_many_arguments)]
    pub fn position_from_multiples(
        &self,
        symbol: &str,
        direction: Direction,
        confidence: Confidence,
        snapshot: &MarketSnapshot,
        regime: Regime,
        stop_multiple: f64,
        tp_multiple: f64,
        total_equity: f64,
        available_balance: f64,
    ) -> Result<RiskParameters, AgentError> {
        let price = snapshot.price;
        let atr = snapshot.atr14;
        if price <= 0.0 || atr <= 0.0 {
            return Err(AgentError::RiskInfeasible("no price/ATR".to_string()));
        }
        if direction == Direction::Neutral {
            return Err(AgentError::RiskInfeasible("neutral prediction".to_string()));
        }

        if !(MIN_STOP_MULTIPLE..=MAX_STOP_MULTIPLE).contains(&stop_multiple) {
            return Err(AgentError::Validation(format!(
                "stop multiple {stop_multiple:.1} outside [{MIN_STOP_MULTIPLE}, {MAX_STOP_MULTIPLE}]"
            )));
        }
        if !(MIN_TP_MULTIPLE..=MAX_TP_MULTIPLE).contains(&tp_multiple) {
            return Err(AgentError::Validation(format!(
                "tp multiple {tp_multiple:.1} outside [{MIN_TP_MULTIPLE}, {MAX_TP_MULTIPLE}]"
            )));
        }

        let atr_pct = snapshot.atr_pct();
        let expected = expected_multiples(atr_pct, regime.is_trending());
        if (stop_multiple - expected.stop).abs() > 0.5 {
            return Err(AgentError::Validation(format!(
                "stop multiple {stop_multiple:.1} disagrees with expected {:.1} for atr% {atr_pct:.2}",
                expected.stop
            )));
        }
        if tp_multiple < expected.tp_min || tp_multiple > expected.tp_max {
            return Err(AgentError::Validation(format!(
                "tp multiple {tp_multiple:.1} outside [{:.1}, {:.1}] for atr% {atr_pct:.2} regime {}",
                expected.tp_min,
                expected.tp_max,
                regime.as_str()
            )));
        }

        let mut leverage = self.leverage_from_volatility(symbol, atr_pct);
        let mut stop_mult = stop_multiple;
        let mut tp_mult = tp_multiple;
        let mut adjusted = false;

        let mut liq = liquidation_price(price, direction, leverage);
        let mut stop_loss = match direction {
            Direction::Up => price - atr * stop_mult,
            _ => price + atr * stop_mult,
        };

        if !stop_is_safe(stop_loss, price, liq, direction) {
            // Pull the stop to the buffered side of the liquidation price and
            // rescale the take-profit to preserve the chosen ratio.
            adjusted = true;
            let safe_stop = match direction {
                Direction::Up => liq + (price - liq) * LIQUIDATION_SAFETY_RATIO,
                _ => liq - (liq - price) * LIQUIDATION_SAFETY_RATIO,
            };
            let actual_mult = (price - safe_stop).abs() / atr;
            if !(MIN_STOP_MULTIPLE..=MAX_STOP_MULTIPLE).contains(&actual_mult) {
                return Err(AgentError::RiskInfeasible(format!(
                    "liquidation-adjusted stop multiple {actual_mult:.2} outside bounds"
                )));
            }
            stop_loss = safe_stop;
            tp_mult = actual_mult * (tp_multiple / stop_multiple);
            stop_mult = actual_mult;
            if !(MIN_TP_MULTIPLE..=MAX_TP_MULTIPLE).contains(&tp_mult) {
                tp_mult = MIN_TP_MULTIPLE;
                let rescued_rr = tp_mult / stop_mult;
                if rescued_rr < MIN_RISK_REWARD * (1.0 - RR_FLOAT_TOLERANCE) {
                    return Err(AgentError::RiskInfeasible(format!(
                        "cannot hold R/R {MIN_RISK_REWARD:.1} after liquidation adjustment"
                    )));
                }
            }
            // Leverage is left as computed; the stop moved instead. Refresh
            // the liquidation price for reporting.
            liq = liquidation_price(price, direction, leverage);
        }

        let take_profit = match direction {
            Direction::Up => price + atr * tp_mult,
            _ => price - atr * tp_mult,
        };

        let risk_pct = (price - stop_loss).abs() / price * 100.0;
        let reward_pct = (take_profit - price).abs() / price * 100.0;
        let risk_reward = reward_pct / risk_pct;

        // The realized ratio must agree with the multiple ratio; a mismatch
        // means the arithmetic upstream cannot be trusted.
        let theoretical = tp_mult / stop_mult;
        let tolerance = if adjusted { RR_FLOAT_TOLERANCE } else { RR_STRICT_TOLERANCE };
        if (risk_reward - theoretical).abs() > tolerance * theoretical {
            return Err(AgentError::Validation(format!(
                "R/R mismatch: theoretical {theoretical:.2} vs computed {risk_reward:.2}"
            )));
        }
        if risk_reward < MIN_RISK_REWARD * (1.0 - RR_FLOAT_TOLERANCE) {
            return Err(AgentError::RiskInfeasible(format!(
                "risk/reward {risk_reward:.2} below floor"
            )));
        }

        // Budget-based sizing: losing the stop costs one risk budget.
        let risk_budget = total_equity * RISK_BUDGET_PER_TRADE;
        let price_move = risk_pct / 100.0;
        if price_move <= 0.0 || price_move > 0.5 {
            return Err(AgentError::RiskInfeasible(format!(
                "stop distance {:.1}% unusable",
                risk_pct
            )));
        }
        let ideal = risk_budget / price_move * confidence_multiplier(confidence);
        let position_size =
            self.clamp_position_size(ideal, total_equity, available_balance, leverage)?;

        // Paranoia: leverage must stay within the configured tier cap.
        let max_leverage = self.base_leverage(symbol);
        if leverage == 0 || leverage > max_leverage {
            return Err(AgentError::Validation(format!(
                "leverage {leverage} outside (0, {max_leverage}]"
            )));
        }
        leverage = leverage.max(1);

        Ok(RiskParameters {
            leverage,
            position_size_usd: position_size,
            stop_loss,
            take_profit,
            risk_reward,
            liquidation_price: liq,
            risk_pct,
            reward_pct,
            reasoning: format!(
                "atr%={atr_pct:.2} stop={stop_mult:.1}x->{stop_loss:.4} tp={tp_mult:.1}x->{take_profit:.4} \
rr={risk_reward:.2} liq={liq:.4} leverage={leverage}x{}",
                if adjusted { " (liquidation-adjusted)" } else { "" }
            ),
        })
    }

    fn leverage_from_volatility(&self, symbol: &str, atr_pct: f64) -> u32 {
        let coeff = if atr_pct < 2.0 {
            1.0
        } else if atr_pct < 4.0 {
            0.8
        } else {
            0.6
        };
        ((f64::from(self.base_leverage(symbol)) * coeff) as u32).max(1)
    }

    /// Applies the equity cap, the available-balance cap and the minimum
    /// notional.
    fn clamp_position_size(
        &self,
        ideal: f64,
        total_equity: f64,
        available_balance: f64,
        leverage: u32,
    ) -> Result<f64, AgentError> {
        let mut size = ideal;
        size = size.min(total_equity * MAX_KELLY_FRACTION);
        size = size.min(available_balance * AVAILABLE_BALANCE_CAP * f64::from(leverage));

        if size < MIN_NOTIONAL_USDT {
            let required_margin = MIN_NOTIONAL_USDT / f64::from(leverage);
            if required_margin <= available_balance * MARGIN_USAGE_LIMIT {
                size = MIN_NOTIONAL_USDT;
            } else {
                return Err(AgentError::RiskInfeasible(format!(
                    "cannot fund the {MIN_NOTIONAL_USDT:.0} USDT minimum notional \
(margin {required_margin:.2} vs available {available_balance:.2})"
                )));
            }
        }

        Ok(size)
    }
}

/// Approximate venue liquidation price for an isolated position.
#[must_use]
pub fn liquidation_price(entry: f64, direction: Direction, leverage: u32) -> f64 {
    let rate = LIQUIDATION_MARGIN_RATE / f64::from(leverage.max(1));
    match direction {
        Direction::Down => entry * (1.0 + rate),
        _ => entry * (1.0 - rate),
    }
}

/// True when the stop sits on the safe side of the liquidation price by the
/// required buffer.
#[must_use]
pub fn stop_is_safe(stop: f64, entry: f64, liq: f64, direction: Direction) -> bool {
    match direction {
        Direction::Up => stop > liq + (entry - liq) * LIQUIDATION_SAFETY_RATIO,
        Direction::Down => stop < liq - (liq - entry) * LIQUIDATION_SAFETY_RATIO,
        Direction::Neutral => false,
    }
}

fn confidence_multiplier(confidence: Confidence) -> f64 {
    match confidence {
        Confidence::High => CONFIDENCE_HIGH_MULTIPLIER,
        Confidence::Medium => CONFIDENCE_MEDIUM_MULTIPLIER,
        Confidence::Low => CONFIDENCE_LOW_MULTIPLIER,
    }
}

/// Path A distance sanity checks. Below the low-volatility threshold the
/// ATR-relative checks are meaningless, so only absolute percentage ranges
/// apply.
fn validate_distances(
    price: f64,
    stop: f64,
    take_profit: f64,
    snapshot: &MarketSnapshot,
    atr_pct: f64,
) -> Result<(), AgentError> {
    let stop_pct = (price - stop).abs() / price * 100.0;
    let tp_pct = (take_profit - price).abs() / price * 100.0;

    if atr_pct < LOW_VOL_ATR_PCT {
        let (stop_lo, stop_hi) = LOW_VOL_STOP_RANGE_PCT;
        let (tp_lo, tp_hi) = LOW_VOL_TP_RANGE_PCT;
        if !(stop_lo..=stop_hi).contains(&stop_pct) {
            return Err(AgentError::RiskInfeasible(format!(
                "low-vol stop distance {stop_pct:.2}% outside [{stop_lo}, {stop_hi}]%"
            )));
        }
        if !(tp_lo..=tp_hi).contains(&tp_pct) {
            return Err(AgentError::RiskInfeasible(format!(
                "low-vol tp distance {tp_pct:.2}% outside [{tp_lo}, {tp_hi}]%"
            )));
        }
        return Ok(());
    }

    let atr = snapshot.atr14;
    let stop_distance = (price - stop).abs();
    if stop_distance < atr {
        return Err(AgentError::RiskInfeasible(format!(
            "stop distance {stop_distance:.4} tighter than one ATR ({atr:.4})"
        )));
    }
    if stop_distance > MAX_STOP_MULTIPLE * atr {
        return Err(AgentError::RiskInfeasible(format!(
            "stop distance {:.1}x ATR beyond the {MAX_STOP_MULTIPLE}x cap",
            stop_distance / atr
        )));
    }
    let tp_distance = (take_profit - price).abs();
    if tp_distance > MAX_TP_MULTIPLE * atr {
        return Err(AgentError::RiskInfeasible(format!(
            "tp distance {:.1}x ATR beyond the {MAX_TP_MULTIPLE}x cap",
            tp_distance / atr
        )));
    }
    Ok(())
}

/// The model's discrete multiple choice for path B.
#[derive(Debug, Deserialize)]
pub struct MultipleChoice {
    pub stop_multiple: f64,
    pub take_profit_multiple: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Agent wrapper for path B: asks the model for multiples, then hands them
/// to the deterministic engine.
pub struct RiskAgent {
    llm: Arc<dyn LlmClient>,
    engine: RiskEngine,
}

impl RiskAgent {
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>, btc_eth_leverage: u32, altcoin_leverage: u32) -> Self {
        Self { llm, engine: RiskEngine::new(btc_eth_leverage, altcoin_leverage) }
    }

    #[must_use]
    pub const fn engine(&self) -> &RiskEngine {
        &self.engine
    }

    /// Full path B: multiple selection by the model, verification and price
    /// math here.
    #[allow(clippy::too_many_arguments)]
    pub async fn calculate(
        &self,
        symbol: &str,
        direction: Direction,
        confidence: Confidence,
        snapshot: &MarketSnapshot,
        regime: Regime,
        total_equity: f64,
        available_balance: f64,
    ) -> Result<RiskParameters, AgentError> {
        let atr_pct = snapshot.atr_pct();
        let expected = expected_multiples(atr_pct, regime.is_trending());

        let prompt = format!(
            "You are a risk manager choosing stop and take-profit distances in ATR multiples. \
Pick only the multiples; all math is done by the system.\n\n\
symbol: {symbol} {}\nprice: {:.4}\nATR14: {:.4}\nATR%: {atr_pct:.2}% (computed by the system)\n\
regime: {}\n\nRule: stop multiple {:.1} (within 0.5); take-profit within [{:.1}, {:.1}].\n\n\
Answer with pure JSON: {{\"stop_multiple\": {:.1}, \"take_profit_multiple\": {:.1}, \
\"reasoning\": \"...\"}}",
            direction.as_str(),
            snapshot.price,
            snapshot.atr14,
            regime.as_str(),
            expected.stop,
            expected.tp_min,
            expected.tp_max,
            expected.stop,
            expected.tp_min,
        );

        let response = self.llm.call("", &prompt).await?;
        let json = extract_json(&response).ok_or(AgentError::NoJson)?;
        let choice: MultipleChoice = serde_json::from_str(json)?;
        debug!(
            symbol,
            stop = choice.stop_multiple,
            tp = choice.take_profit_multiple,
            "model multiple choice"
        );

        self.engine.position_from_multiples(
            symbol,
            direction,
            confidence,
            snapshot,
            regime,
            choice.stop_multiple,
            choice.take_profit_multiple,
            total_equity,
            available_balance,
        )
    }
}
