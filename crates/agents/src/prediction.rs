//! Per-symbol prediction agent: prompt, call, normalize, calibrate,
//! validate, retry.
//!
//! The model returns a JSON object with enum fields and bounded percentages.
//! Everything is re-checked here; a prediction that survives validation is
//! safe for the risk engine to size from.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::llm::{extract_json, LlmClient};
use crate::AgentError;
use perppilot_core::constants::required_probability_for_drawdown;
use perppilot_core::types::{
    AccountInfo, Confidence, Direction, MarketIntelligence, PositionInfo, Prediction, RiskLevel,
    Timeframe,
};
use perppilot_market_data::MarketSnapshot;
use perppilot_tracker::HistoricalPerformance;

/// Snapshot older than this is refused outright.
const MAX_SNAPSHOT_AGE_MINUTES: i64 = 10;
/// Minimum evaluated sample before probability calibration applies.
const CALIBRATION_MIN_SAMPLE: usize = 5;
/// Below this realized accuracy the history is treated as noise.
const CALIBRATION_MIN_ACCURACY: f64 = 0.30;

/// Everything the prediction prompt is built from.
pub struct PredictionContext<'a> {
    pub intelligence: &'a MarketIntelligence,
    pub snapshot: &'a MarketSnapshot,
    pub account: &'a AccountInfo,
    pub positions: &'a [PositionInfo],
    pub performance: Option<&'a HistoricalPerformance>,
    pub sharpe_ratio: Option<f64>,
    pub recent_feedback: &'a str,
    pub memory_prompt: &'a str,
}

/// Loosely-typed model output before normalization.
#[derive(Debug, Deserialize)]
struct RawPrediction {
    #[serde(default)]
    symbol: String,
    direction: String,
    probability: f64,
    expected_move: f64,
    #[serde(default)]
    best_case: f64,
    #[serde(default)]
    worst_case: f64,
    #[serde(default)]
    timeframe: String,
    confidence: String,
    #[serde(default)]
    risk_level: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    key_factors: Vec<String>,
}

pub struct PredictionAgent {
    llm: Arc<dyn LlmClient>,
}

impl PredictionAgent {
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// One prediction attempt for the context's symbol.
    pub async fn predict(&self, ctx: &PredictionContext<'_>) -> Result<Prediction, AgentError> {
        validate_snapshot(ctx.snapshot)?;

        let system_prompt = build_system_prompt();
        let user_prompt = build_user_prompt(ctx);
        let response = self.llm.call(&system_prompt, &user_prompt).await?;

        let json = extract_json(&response).ok_or(AgentError::NoJson)?;
        debug!(symbol = %ctx.snapshot.symbol, raw = json, "raw prediction");
        let raw: RawPrediction = serde_json::from_str(json)?;

        let mut prediction = normalize(raw, ctx.snapshot)?;
        correct_sign_bugs(&mut prediction);
        calibrate(&mut prediction, ctx);

        validate(&prediction)?;
        validate_against_market(&prediction, ctx.snapshot)?;

        Ok(prediction)
    }

    /// Retries transient failures with linear backoff; validation failures
    /// also retry since the next sample usually parses.
    pub async fn predict_with_retry(
        &self,
        ctx: &PredictionContext<'_>,
        max_attempts: u32,
    ) -> Result<Prediction, AgentError> {
        let attempts = max_attempts.max(1);
        let mut last_err = AgentError::Llm("no attempts made".to_string());

        for attempt in 1..=attempts {
            match self.predict(ctx).await {
                Ok(prediction) => return Ok(prediction),
                Err(err) => {
                    warn!(
                        symbol = %ctx.snapshot.symbol,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "prediction attempt failed"
                    );
                    last_err = err;
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                    }
                }
            }
        }

        Err(last_err)
    }
}

fn validate_snapshot(snapshot: &MarketSnapshot) -> Result<(), AgentError> {
    if snapshot.price <= 0.0 {
        return Err(AgentError::Validation("non-positive price".to_string()));
    }
    if !(0.0..=100.0).contains(&snapshot.rsi7) {
        return Err(AgentError::Validation(format!("rsi7 out of range: {}", snapshot.rsi7)));
    }
    if snapshot.timestamp > 0 {
        let age = chrono::Utc::now().timestamp() - snapshot.timestamp;
        if age > MAX_SNAPSHOT_AGE_MINUTES * 60 {
            return Err(AgentError::Validation(format!(
                "market data stale by {} min",
                age / 60
            )));
        }
    }
    Ok(())
}

fn normalize(raw: RawPrediction, snapshot: &MarketSnapshot) -> Result<Prediction, AgentError> {
    let direction = match raw.direction.trim().to_lowercase().as_str() {
        "up" | "long" | "bull" => Direction::Up,
        "down" | "short" | "bear" => Direction::Down,
        "neutral" | "flat" => Direction::Neutral,
        other => {
            return Err(AgentError::Validation(format!("unknown direction: {other}")));
        }
    };

    let confidence = match raw.confidence.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
        "high" | "very_high" => Confidence::High,
        "medium" | "moderate" | "mid" => Confidence::Medium,
        "low" | "very_low" => Confidence::Low,
        other => {
            return Err(AgentError::Validation(format!("unknown confidence: {other}")));
        }
    };

    let risk_level = match raw.risk_level.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
        "high" | "very_high" => RiskLevel::High,
        "" | "medium" | "moderate" => RiskLevel::Medium,
        "low" | "very_low" => RiskLevel::Low,
        other => {
            return Err(AgentError::Validation(format!("unknown risk_level: {other}")));
        }
    };

    let timeframe = match raw.timeframe.trim().to_lowercase().as_str() {
        "1h" | "1hr" => Some(Timeframe::H1),
        "4h" | "4hr" => Some(Timeframe::H4),
        "24h" | "1d" => Some(Timeframe::H24),
        "" => None,
        other => {
            return Err(AgentError::Validation(format!("unknown timeframe: {other}")));
        }
    };

    let symbol = if raw.symbol.is_empty() {
        snapshot.symbol.clone()
    } else {
        raw.symbol.to_uppercase()
    };

    Ok(Prediction {
        symbol,
        direction,
        probability: raw.probability,
        expected_move: raw.expected_move,
        best_case: raw.best_case,
        worst_case: raw.worst_case,
        timeframe: timeframe.unwrap_or_else(|| auto_timeframe(snapshot)),
        confidence,
        risk_level,
        reasoning: raw.reasoning,
        key_factors: raw.key_factors,
    })
}

/// Timeframe pick when the model leaves it empty, by volatility tier.
fn auto_timeframe(snapshot: &MarketSnapshot) -> Timeframe {
    let atr_pct = snapshot.atr_pct();
    if atr_pct > 4.0 {
        Timeframe::H1
    } else if atr_pct > 2.0 {
        Timeframe::H4
    } else if atr_pct < 0.8 {
        Timeframe::H24
    } else {
        Timeframe::H4
    }
}

/// Repairs the model's known sign failure modes instead of crashing on
/// them: a `down` call with both cases positive (or an `up` call with both
/// negative) is flipped back into sign consistency, and the expected move
/// is aligned with the direction.
fn correct_sign_bugs(prediction: &mut Prediction) {
    match prediction.direction {
        Direction::Down => {
            if prediction.best_case > 0.0 && prediction.worst_case > 0.0 {
                let hi = prediction.best_case.max(prediction.worst_case);
                let lo = prediction.best_case.min(prediction.worst_case);
                warn!(
                    symbol = %prediction.symbol,
                    best = prediction.best_case,
                    worst = prediction.worst_case,
                    "down prediction with positive cases, flipping signs"
                );
                prediction.worst_case = -hi;
                prediction.best_case = lo;
            }
            if prediction.expected_move > 0.0 {
                warn!(symbol = %prediction.symbol, "down prediction with positive expected move, negating");
                prediction.expected_move = -prediction.expected_move;
            }
        }
        Direction::Up => {
            if prediction.best_case < 0.0 && prediction.worst_case < 0.0 {
                let hi = prediction.best_case.max(prediction.worst_case);
                let lo = prediction.best_case.min(prediction.worst_case);
                warn!(
                    symbol = %prediction.symbol,
                    best = prediction.best_case,
                    worst = prediction.worst_case,
                    "up prediction with negative cases, flipping signs"
                );
                prediction.best_case = -lo;
                prediction.worst_case = hi;
            }
            if prediction.expected_move < 0.0 {
                warn!(symbol = %prediction.symbol, "up prediction with negative expected move, negating");
                prediction.expected_move = -prediction.expected_move;
            }
        }
        Direction::Neutral => {}
    }
}

/// Rescales the stated probability by realized accuracy once enough
/// evaluations exist, and demotes confidence while Sharpe is negative.
fn calibrate(prediction: &mut Prediction, ctx: &PredictionContext<'_>) {
    if let Some(perf) = ctx.performance {
        if perf.evaluated_count >= CALIBRATION_MIN_SAMPLE
            && perf.avg_accuracy >= CALIBRATION_MIN_ACCURACY
        {
            let factor = (perf.avg_accuracy / 0.5).clamp(0.8, 1.2);
            prediction.probability = (prediction.probability * factor).clamp(0.5, 1.0);
        }
    }

    if ctx.sharpe_ratio.is_some_and(|s| s < 0.0) && prediction.confidence == Confidence::High {
        prediction.confidence = Confidence::Medium;
    }
}

fn validate(prediction: &Prediction) -> Result<(), AgentError> {
    if prediction.symbol.is_empty() {
        return Err(AgentError::Validation("empty symbol".to_string()));
    }
    if !(0.5..=1.0).contains(&prediction.probability) {
        return Err(AgentError::Validation(format!(
            "probability {:.2} outside [0.5, 1.0]",
            prediction.probability
        )));
    }
    if prediction.expected_move.abs() > 10.0 {
        return Err(AgentError::Validation(format!(
            "expected_move {:.2}% outside +/-10%",
            prediction.expected_move
        )));
    }
    if prediction.best_case.abs() > 15.0 || prediction.worst_case.abs() > 15.0 {
        return Err(AgentError::Validation("best/worst case outside +/-15%".to_string()));
    }
    if prediction.direction != Direction::Neutral
        && prediction.best_case <= prediction.worst_case
    {
        return Err(AgentError::Validation(format!(
            "best_case {:.2} must exceed worst_case {:.2}",
            prediction.best_case, prediction.worst_case
        )));
    }

    match prediction.direction {
        Direction::Up => {
            if prediction.best_case <= 0.0 {
                return Err(AgentError::Validation("up with non-positive best_case".to_string()));
            }
            if prediction.worst_case > 0.0 {
                return Err(AgentError::Validation("up with positive worst_case".to_string()));
            }
            if prediction.expected_move <= 0.0 {
                return Err(AgentError::Validation(
                    "up with non-positive expected_move".to_string(),
                ));
            }
        }
        Direction::Down => {
            if prediction.worst_case >= 0.0 {
                return Err(AgentError::Validation(
                    "down with non-negative worst_case".to_string(),
                ));
            }
            if prediction.expected_move >= 0.0 {
                return Err(AgentError::Validation(
                    "down with non-negative expected_move".to_string(),
                ));
            }
        }
        Direction::Neutral => {
            if prediction.probability > 0.60 {
                return Err(AgentError::Validation(format!(
                    "neutral with probability {:.2} > 0.60",
                    prediction.probability
                )));
            }
        }
    }

    if prediction.probability >= 0.80 && prediction.confidence == Confidence::Low {
        return Err(AgentError::Validation(
            "probability >= 0.80 inconsistent with low confidence".to_string(),
        ));
    }
    if prediction.probability < 0.55 && prediction.confidence == Confidence::High {
        return Err(AgentError::Validation(
            "probability < 0.55 inconsistent with high confidence".to_string(),
        ));
    }

    Ok(())
}

/// Market-condition sanity checks: no high-probability capitulation calls,
/// no high-probability fights against an aligned trend.
fn validate_against_market(
    prediction: &Prediction,
    snapshot: &MarketSnapshot,
) -> Result<(), AgentError> {
    let rsi7 = snapshot.rsi7;

    let capitulation_short = prediction.direction == Direction::Down
        && ((rsi7 > 85.0 && prediction.probability > 0.75)
            || (rsi7 > 80.0 && prediction.probability >= 0.80));
    if capitulation_short {
        return Err(AgentError::Validation(format!(
            "capitulation/overbought inverse: rsi7={rsi7:.1} with {:.0}% down call",
            prediction.probability * 100.0
        )));
    }

    let capitulation_long = prediction.direction == Direction::Up
        && ((rsi7 < 15.0 && prediction.probability > 0.75)
            || (rsi7 < 20.0 && prediction.probability >= 0.80));
    if capitulation_long {
        return Err(AgentError::Validation(format!(
            "capitulation/oversold inverse: rsi7={rsi7:.1} with {:.0}% up call",
            prediction.probability * 100.0
        )));
    }

    if snapshot.ema20 > 0.0 && snapshot.ema50 > 0.0 {
        let strong_downtrend = snapshot.price < snapshot.ema20 * 0.98
            && snapshot.ema20 < snapshot.ema50
            && snapshot.macd < -1e-4;
        let strong_uptrend = snapshot.price > snapshot.ema20 * 1.02
            && snapshot.ema20 > snapshot.ema50
            && snapshot.macd > 1e-4;

        if strong_downtrend && prediction.direction == Direction::Up && prediction.probability > 0.70
        {
            return Err(AgentError::Validation(
                "high-probability long against an aligned downtrend".to_string(),
            ));
        }
        if strong_uptrend && prediction.direction == Direction::Down && prediction.probability > 0.70
        {
            return Err(AgentError::Validation(
                "high-probability short against an aligned uptrend".to_string(),
            ));
        }
    }

    Ok(())
}

fn build_system_prompt() -> String {
    "You are a quantitative crypto analyst predicting short-term perp futures moves \
(1h/4h/24h). Weigh account risk, open positions and technical signals, in that order. \
Respect the risk threshold stated in the input: predictions under the stated minimum \
probability will be rejected by the system, and when opens are forbidden you must answer \
neutral with probability 0.50-0.55. Never chase an extended move: overbought RSI with a \
stretched 1h candle means neutral or a modest probability, not a high-conviction call.\n\
Output exactly one JSON object, no prose:\n\
{\"symbol\":\"BTCUSDT\",\"direction\":\"up|down|neutral\",\"probability\":0.65,\
\"expected_move\":2.5,\"best_case\":4.0,\"worst_case\":-2.0,\"timeframe\":\"1h|4h|24h\",\
\"confidence\":\"high|medium|low\",\"risk_level\":\"high|medium|low\",\
\"reasoning\":\"<under 60 words>\",\"key_factors\":[\"...\"]}\n\
Sign convention: best_case > worst_case always; for up predictions best_case > 0 and \
worst_case <= 0; for down predictions worst_case < 0 (the expected drop) and best_case \
is the adverse bounce. expected_move within +/-10, cases within +/-15."
        .to_string()
}

fn build_user_prompt(ctx: &PredictionContext<'_>) -> String {
    let snap = ctx.snapshot;
    let mut out = String::new();

    let _ = writeln!(out, "# Market backdrop\nphase: {}", ctx.intelligence.market_phase);
    if !ctx.intelligence.summary.is_empty() {
        let _ = writeln!(out, "summary: {}", ctx.intelligence.summary);
    }
    if !ctx.intelligence.key_risks.is_empty() {
        let _ = writeln!(out, "risks: {}", ctx.intelligence.key_risks.join(" | "));
    }
    if !ctx.intelligence.key_opportunities.is_empty() {
        let _ = writeln!(out, "opportunities: {}", ctx.intelligence.key_opportunities.join(" | "));
    }

    let _ = writeln!(out, "\n# {}", snap.symbol);
    let _ = writeln!(
        out,
        "{{\"p\":{:.4},\"1h\":{:.2},\"4h\":{:.2},\"24h\":{:.2},\"r7\":{:.1},\"r14\":{:.1},\
\"m\":{:.4},\"ms\":{:.4},\"e20\":{:.4},\"e50\":{:.4},\"atr%\":{:.2},\"adx\":{:.1},\
\"+di\":{:.1},\"-di\":{:.1},\"f\":{:.5},\"vol24h\":{:.1}}}",
        snap.price,
        snap.price_change_1h,
        snap.price_change_4h,
        snap.price_change_24h,
        snap.rsi7,
        snap.rsi14,
        snap.macd,
        snap.macd_signal,
        snap.ema20,
        snap.ema50,
        snap.atr_pct(),
        snap.adx,
        snap.plus_di,
        snap.minus_di,
        snap.funding_rate,
        snap.volume_24h / 1e6,
    );

    let account = ctx.account;
    let _ = writeln!(out, "\n# Account");
    let _ = writeln!(
        out,
        "equity: {:.2} USDT | available: {:.2} USDT | margin used: {:.1}%",
        account.total_equity, account.available_balance, account.margin_used_pct
    );
    let _ = writeln!(
        out,
        "total pnl: {:+.2} USDT ({:+.2}%)",
        account.total_pnl, account.total_pnl_pct
    );
    let risk_label = if account.margin_used_pct > 60.0 {
        "high"
    } else if account.margin_used_pct > 40.0 {
        "elevated"
    } else {
        "low"
    };
    let _ = writeln!(out, "account risk: {risk_label}");
    if let Some(sharpe) = ctx.sharpe_ratio {
        let _ = writeln!(out, "recent sharpe: {sharpe:.2}");
    }

    if ctx.positions.is_empty() {
        let _ = writeln!(out, "\n# Positions: none");
    } else {
        let _ = writeln!(out, "\n# Positions ({})", ctx.positions.len());
        for pos in ctx.positions {
            let held = pos
                .held_minutes(chrono::Utc::now())
                .map_or_else(|| "unknown".to_string(), |m| format!("{m} min"));
            let _ = writeln!(
                out,
                "{} {} entry {} mark {} pnl {:+.2}% lev {}x held {held}",
                pos.symbol,
                pos.side.as_str(),
                pos.entry_price,
                pos.mark_price,
                pos.unrealized_pnl_pct,
                pos.leverage,
            );
        }
    }

    let required = required_probability_for_drawdown(account.total_pnl_pct);
    let _ = writeln!(out, "\n# Risk threshold (binding)");
    if required > 1.0 {
        let _ = writeln!(
            out,
            "account loss {:.2}%: opens are forbidden; answer neutral with probability 0.50-0.55",
            account.total_pnl_pct
        );
    } else {
        let _ = writeln!(
            out,
            "account pnl {:.2}%: minimum probability {:.0}%; lower-probability calls are rejected",
            account.total_pnl_pct,
            required * 100.0
        );
    }

    if let Some(perf) = ctx.performance {
        if perf.evaluated_count > 0 {
            let _ = writeln!(
                out,
                "\n# Historical performance\nwin rate {:.0}% | avg accuracy {:.0}% over {} evaluated",
                perf.overall_win_rate * 100.0,
                perf.avg_accuracy * 100.0,
                perf.evaluated_count
            );
            if !perf.common_mistakes.is_empty() {
                let _ = writeln!(out, "avoid: {}", perf.common_mistakes);
            }
        }
    }

    if !ctx.recent_feedback.is_empty() {
        let _ = writeln!(out, "\n# Recent prediction outcomes\n{}", ctx.recent_feedback);
        let _ = writeln!(out, "Check: repeating a past mistake? matching a past success?");
    }

    if !ctx.memory_prompt.is_empty() {
        let _ = writeln!(out, "\n# Your trading history\n{}", ctx.memory_prompt);
    }

    out.push_str("\n# Predict now\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use perppilot_core::types::MarketIntelligence;

    struct ScriptedLlm(Vec<String>);

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn call(&self, _system: &str, _user: &str) -> Result<String, AgentError> {
            // Pops from the front on each call via interior index encoded in
            // the list: simplest scripted behavior is to always return the
            // first entry; multi-response tests use `SequenceLlm`.
            Ok(self.0[0].clone())
        }
    }

    struct SequenceLlm {
        responses: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for SequenceLlm {
        async fn call(&self, _system: &str, _user: &str) -> Result<String, AgentError> {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Err(AgentError::Llm("exhausted".to_string()))
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            price: 108_200.0,
            ema20: 107_500.0,
            ema50: 106_800.0,
            ema200: 100_000.0,
            atr3: 500.0,
            atr14: 800.0,
            rsi7: 60.0,
            rsi14: 55.0,
            macd: 120.0,
            macd_signal: 100.0,
            adx: 30.0,
            plus_di: 25.0,
            minus_di: 12.0,
            price_change_15m: 0.1,
            price_change_30m: 0.2,
            price_change_1h: 0.5,
            price_change_4h: 1.2,
            price_change_24h: 2.5,
            volume_24h: 1.0e9,
            current_volume: 1000.0,
            avg_volume: 900.0,
            open_interest: 80_000.0,
            funding_rate: 0.00005,
            intraday: Default::default(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    fn context<'a>(
        intelligence: &'a MarketIntelligence,
        snap: &'a MarketSnapshot,
        account: &'a AccountInfo,
    ) -> PredictionContext<'a> {
        PredictionContext {
            intelligence,
            snapshot: snap,
            account,
            positions: &[],
            performance: None,
            sharpe_ratio: None,
            recent_feedback: "",
            memory_prompt: "",
        }
    }

    fn good_response() -> String {
        r#"{"symbol":"BTCUSDT","direction":"up","probability":0.72,"expected_move":2.5,
"best_case":4.0,"worst_case":-2.0,"timeframe":"4h","confidence":"high",
"risk_level":"medium","reasoning":"trend intact","key_factors":["ema stack","macd"]}"#
            .to_string()
    }

    #[tokio::test]
    async fn parses_and_validates_a_clean_prediction() {
        let agent = PredictionAgent::new(Arc::new(ScriptedLlm(vec![good_response()])));
        let intelligence = MarketIntelligence::unavailable();
        let snap = snapshot();
        let account = AccountInfo { total_equity: 1000.0, ..AccountInfo::default() };
        let prediction = agent.predict(&context(&intelligence, &snap, &account)).await.unwrap();

        assert_eq!(prediction.direction, Direction::Up);
        assert_eq!(prediction.timeframe, Timeframe::H4);
        assert!((prediction.probability - 0.72).abs() < 1e-9);
    }

    #[tokio::test]
    async fn normalizes_enum_aliases() {
        let response = r#"{"symbol":"btcusdt","direction":"long","probability":0.68,
"expected_move":2.0,"best_case":4.0,"worst_case":-2.0,"timeframe":"1hr",
"confidence":"very high","risk_level":"moderate","reasoning":"","key_factors":[]}"#;
        let agent = PredictionAgent::new(Arc::new(ScriptedLlm(vec![response.to_string()])));
        let intelligence = MarketIntelligence::unavailable();
        let snap = snapshot();
        let account = AccountInfo::default();
        let prediction = agent.predict(&context(&intelligence, &snap, &account)).await.unwrap();

        assert_eq!(prediction.symbol, "BTCUSDT");
        assert_eq!(prediction.direction, Direction::Up);
        assert_eq!(prediction.timeframe, Timeframe::H1);
        assert_eq!(prediction.confidence, Confidence::High);
        assert_eq!(prediction.risk_level, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn auto_corrects_down_prediction_sign_bug() {
        // Model answered "down" but gave both cases as positive magnitudes.
        let response = r#"{"direction":"down","probability":0.7,"expected_move":3.0,
"best_case":3.0,"worst_case":1.0,"timeframe":"4h","confidence":"medium",
"risk_level":"medium","reasoning":"","key_factors":[]}"#;
        let agent = PredictionAgent::new(Arc::new(ScriptedLlm(vec![response.to_string()])));
        let intelligence = MarketIntelligence::unavailable();
        // Use a snapshot without an aligned uptrend so the counter-trend
        // guard stays quiet.
        let mut snap = snapshot();
        snap.ema20 = 108_000.0;
        snap.ema50 = 108_500.0;
        let account = AccountInfo::default();
        let prediction = agent.predict(&context(&intelligence, &snap, &account)).await.unwrap();

        assert_eq!(prediction.direction, Direction::Down);
        assert!((prediction.worst_case - -3.0).abs() < 1e-9);
        assert!((prediction.best_case - 1.0).abs() < 1e-9);
        assert!(prediction.expected_move < 0.0);
    }

    #[tokio::test]
    async fn rejects_capitulation_short() {
        // RSI7 at 82 with an 80% down call is the known failure mode.
        let response = r#"{"direction":"down","probability":0.80,"expected_move":-4.0,
"best_case":1.0,"worst_case":-5.0,"timeframe":"1h","confidence":"high",
"risk_level":"medium","reasoning":"","key_factors":[]}"#;
        let agent = PredictionAgent::new(Arc::new(ScriptedLlm(vec![response.to_string()])));
        let intelligence = MarketIntelligence::unavailable();
        let mut snap = snapshot();
        snap.rsi7 = 82.0;
        snap.ema20 = 108_000.0;
        snap.ema50 = 108_500.0;
        let account = AccountInfo::default();
        let err = agent.predict(&context(&intelligence, &snap, &account)).await.unwrap_err();
        assert!(matches!(err, AgentError::Validation(msg) if msg.contains("capitulation")));
    }

    #[tokio::test]
    async fn rejects_neutral_with_high_probability() {
        let response = r#"{"direction":"neutral","probability":0.70,"expected_move":0.0,
"best_case":1.0,"worst_case":-1.0,"timeframe":"4h","confidence":"medium",
"risk_level":"low","reasoning":"","key_factors":[]}"#;
        let agent = PredictionAgent::new(Arc::new(ScriptedLlm(vec![response.to_string()])));
        let intelligence = MarketIntelligence::unavailable();
        let snap = snapshot();
        let account = AccountInfo::default();
        assert!(agent.predict(&context(&intelligence, &snap, &account)).await.is_err());
    }

    #[tokio::test]
    async fn calibration_rescales_probability() {
        let agent = PredictionAgent::new(Arc::new(ScriptedLlm(vec![good_response()])));
        let intelligence = MarketIntelligence::unavailable();
        let snap = snapshot();
        let account = AccountInfo::default();
        let perf = HistoricalPerformance {
            overall_win_rate: 0.5,
            symbol_win_rate: 0.5,
            avg_accuracy: 0.40,
            evaluated_count: 12,
            common_mistakes: String::new(),
        };
        let mut ctx = context(&intelligence, &snap, &account);
        ctx.performance = Some(&perf);

        let prediction = agent.predict(&ctx).await.unwrap();
        // 0.72 * (0.40 / 0.5 = 0.8) = 0.576.
        assert!((prediction.probability - 0.576).abs() < 1e-9);
    }

    #[tokio::test]
    async fn negative_sharpe_demotes_high_confidence() {
        let agent = PredictionAgent::new(Arc::new(ScriptedLlm(vec![good_response()])));
        let intelligence = MarketIntelligence::unavailable();
        let snap = snapshot();
        let account = AccountInfo::default();
        let mut ctx = context(&intelligence, &snap, &account);
        ctx.sharpe_ratio = Some(-0.4);

        let prediction = agent.predict(&ctx).await.unwrap();
        assert_eq!(prediction.confidence, Confidence::Medium);
    }

    #[tokio::test]
    async fn retry_recovers_from_a_bad_first_response() {
        let llm = SequenceLlm {
            responses: parking_lot::Mutex::new(vec![
                "no json at all".to_string(),
                good_response(),
            ]),
        };
        let agent = PredictionAgent::new(Arc::new(llm));
        let intelligence = MarketIntelligence::unavailable();
        let snap = snapshot();
        let account = AccountInfo::default();
        let prediction = agent
            .predict_with_retry(&context(&intelligence, &snap, &account), 3)
            .await
            .unwrap();
        assert_eq!(prediction.direction, Direction::Up);
    }

    #[tokio::test]
    async fn stale_snapshot_is_refused() {
        let agent = PredictionAgent::new(Arc::new(ScriptedLlm(vec![good_response()])));
        let intelligence = MarketIntelligence::unavailable();
        let mut snap = snapshot();
        snap.timestamp = chrono::Utc::now().timestamp() - 3600;
        let account = AccountInfo::default();
        let err = agent.predict(&context(&intelligence, &snap, &account)).await.unwrap_err();
        assert!(matches!(err, AgentError::Validation(msg) if msg.contains("stale")));
    }
}
