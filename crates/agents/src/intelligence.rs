//! Stage-1 market intelligence: one LLM call summarizing the macro state.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::llm::{extract_json, LlmClient};
use crate::AgentError;
use perppilot_core::types::MarketIntelligence;
use perppilot_market_data::MarketSnapshot;

pub struct IntelligenceAgent {
    llm: Arc<dyn LlmClient>,
}

#[derive(Deserialize)]
struct RawIntelligence {
    market_phase: String,
    #[serde(default)]
    key_risks: Vec<String>,
    #[serde(default)]
    key_opportunities: Vec<String>,
    #[serde(default)]
    summary: String,
}

impl IntelligenceAgent {
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Produces the macro blob from the BTC snapshot and the candidate
    /// universe. Failures degrade to [`MarketIntelligence::unavailable`];
    /// a tick is never aborted over missing intelligence.
    pub async fn collect(
        &self,
        btc: &MarketSnapshot,
        candidates: &[String],
        snapshots: &HashMap<String, MarketSnapshot>,
    ) -> MarketIntelligence {
        match self.collect_inner(btc, candidates, snapshots).await {
            Ok(intelligence) => intelligence,
            Err(err) => {
                warn!(error = %err, "market intelligence unavailable");
                MarketIntelligence::unavailable()
            }
        }
    }

    async fn collect_inner(
        &self,
        btc: &MarketSnapshot,
        candidates: &[String],
        snapshots: &HashMap<String, MarketSnapshot>,
    ) -> Result<MarketIntelligence, AgentError> {
        let prompt = build_prompt(btc, candidates, snapshots);
        let response = self.llm.call(SYSTEM_PROMPT, &prompt).await?;
        let json = extract_json(&response).ok_or(AgentError::NoJson)?;
        let raw: RawIntelligence = serde_json::from_str(json)?;

        if raw.market_phase.is_empty() {
            return Err(AgentError::Validation("empty market_phase".to_string()));
        }

        Ok(MarketIntelligence {
            market_phase: raw.market_phase,
            key_risks: raw.key_risks,
            key_opportunities: raw.key_opportunities,
            summary: raw.summary,
        })
    }
}

const SYSTEM_PROMPT: &str = "You are a crypto market analyst. Summarize the \
current macro state of the perp futures market from the data provided. \
Respond with a single JSON object: {\"market_phase\": \"...\", \
\"key_risks\": [...], \"key_opportunities\": [...], \"summary\": \"...\"}. \
Keep market_phase to a few words (e.g. \"risk-on uptrend\", \"choppy range\"). \
No other text.";

fn build_prompt(
    btc: &MarketSnapshot,
    candidates: &[String],
    snapshots: &HashMap<String, MarketSnapshot>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# BTC\nprice={:.2} ema50={:.2} ema200={:.2} atr%={:.2} rsi14={:.1} adx={:.1} funding={:.5} 24h={:+.2}%",
        btc.price,
        btc.ema50,
        btc.ema200,
        btc.atr_pct(),
        btc.rsi14,
        btc.adx,
        btc.funding_rate,
        btc.price_change_24h,
    );

    out.push_str("\n# Universe (symbol, 1h%, 24h%, atr%)\n");
    for symbol in candidates.iter().take(20) {
        if let Some(snap) = snapshots.get(symbol) {
            let _ = writeln!(
                out,
                "{symbol}: {:+.2}% {:+.2}% {:.2}%",
                snap.price_change_1h,
                snap.price_change_24h,
                snap.atr_pct(),
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct ScriptedLlm(String);

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn call(&self, _system: &str, _user: &str) -> Result<String, AgentError> {
            Ok(self.0.clone())
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn call(&self, _system: &str, _user: &str) -> Result<String, AgentError> {
            Err(AgentError::Llm("down".to_string()))
        }
    }

    fn btc_snapshot() -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            price: 108_200.0,
            ema20: 107_000.0,
            ema50: 106_000.0,
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
            price_change_4h: 1.0,
            price_change_24h: 2.5,
            volume_24h: 1.0e9,
            current_volume: 1000.0,
            avg_volume: 900.0,
            open_interest: 80_000.0,
            funding_rate: 0.00005,
            intraday: Default::default(),
            timestamp: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn parses_intelligence_json() {
        let llm = Arc::new(ScriptedLlm(
            r#"{"market_phase": "risk-on uptrend", "key_risks": ["crowded longs"], "key_opportunities": ["BTC momentum"], "summary": "trend intact"}"#
                .to_string(),
        ));
        let agent = IntelligenceAgent::new(llm);
        let out = agent
            .collect(&btc_snapshot(), &["BTCUSDT".to_string()], &HashMap::new())
            .await;
        assert_eq!(out.market_phase, "risk-on uptrend");
        assert_eq!(out.key_risks.len(), 1);
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_unknown() {
        let agent = IntelligenceAgent::new(Arc::new(FailingLlm));
        let out = agent.collect(&btc_snapshot(), &[], &HashMap::new()).await;
        assert_eq!(out.market_phase, "unknown");
    }

    #[tokio::test]
    async fn garbage_response_degrades_to_unknown() {
        let agent = IntelligenceAgent::new(Arc::new(ScriptedLlm("lol no json".to_string())));
        let out = agent.collect(&btc_snapshot(), &[], &HashMap::new()).await;
        assert_eq!(out.market_phase, "unknown");
    }
}
