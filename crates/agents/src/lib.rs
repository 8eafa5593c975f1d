//! The per-tick reasoning pipeline: market intelligence, per-symbol
//! prediction, risk sizing, entry-timing and portfolio gates, composed by
//! the decision orchestrator.
//!
//! Agents compose by value passing; each owns its prompt, its validation and
//! its retry policy. The LLM is a choice oracle: every number it returns is
//! either an enum or a small discrete pick, and all arithmetic is redone
//! here.

pub mod entry_timing;
pub mod intelligence;
pub mod llm;
pub mod orchestrator;
pub mod portfolio;
pub mod prediction;
pub mod risk;

use thiserror::Error;

/// Errors from the agent pipeline.
#[derive(Error, Debug)]
pub enum AgentError {
    /// LLM transport failure.
    #[error("llm call failed: {0}")]
    Llm(String),

    /// The response carried no parseable JSON object.
    #[error("no JSON object in llm response")]
    NoJson,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The parsed output violated a range or consistency rule.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The opportunity is not tradable under the risk rules.
    #[error("risk infeasible: {0}")]
    RiskInfeasible(String),

    /// Entry rejected by the timing gate.
    #[error("entry rejected: {0}")]
    EntryRejected(String),

    /// Portfolio-level exposure rule violated.
    #[error("portfolio risk: {0}")]
    PortfolioRisk(String),

    #[error("market data missing for {0}")]
    MissingMarketData(String),
}
