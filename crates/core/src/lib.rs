pub mod config;
pub mod config_loader;
pub mod constants;
pub mod regime;
pub mod types;

pub use config::AppConfig;
pub use regime::Regime;
pub use types::{
    AccountInfo, CandidateSymbol, Confidence, Decision, DecisionAction, Direction,
    MarketIntelligence, PositionInfo, PositionSide, Prediction, RiskLevel, RiskParameters,
    Timeframe,
};
