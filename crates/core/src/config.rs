use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub trader: TraderConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub constraints: ConstraintConfig,
    #[serde(default)]
    pub gate: GateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    /// Unique trader id; scopes the on-disk state directories.
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Tick period in seconds.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Kline bar length used by the market-data adapter.
    #[serde(default = "default_kline_interval")]
    pub kline_interval: String,
    /// Reference balance for drawdown and PnL percentages.
    pub initial_balance: f64,
    #[serde(default = "default_btc_eth_leverage")]
    pub btc_eth_leverage: u32,
    #[serde(default = "default_altcoin_leverage")]
    pub altcoin_leverage: u32,
    /// Circuit breaker: daily loss percent that pauses trading.
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    /// Circuit breaker: drawdown percent that pauses trading.
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    /// How long a tripped circuit breaker pauses trading, in minutes.
    #[serde(default = "default_stop_trading_minutes")]
    pub stop_trading_minutes: u64,
    /// When true every open goes out as a dynamically priced limit order.
    #[serde(default)]
    pub use_limit_orders: bool,
    /// Candidate-universe size fed to the orchestrator each tick.
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
    /// Static candidate universe used when no external provider is wired.
    #[serde(default = "default_candidate_symbols")]
    pub candidate_symbols: Vec<String>,
    /// Root directory for persisted state (memory, orders, logs, records).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// "binance" or "mock".
    #[serde(default = "default_venue")]
    pub venue: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub testnet: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            venue: default_venue(),
            api_key: String::new(),
            api_secret: String::new(),
            testnet: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible chat-completions endpoint.
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintConfig {
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default = "default_daily_cap")]
    pub daily_open_cap: usize,
    #[serde(default = "default_hourly_cap")]
    pub hourly_open_cap: usize,
    #[serde(default = "default_min_hold_minutes")]
    pub min_hold_minutes: i64,
    /// When true, at most one concurrent position per side across symbols;
    /// a fill that violates it is emergency-closed.
    #[serde(default)]
    pub single_position_per_side: bool,
}

impl Default for ConstraintConfig {
    fn default() -> Self {
        Self {
            cooldown_minutes: default_cooldown_minutes(),
            max_positions: default_max_positions(),
            daily_open_cap: default_daily_cap(),
            hourly_open_cap: default_hourly_cap(),
            min_hold_minutes: default_min_hold_minutes(),
            single_position_per_side: false,
        }
    }
}

/// Which probability-floor policy the orchestrator runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// Fixed floor of 0.65, medium confidence allowed.
    Permissive,
    /// Floor escalates as realized Sharpe deteriorates; halts below -0.5.
    SharpeAdaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_gate_policy")]
    pub policy: GatePolicy,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { policy: default_gate_policy() }
    }
}

const fn default_scan_interval_secs() -> u64 {
    180
}

fn default_kline_interval() -> String {
    "5m".to_string()
}

const fn default_btc_eth_leverage() -> u32 {
    8
}

const fn default_altcoin_leverage() -> u32 {
    5
}

const fn default_max_daily_loss_pct() -> f64 {
    10.0
}

const fn default_max_drawdown_pct() -> f64 {
    25.0
}

const fn default_stop_trading_minutes() -> u64 {
    120
}

const fn default_candidate_limit() -> usize {
    20
}

fn default_candidate_symbols() -> Vec<String> {
    ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT", "DOGEUSDT"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_venue() -> String {
    "mock".to_string()
}

const fn default_llm_timeout_secs() -> u64 {
    90
}

const fn default_cooldown_minutes() -> i64 {
    20
}

const fn default_max_positions() -> usize {
    3
}

const fn default_daily_cap() -> usize {
    999
}

const fn default_hourly_cap() -> usize {
    3
}

const fn default_min_hold_minutes() -> i64 {
    15
}

const fn default_gate_policy() -> GatePolicy {
    GatePolicy::Permissive
}
