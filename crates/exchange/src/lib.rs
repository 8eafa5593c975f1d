//! Exchange capability surface and adapters.
//!
//! The decision pipeline talks to one polymorphic [`Trader`] trait; Binance
//! futures and an in-memory mock implement it. The orchestrator never
//! type-switches on the venue.

pub mod binance;
pub mod mock;
pub mod precision;
pub mod trailing;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use perppilot_core::types::{PositionInfo, PositionSide};

/// Errors surfaced by exchange adapters.
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// The venue throttled us; cached state may still be served.
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    #[error("invalid precision for {symbol}: {detail}")]
    InvalidPrecision { symbol: String, detail: String },

    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Venue-local cooldown after closing the symbol.
    #[error("symbol in cooldown: {0}")]
    Cooldown(String),

    #[error("no open {side:?} position for {symbol}")]
    NoPosition { symbol: String, side: PositionSide },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed venue response: {0}")]
    MalformedResponse(String),
}

/// Account balances, quote-denominated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountBalance {
    pub total_wallet_balance: Decimal,
    pub available_balance: Decimal,
    pub total_unrealized_profit: Decimal,
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: i64,
    pub symbol: String,
    pub status: VenueOrderStatus,
    /// Filled on close acks when the venue reports the fill price.
    pub realized_pnl: Option<Decimal>,
}

/// Venue-side order states the core reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VenueOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    #[serde(other)]
    Unknown,
}

impl VenueOrderStatus {
    /// Terminal states never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Expired)
    }
}

/// Queried status of one order.
#[derive(Debug, Clone)]
pub struct OrderStatusInfo {
    pub order_id: i64,
    pub status: VenueOrderStatus,
    pub executed_qty: Decimal,
    pub avg_price: Decimal,
}

/// Open protective/entry order summary (for recovery checks).
#[derive(Debug, Clone)]
pub struct OpenOrderInfo {
    pub order_id: i64,
    pub order_type: String,
    pub side: PositionSide,
    pub stop_price: Decimal,
}

impl OpenOrderInfo {
    /// True for venue-side protective orders (stop or take-profit market).
    #[must_use]
    pub fn is_protective(&self) -> bool {
        self.order_type == "STOP_MARKET" || self.order_type == "TAKE_PROFIT_MARKET"
    }
}

/// Uniform capability set over cash-settled perp futures venues.
#[async_trait]
pub trait Trader: Send + Sync {
    async fn balance(&self) -> Result<AccountBalance, ExchangeError>;

    /// Live positions. Implementations run their trailing-stop pass here so
    /// every snapshot of positions also ratchets protection.
    async fn positions(&self) -> Result<Vec<PositionInfo>, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;
    async fn set_margin_type_isolated(&self, symbol: &str) -> Result<(), ExchangeError>;

    async fn open_long(
        &self,
        symbol: &str,
        quantity: Decimal,
        leverage: u32,
    ) -> Result<OrderAck, ExchangeError>;
    async fn open_short(
        &self,
        symbol: &str,
        quantity: Decimal,
        leverage: u32,
    ) -> Result<OrderAck, ExchangeError>;

    /// `quantity == 0` flattens the whole position.
    async fn close_long(&self, symbol: &str, quantity: Decimal) -> Result<OrderAck, ExchangeError>;
    async fn close_short(&self, symbol: &str, quantity: Decimal)
        -> Result<OrderAck, ExchangeError>;

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<(), ExchangeError>;
    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<(), ExchangeError>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: PositionSide,
        price: Decimal,
        quantity: Decimal,
        leverage: u32,
    ) -> Result<OrderAck, ExchangeError>;
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError>;
    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError>;
    async fn order_status(
        &self,
        symbol: &str,
        order_id: i64,
    ) -> Result<OrderStatusInfo, ExchangeError>;
    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrderInfo>, ExchangeError>;

    async fn market_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Formats a quantity to the venue's lot-size precision.
    async fn format_quantity(&self, symbol: &str, quantity: Decimal)
        -> Result<String, ExchangeError>;
    /// Formats a price to the venue's tick-size precision.
    async fn format_price(&self, symbol: &str, price: Decimal) -> Result<String, ExchangeError>;
}
