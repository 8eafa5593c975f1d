//! Binance USDⓈ-M futures adapter.
//!
//! Every write invalidates the balance/position caches; reads are served
//! from a 60-second cache to survive venue rate limits. `positions()` also
//! runs the trailing-stop pass so protection ratchets on every snapshot.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use crate::precision::{self, SymbolFilters};
use crate::trailing;
use crate::{
    AccountBalance, ExchangeError, OpenOrderInfo, OrderAck, OrderStatusInfo, Trader,
    VenueOrderStatus,
};
use perppilot_core::types::{PositionInfo, PositionSide};

type HmacSha256 = Hmac<Sha256>;

const CACHE_TTL: Duration = Duration::from_secs(60);
const RECV_WINDOW_MS: u64 = 5_000;
/// Venue-local cooldown after closing a symbol; secondary to the trading
/// constraints, scoped to this adapter's process.
const LOCAL_COOLDOWN: Duration = Duration::from_secs(20 * 60);

struct Cached<T> {
    value: T,
    fetched_at: Instant,
}

pub struct BinanceFuturesTrader {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,

    balance_cache: RwLock<Option<Cached<AccountBalance>>>,
    positions_cache: RwLock<Option<Cached<Vec<PositionInfo>>>>,
    filters_cache: RwLock<HashMap<String, SymbolFilters>>,
    last_close_times: RwLock<HashMap<String, Instant>>,
}

impl BinanceFuturesTrader {
    #[must_use]
    pub fn new(api_key: String, api_secret: String, testnet: bool) -> Self {
        let base_url = if testnet {
            info!("using Binance futures testnet");
            "https://testnet.binancefuture.com".to_string()
        } else {
            "https://fapi.binance.com".to_string()
        };
        Self::with_base_url(api_key, api_secret, base_url)
    }

    #[must_use]
    pub fn with_base_url(api_key: String, api_secret: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url,
            api_key,
            api_secret,
            balance_cache: RwLock::new(None),
            positions_cache: RwLock::new(None),
            filters_cache: RwLock::new(HashMap::new()),
            last_close_times: RwLock::new(HashMap::new()),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<Value, ExchangeError> {
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));

        let query: String = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        let url = format!("{}{path}?{query}&signature={signature}", self.base_url);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        Self::decode_response(response).await
    }

    async fn public_request(&self, path_and_query: &str) -> Result<Value, ExchangeError> {
        let url = format!("{}{path_and_query}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;
        Self::decode_response(response).await
    }

    async fn decode_response(response: reqwest::Response) -> Result<Value, ExchangeError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(ExchangeError::RateLimited(body));
        }
        if !status.is_success() {
            if body.contains("-2019") || body.contains("Margin is insufficient") {
                return Err(ExchangeError::InsufficientMargin(body));
            }
            return Err(ExchangeError::OrderRejected(format!("HTTP {status}: {body}")));
        }

        serde_json::from_str(&body).map_err(|e| ExchangeError::MalformedResponse(e.to_string()))
    }

    fn invalidate_caches(&self) {
        *self.balance_cache.write() = None;
        *self.positions_cache.write() = None;
    }

    fn check_local_cooldown(&self, symbol: &str) -> Result<(), ExchangeError> {
        if let Some(closed_at) = self.last_close_times.read().get(symbol) {
            let elapsed = closed_at.elapsed();
            if elapsed < LOCAL_COOLDOWN {
                let remaining = LOCAL_COOLDOWN - elapsed;
                return Err(ExchangeError::Cooldown(format!(
                    "{symbol} closed {:.0} min ago, {:.0} min remaining",
                    elapsed.as_secs() / 60,
                    remaining.as_secs() / 60
                )));
            }
        }
        Ok(())
    }

    async fn filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        if let Some(filters) = self.filters_cache.read().get(symbol) {
            return Ok(*filters);
        }

        let info = self.public_request("/fapi/v1/exchangeInfo").await?;
        let symbols = info
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| ExchangeError::MalformedResponse("exchangeInfo symbols".to_string()))?;

        let mut cache = self.filters_cache.write();
        for entry in symbols {
            let Some(name) = entry.get("symbol").and_then(Value::as_str) else {
                continue;
            };
            let mut filters = SymbolFilters::default();
            if let Some(list) = entry.get("filters").and_then(Value::as_array) {
                for f in list {
                    match f.get("filterType").and_then(Value::as_str) {
                        Some("LOT_SIZE") => {
                            if let Some(step) = f.get("stepSize").and_then(Value::as_str) {
                                filters.quantity_precision = precision::precision_from_step(step);
                            }
                        }
                        Some("PRICE_FILTER") => {
                            if let Some(tick) = f.get("tickSize").and_then(Value::as_str) {
                                filters.price_precision = precision::precision_from_step(tick);
                            }
                        }
                        _ => {}
                    }
                }
            }
            cache.insert(name.to_string(), filters);
        }

        cache.get(symbol).copied().ok_or_else(|| ExchangeError::InvalidPrecision {
            symbol: symbol.to_string(),
            detail: "symbol not in exchangeInfo".to_string(),
        })
    }

    fn parse_position(entry: &Value) -> Option<PositionInfo> {
        let amount = decimal_field(entry, "positionAmt")?;
        if amount.is_zero() {
            return None;
        }

        let symbol = entry.get("symbol")?.as_str()?.to_string();
        let entry_price = decimal_field(entry, "entryPrice")?;
        let mark_price = decimal_field(entry, "markPrice")?;
        let unrealized = decimal_field(entry, "unRealizedProfit")?;
        let liquidation = decimal_field(entry, "liquidationPrice").unwrap_or_default();
        let leverage = decimal_field(entry, "leverage")
            .and_then(|d| d.to_u32())
            .unwrap_or(1)
            .max(1);

        let side = if amount > Decimal::ZERO { PositionSide::Long } else { PositionSide::Short };
        let quantity = amount.abs();
        let margin_used = if leverage > 0 {
            quantity * mark_price / Decimal::from(leverage)
        } else {
            Decimal::ZERO
        };

        let entry_f = entry_price.to_f64().unwrap_or(0.0);
        let mark_f = mark_price.to_f64().unwrap_or(0.0);
        let pnl_pct = if entry_f > 0.0 {
            let move_pct = match side {
                PositionSide::Long => (mark_f - entry_f) / entry_f,
                PositionSide::Short => (entry_f - mark_f) / entry_f,
            };
            move_pct * f64::from(leverage) * 100.0
        } else {
            0.0
        };

        Some(PositionInfo {
            symbol,
            side,
            entry_price,
            mark_price,
            quantity,
            leverage,
            unrealized_pnl: unrealized,
            unrealized_pnl_pct: pnl_pct,
            liquidation_price: liquidation,
            margin_used,
            open_time: position_update_time(entry),
        })
    }

    /// Current stop price of the protective STOP_MARKET order, if any.
    async fn current_stop(&self, symbol: &str, side: PositionSide) -> Option<f64> {
        let orders = self.open_orders(symbol).await.ok()?;
        orders
            .iter()
            .find(|o| o.order_type == "STOP_MARKET" && o.side == side)
            .and_then(|o| o.stop_price.to_f64())
    }

    /// Replaces the protective stop: the new parameters are formatted and
    /// validated *before* the old stop is canceled; a failure after the
    /// cancel leaves the position unprotected and is logged as critical.
    async fn update_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        new_stop: f64,
    ) -> Result<(), ExchangeError> {
        let stop_price = Decimal::try_from(new_stop).map_err(|_| {
            ExchangeError::InvalidPrecision {
                symbol: symbol.to_string(),
                detail: format!("stop price {new_stop} not representable"),
            }
        })?;

        // Format everything first so nothing can fail after the cancel.
        let filters = self.filters(symbol).await?;
        let quantity_str = precision::format_quantity(quantity.abs(), filters);
        let price_str = precision::format_price(stop_price, filters);

        self.cancel_all_orders(symbol).await?;

        match self.place_stop_order(symbol, side, &quantity_str, &price_str, false).await {
            Ok(()) => {
                info!(symbol, side = side.as_str(), stop = %price_str, "trailing stop updated");
                Ok(())
            }
            Err(err) => {
                error!(
                    symbol,
                    side = side.as_str(),
                    stop = %price_str,
                    error = %err,
                    unprotected_position = true,
                    "old stop canceled but new stop rejected; position is unprotected"
                );
                Err(err)
            }
        }
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: &str,
        stop_price: &str,
        take_profit: bool,
    ) -> Result<(), ExchangeError> {
        let (order_side, position_side) = protective_sides(side);
        let order_type = if take_profit { "TAKE_PROFIT_MARKET" } else { "STOP_MARKET" };

        self.signed_request(
            reqwest::Method::POST,
            "/fapi/v1/order",
            vec![
                ("symbol", symbol.to_string()),
                ("side", order_side.to_string()),
                ("positionSide", position_side.to_string()),
                ("type", order_type.to_string()),
                ("stopPrice", stop_price.to_string()),
                ("quantity", quantity.to_string()),
                ("workingType", "CONTRACT_PRICE".to_string()),
                ("closePosition", "true".to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn market_order(
        &self,
        symbol: &str,
        order_side: &str,
        position_side: &str,
        quantity: &str,
    ) -> Result<Value, ExchangeError> {
        self.signed_request(
            reqwest::Method::POST,
            "/fapi/v1/order",
            vec![
                ("symbol", symbol.to_string()),
                ("side", order_side.to_string()),
                ("positionSide", position_side.to_string()),
                ("type", "MARKET".to_string()),
                ("quantity", quantity.to_string()),
            ],
        )
        .await
    }

    async fn open_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        leverage: u32,
    ) -> Result<OrderAck, ExchangeError> {
        self.check_local_cooldown(symbol)?;

        // Stale protective orders from the previous position would fire
        // against the new one.
        if let Err(err) = self.cancel_all_orders(symbol).await {
            debug!(symbol, error = %err, "no resting orders to cancel before open");
        }

        self.set_leverage(symbol, leverage).await?;
        self.set_margin_type_isolated(symbol).await?;

        let filters = self.filters(symbol).await?;
        let price = self.market_price(symbol).await?;
        let adjusted = precision::enforce_min_notional(quantity, price, filters);
        if adjusted != quantity {
            warn!(
                symbol,
                requested = %quantity,
                adjusted = %adjusted,
                "quantity raised to clear the minimum notional"
            );
        }
        let quantity_str = precision::format_quantity(adjusted, filters);

        let (order_side, position_side) = match side {
            PositionSide::Long => ("BUY", "LONG"),
            PositionSide::Short => ("SELL", "SHORT"),
        };
        let response = self.market_order(symbol, order_side, position_side, &quantity_str).await?;
        self.invalidate_caches();

        Ok(OrderAck {
            order_id: response.get("orderId").and_then(Value::as_i64).unwrap_or(0),
            symbol: symbol.to_string(),
            status: VenueOrderStatus::New,
            realized_pnl: None,
        })
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> Result<OrderAck, ExchangeError> {
        let positions = self.positions().await?;
        let position = positions
            .iter()
            .find(|p| p.symbol == symbol && p.side == side)
            .ok_or_else(|| ExchangeError::NoPosition { symbol: symbol.to_string(), side })?;

        let close_qty = if quantity.is_zero() { position.quantity } else { quantity };
        let entry_price = position.entry_price;

        let filters = self.filters(symbol).await?;
        let quantity_str = precision::format_quantity(close_qty, filters);

        let (order_side, position_side) = match side {
            PositionSide::Long => ("SELL", "LONG"),
            PositionSide::Short => ("BUY", "SHORT"),
        };
        let response = self.market_order(symbol, order_side, position_side, &quantity_str).await?;
        self.invalidate_caches();

        if let Err(err) = self.cancel_all_orders(symbol).await {
            warn!(symbol, error = %err, "failed to cancel protective orders after close");
        }

        let order_id = response.get("orderId").and_then(Value::as_i64).unwrap_or(0);
        let realized_pnl = match self.order_status(symbol, order_id).await {
            Ok(status) if status.avg_price > Decimal::ZERO => {
                let pnl = match side {
                    PositionSide::Long => (status.avg_price - entry_price) * close_qty,
                    PositionSide::Short => (entry_price - status.avg_price) * close_qty,
                };
                Some(pnl)
            }
            _ => None,
        };

        self.last_close_times.write().insert(symbol.to_string(), Instant::now());

        Ok(OrderAck {
            order_id,
            symbol: symbol.to_string(),
            status: VenueOrderStatus::Filled,
            realized_pnl,
        })
    }

    /// Ratchets trailing stops across the freshly fetched positions.
    async fn trailing_pass(&self, positions: &[PositionInfo]) {
        for position in positions {
            let Some(proposal) = trailing::propose(position) else {
                continue;
            };
            let current = self.current_stop(&position.symbol, position.side).await;
            let entry = position.entry_price.to_f64().unwrap_or(0.0);
            let Some(stop) = trailing::resolve(proposal, current, entry, position.side) else {
                continue;
            };
            if let Err(err) = self
                .update_stop_loss(&position.symbol, position.side, position.quantity, stop)
                .await
            {
                warn!(symbol = %position.symbol, error = %err, "trailing stop update failed");
            } else {
                info!(
                    symbol = %position.symbol,
                    side = position.side.as_str(),
                    stop,
                    ratio_pct = proposal.protection_ratio * 100.0,
                    "trailing stop promoted"
                );
            }
        }
    }
}

#[async_trait]
impl Trader for BinanceFuturesTrader {
    async fn balance(&self) -> Result<AccountBalance, ExchangeError> {
        if let Some(cached) = self.balance_cache.read().as_ref() {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                return Ok(cached.value.clone());
            }
        }

        let account = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/account", vec![])
            .await?;
        let balance = AccountBalance {
            total_wallet_balance: decimal_field(&account, "totalWalletBalance")
                .unwrap_or_default(),
            available_balance: decimal_field(&account, "availableBalance").unwrap_or_default(),
            total_unrealized_profit: decimal_field(&account, "totalUnrealizedProfit")
                .unwrap_or_default(),
        };

        *self.balance_cache.write() =
            Some(Cached { value: balance.clone(), fetched_at: Instant::now() });
        Ok(balance)
    }

    async fn positions(&self) -> Result<Vec<PositionInfo>, ExchangeError> {
        if let Some(cached) = self.positions_cache.read().as_ref() {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                return Ok(cached.value.clone());
            }
        }

        let raw = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", vec![])
            .await?;
        let entries = raw
            .as_array()
            .ok_or_else(|| ExchangeError::MalformedResponse("positionRisk".to_string()))?;

        let positions: Vec<PositionInfo> =
            entries.iter().filter_map(Self::parse_position).collect();

        self.trailing_pass(&positions).await;

        *self.positions_cache.write() =
            Some(Cached { value: positions.clone(), fetched_at: Instant::now() });
        Ok(positions)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let result = self
            .signed_request(
                reqwest::Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // "No need to change" is success.
            Err(ExchangeError::OrderRejected(msg)) if msg.contains("No need to change") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn set_margin_type_isolated(&self, symbol: &str) -> Result<(), ExchangeError> {
        let result = self
            .signed_request(
                reqwest::Method::POST,
                "/fapi/v1/marginType",
                vec![
                    ("symbol", symbol.to_string()),
                    ("marginType", "ISOLATED".to_string()),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(ExchangeError::OrderRejected(msg)) if msg.contains("No need to change") => Ok(()),
            Err(ExchangeError::OrderRejected(msg))
                if msg.contains("-4168") || msg.contains("Multi-Assets") =>
            {
                // Multi-asset accounts cannot switch margin type per symbol.
                warn!(symbol, "multi-asset mode active, skipping margin-type change");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn open_long(
        &self,
        symbol: &str,
        quantity: Decimal,
        leverage: u32,
    ) -> Result<OrderAck, ExchangeError> {
        self.open_position(symbol, PositionSide::Long, quantity, leverage).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: Decimal,
        leverage: u32,
    ) -> Result<OrderAck, ExchangeError> {
        self.open_position(symbol, PositionSide::Short, quantity, leverage).await
    }

    async fn close_long(&self, symbol: &str, quantity: Decimal) -> Result<OrderAck, ExchangeError> {
        self.close_position(symbol, PositionSide::Long, quantity).await
    }

    async fn close_short(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<OrderAck, ExchangeError> {
        self.close_position(symbol, PositionSide::Short, quantity).await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<(), ExchangeError> {
        let filters = self.filters(symbol).await?;
        let quantity_str = precision::format_quantity(quantity.abs(), filters);
        let price_str = precision::format_price(price, filters);
        self.place_stop_order(symbol, side, &quantity_str, &price_str, false).await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<(), ExchangeError> {
        let filters = self.filters(symbol).await?;
        let quantity_str = precision::format_quantity(quantity.abs(), filters);
        let price_str = precision::format_price(price, filters);
        self.place_stop_order(symbol, side, &quantity_str, &price_str, true).await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: PositionSide,
        price: Decimal,
        quantity: Decimal,
        leverage: u32,
    ) -> Result<OrderAck, ExchangeError> {
        self.check_local_cooldown(symbol)?;

        if let Err(err) = self.cancel_all_orders(symbol).await {
            debug!(symbol, error = %err, "no resting orders to cancel before limit order");
        }
        self.set_leverage(symbol, leverage).await?;
        self.set_margin_type_isolated(symbol).await?;

        let filters = self.filters(symbol).await?;
        let quantity_str = precision::format_quantity(quantity, filters);
        let price_str = precision::format_price(price, filters);

        let notional = precision::notional_f64(quantity, price);
        if notional < perppilot_core::constants::MIN_NOTIONAL_USDT {
            return Err(ExchangeError::OrderRejected(format!(
                "notional {notional:.2} USDT below the venue minimum"
            )));
        }

        let (order_side, position_side) = match side {
            PositionSide::Long => ("BUY", "LONG"),
            PositionSide::Short => ("SELL", "SHORT"),
        };
        let response = self
            .signed_request(
                reqwest::Method::POST,
                "/fapi/v1/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("side", order_side.to_string()),
                    ("positionSide", position_side.to_string()),
                    ("type", "LIMIT".to_string()),
                    ("timeInForce", "GTC".to_string()),
                    ("quantity", quantity_str),
                    ("price", price_str),
                ],
            )
            .await?;
        self.invalidate_caches();

        Ok(OrderAck {
            order_id: response.get("orderId").and_then(Value::as_i64).unwrap_or(0),
            symbol: symbol.to_string(),
            status: VenueOrderStatus::New,
            realized_pnl: None,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError> {
        self.signed_request(
            reqwest::Method::DELETE,
            "/fapi/v1/order",
            vec![
                ("symbol", symbol.to_string()),
                ("orderId", order_id.to_string()),
            ],
        )
        .await?;
        self.invalidate_caches();
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        self.signed_request(
            reqwest::Method::DELETE,
            "/fapi/v1/allOpenOrders",
            vec![("symbol", symbol.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn order_status(
        &self,
        symbol: &str,
        order_id: i64,
    ) -> Result<OrderStatusInfo, ExchangeError> {
        let response = self
            .signed_request(
                reqwest::Method::GET,
                "/fapi/v1/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;

        Ok(OrderStatusInfo {
            order_id,
            status: parse_order_status(response.get("status").and_then(Value::as_str)),
            executed_qty: decimal_field(&response, "executedQty").unwrap_or_default(),
            avg_price: decimal_field(&response, "avgPrice").unwrap_or_default(),
        })
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrderInfo>, ExchangeError> {
        let response = self
            .signed_request(
                reqwest::Method::GET,
                "/fapi/v1/openOrders",
                vec![("symbol", symbol.to_string())],
            )
            .await?;

        let entries = response
            .as_array()
            .ok_or_else(|| ExchangeError::MalformedResponse("openOrders".to_string()))?;

        Ok(entries
            .iter()
            .filter_map(|o| {
                let side = match o.get("positionSide").and_then(Value::as_str) {
                    Some("LONG") => PositionSide::Long,
                    Some("SHORT") => PositionSide::Short,
                    _ => return None,
                };
                Some(OpenOrderInfo {
                    order_id: o.get("orderId").and_then(Value::as_i64)?,
                    order_type: o.get("type").and_then(Value::as_str)?.to_string(),
                    side,
                    stop_price: decimal_field(o, "stopPrice").unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn market_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let response = self
            .public_request(&format!("/fapi/v1/ticker/price?symbol={symbol}"))
            .await?;
        decimal_field(&response, "price")
            .ok_or_else(|| ExchangeError::MalformedResponse("ticker price".to_string()))
    }

    async fn format_quantity(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<String, ExchangeError> {
        let filters = self.filters(symbol).await?;
        Ok(precision::format_quantity(quantity, filters))
    }

    async fn format_price(&self, symbol: &str, price: Decimal) -> Result<String, ExchangeError> {
        let filters = self.filters(symbol).await?;
        Ok(precision::format_price(price, filters))
    }
}

fn protective_sides(side: PositionSide) -> (&'static str, &'static str) {
    match side {
        PositionSide::Long => ("SELL", "LONG"),
        PositionSide::Short => ("BUY", "SHORT"),
    }
}

fn parse_order_status(status: Option<&str>) -> VenueOrderStatus {
    match status {
        Some("NEW") => VenueOrderStatus::New,
        Some("PARTIALLY_FILLED") => VenueOrderStatus::PartiallyFilled,
        Some("FILLED") => VenueOrderStatus::Filled,
        Some("CANCELED") => VenueOrderStatus::Canceled,
        Some("EXPIRED") => VenueOrderStatus::Expired,
        _ => VenueOrderStatus::Unknown,
    }
}

fn decimal_field(value: &Value, key: &str) -> Option<Decimal> {
    match value.get(key)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => Decimal::try_from(n.as_f64()?).ok(),
        _ => None,
    }
}

fn position_update_time(entry: &Value) -> Option<DateTime<Utc>> {
    entry
        .get("updateTime")
        .and_then(Value::as_i64)
        .filter(|ms| *ms > 0)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_long_and_short_positions() {
        let long = json!({
            "symbol": "BTCUSDT",
            "positionAmt": "0.100",
            "entryPrice": "100000.0",
            "markPrice": "107000.0",
            "unRealizedProfit": "700.0",
            "liquidationPrice": "85000.0",
            "leverage": "6",
            "updateTime": 1_700_000_000_000_i64
        });
        let pos = BinanceFuturesTrader::parse_position(&long).unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.leverage, 6);
        // 7% price move at 6x = 42% on margin.
        assert!((pos.unrealized_pnl_pct - 42.0).abs() < 1e-6);
        assert!(pos.open_time.is_some());

        let short = json!({
            "symbol": "ETHUSDT",
            "positionAmt": "-2.0",
            "entryPrice": "4000.0",
            "markPrice": "3900.0",
            "unRealizedProfit": "200.0",
            "liquidationPrice": "4600.0",
            "leverage": "5"
        });
        let pos = BinanceFuturesTrader::parse_position(&short).unwrap();
        assert_eq!(pos.side, PositionSide::Short);
        assert_eq!(pos.quantity, Decimal::from(2));
        assert!(pos.unrealized_pnl_pct > 0.0);
    }

    #[test]
    fn flat_entries_are_skipped() {
        let flat = json!({
            "symbol": "BTCUSDT",
            "positionAmt": "0",
            "entryPrice": "0.0",
            "markPrice": "100000.0",
            "unRealizedProfit": "0",
            "leverage": "10"
        });
        assert!(BinanceFuturesTrader::parse_position(&flat).is_none());
    }

    #[test]
    fn order_status_strings_map_to_enum() {
        assert_eq!(parse_order_status(Some("NEW")), VenueOrderStatus::New);
        assert_eq!(
            parse_order_status(Some("PARTIALLY_FILLED")),
            VenueOrderStatus::PartiallyFilled
        );
        assert_eq!(parse_order_status(Some("FILLED")), VenueOrderStatus::Filled);
        assert_eq!(parse_order_status(Some("WEIRD")), VenueOrderStatus::Unknown);
        assert!(VenueOrderStatus::Filled.is_terminal());
        assert!(!VenueOrderStatus::New.is_terminal());
    }

    #[test]
    fn signature_is_stable_hex() {
        let trader = BinanceFuturesTrader::with_base_url(
            "key".to_string(),
            "secret".to_string(),
            "http://localhost".to_string(),
        );
        let sig = trader.sign("symbol=BTCUSDT&timestamp=1700000000000");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        // Same input, same signature.
        assert_eq!(sig, trader.sign("symbol=BTCUSDT&timestamp=1700000000000"));
    }
}
