//! In-memory trader for paper trading and tests.
//!
//! Market orders fill instantly at the configured mark price; limit orders
//! rest until a test (or the paper loop) fills them via [`MockTrader::fill_limit_order`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::precision::{self, SymbolFilters};
use crate::{
    AccountBalance, ExchangeError, OpenOrderInfo, OrderAck, OrderStatusInfo, Trader,
    VenueOrderStatus,
};
use perppilot_core::types::{PositionInfo, PositionSide};

#[derive(Debug, Clone)]
struct RestingOrder {
    order_id: i64,
    symbol: String,
    side: PositionSide,
    price: Decimal,
    quantity: Decimal,
    executed_qty: Decimal,
    leverage: u32,
    status: VenueOrderStatus,
}

#[derive(Debug, Clone)]
struct ProtectiveOrder {
    order_id: i64,
    order_type: &'static str,
    side: PositionSide,
    stop_price: Decimal,
}

#[derive(Default)]
struct MockState {
    wallet: Decimal,
    positions: HashMap<(String, PositionSide), PositionInfo>,
    marks: HashMap<String, Decimal>,
    resting: HashMap<i64, RestingOrder>,
    protective: HashMap<String, Vec<ProtectiveOrder>>,
}

pub struct MockTrader {
    state: RwLock<MockState>,
    next_order_id: AtomicI64,
}

impl MockTrader {
    #[must_use]
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            state: RwLock::new(MockState { wallet: initial_balance, ..MockState::default() }),
            next_order_id: AtomicI64::new(1),
        }
    }

    fn next_id(&self) -> i64 {
        self.next_order_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sets the mark price used for fills and PnL.
    pub fn set_mark_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.write();
        state.marks.insert(symbol.to_string(), price);
        for ((sym, side), position) in state.positions.iter_mut() {
            if sym == symbol {
                position.mark_price = price;
                let diff = match side {
                    PositionSide::Long => price - position.entry_price,
                    PositionSide::Short => position.entry_price - price,
                };
                position.unrealized_pnl = diff * position.quantity;
                if position.entry_price > Decimal::ZERO {
                    let move_frac = (diff / position.entry_price).to_f64().unwrap_or(0.0);
                    position.unrealized_pnl_pct =
                        move_frac * f64::from(position.leverage) * 100.0;
                }
            }
        }
    }

    /// Fills `executed` of a resting limit order and marks it filled or
    /// partially filled, creating/extending the position.
    pub fn fill_limit_order(&self, order_id: i64, executed: Decimal) {
        let mut state = self.state.write();
        let Some(order) = state.resting.get_mut(&order_id) else {
            return;
        };
        order.executed_qty = executed.min(order.quantity);
        order.status = if order.executed_qty == order.quantity {
            VenueOrderStatus::Filled
        } else {
            VenueOrderStatus::PartiallyFilled
        };
        let order = order.clone();

        let key = (order.symbol.clone(), order.side);
        let position = PositionInfo {
            symbol: order.symbol.clone(),
            side: order.side,
            entry_price: order.price,
            mark_price: order.price,
            quantity: order.executed_qty,
            leverage: order.leverage,
            unrealized_pnl: Decimal::ZERO,
            unrealized_pnl_pct: 0.0,
            liquidation_price: Decimal::ZERO,
            margin_used: order.price * order.executed_qty / Decimal::from(order.leverage),
            open_time: Some(Utc::now()),
        };
        state.positions.insert(key, position);
    }

    /// Drops a position without a close order, simulating a venue-side stop
    /// or liquidation firing between ticks.
    pub fn force_remove_position(&self, symbol: &str, side: PositionSide) {
        let mut state = self.state.write();
        state.positions.remove(&(symbol.to_string(), side));
        state.protective.remove(symbol);
    }

    /// Removes all protective orders, simulating a missing venue-side stop.
    pub fn clear_protective_orders(&self, symbol: &str) {
        self.state.write().protective.remove(symbol);
    }

    fn mark(&self, symbol: &str) -> Decimal {
        self.state
            .read()
            .marks
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ONE_HUNDRED)
    }
}

#[async_trait]
impl Trader for MockTrader {
    async fn balance(&self) -> Result<AccountBalance, ExchangeError> {
        let state = self.state.read();
        let unrealized: Decimal = state.positions.values().map(|p| p.unrealized_pnl).sum();
        let margin: Decimal = state.positions.values().map(|p| p.margin_used).sum();
        Ok(AccountBalance {
            total_wallet_balance: state.wallet,
            available_balance: state.wallet - margin,
            total_unrealized_profit: unrealized,
        })
    }

    async fn positions(&self) -> Result<Vec<PositionInfo>, ExchangeError> {
        Ok(self.state.read().positions.values().cloned().collect())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn set_margin_type_isolated(&self, _symbol: &str) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn open_long(
        &self,
        symbol: &str,
        quantity: Decimal,
        leverage: u32,
    ) -> Result<OrderAck, ExchangeError> {
        let price = self.mark(symbol);
        let mut state = self.state.write();
        state.positions.insert(
            (symbol.to_string(), PositionSide::Long),
            PositionInfo {
                symbol: symbol.to_string(),
                side: PositionSide::Long,
                entry_price: price,
                mark_price: price,
                quantity,
                leverage,
                unrealized_pnl: Decimal::ZERO,
                unrealized_pnl_pct: 0.0,
                liquidation_price: Decimal::ZERO,
                margin_used: price * quantity / Decimal::from(leverage.max(1)),
                open_time: Some(Utc::now()),
            },
        );
        Ok(OrderAck {
            order_id: self.next_id(),
            symbol: symbol.to_string(),
            status: VenueOrderStatus::Filled,
            realized_pnl: None,
        })
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: Decimal,
        leverage: u32,
    ) -> Result<OrderAck, ExchangeError> {
        let price = self.mark(symbol);
        let mut state = self.state.write();
        state.positions.insert(
            (symbol.to_string(), PositionSide::Short),
            PositionInfo {
                symbol: symbol.to_string(),
                side: PositionSide::Short,
                entry_price: price,
                mark_price: price,
                quantity,
                leverage,
                unrealized_pnl: Decimal::ZERO,
                unrealized_pnl_pct: 0.0,
                liquidation_price: Decimal::ZERO,
                margin_used: price * quantity / Decimal::from(leverage.max(1)),
                open_time: Some(Utc::now()),
            },
        );
        Ok(OrderAck {
            order_id: self.next_id(),
            symbol: symbol.to_string(),
            status: VenueOrderStatus::Filled,
            realized_pnl: None,
        })
    }

    async fn close_long(&self, symbol: &str, quantity: Decimal) -> Result<OrderAck, ExchangeError> {
        close_mock_position(self, symbol, PositionSide::Long, quantity)
    }

    async fn close_short(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<OrderAck, ExchangeError> {
        close_mock_position(self, symbol, PositionSide::Short, quantity)
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        _quantity: Decimal,
        price: Decimal,
    ) -> Result<(), ExchangeError> {
        let order_id = self.next_id();
        self.state.write().protective.entry(symbol.to_string()).or_default().push(
            ProtectiveOrder { order_id, order_type: "STOP_MARKET", side, stop_price: price },
        );
        Ok(())
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        _quantity: Decimal,
        price: Decimal,
    ) -> Result<(), ExchangeError> {
        let order_id = self.next_id();
        self.state.write().protective.entry(symbol.to_string()).or_default().push(
            ProtectiveOrder {
                order_id,
                order_type: "TAKE_PROFIT_MARKET",
                side,
                stop_price: price,
            },
        );
        Ok(())
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: PositionSide,
        price: Decimal,
        quantity: Decimal,
        leverage: u32,
    ) -> Result<OrderAck, ExchangeError> {
        let order_id = self.next_id();
        self.state.write().resting.insert(
            order_id,
            RestingOrder {
                order_id,
                symbol: symbol.to_string(),
                side,
                price,
                quantity,
                executed_qty: Decimal::ZERO,
                leverage,
                status: VenueOrderStatus::New,
            },
        );
        Ok(OrderAck {
            order_id,
            symbol: symbol.to_string(),
            status: VenueOrderStatus::New,
            realized_pnl: None,
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: i64) -> Result<(), ExchangeError> {
        if let Some(order) = self.state.write().resting.get_mut(&order_id) {
            if !order.status.is_terminal() {
                order.status = VenueOrderStatus::Canceled;
            }
        }
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.write();
        state.protective.remove(symbol);
        for order in state.resting.values_mut() {
            if order.symbol == symbol && !order.status.is_terminal() {
                order.status = VenueOrderStatus::Canceled;
            }
        }
        Ok(())
    }

    async fn order_status(
        &self,
        _symbol: &str,
        order_id: i64,
    ) -> Result<OrderStatusInfo, ExchangeError> {
        let state = self.state.read();
        let order = state
            .resting
            .get(&order_id)
            .ok_or_else(|| ExchangeError::MalformedResponse(format!("unknown order {order_id}")))?;
        Ok(OrderStatusInfo {
            order_id,
            status: order.status,
            executed_qty: order.executed_qty,
            avg_price: order.price,
        })
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrderInfo>, ExchangeError> {
        let state = self.state.read();
        let mut orders: Vec<OpenOrderInfo> = state
            .protective
            .get(symbol)
            .map(|list| {
                list.iter()
                    .map(|p| OpenOrderInfo {
                        order_id: p.order_id,
                        order_type: p.order_type.to_string(),
                        side: p.side,
                        stop_price: p.stop_price,
                    })
                    .collect()
            })
            .unwrap_or_default();
        orders.extend(
            state
                .resting
                .values()
                .filter(|o| o.symbol == symbol && o.status == VenueOrderStatus::New)
                .map(|o| OpenOrderInfo {
                    order_id: o.order_id,
                    order_type: "LIMIT".to_string(),
                    side: o.side,
                    stop_price: Decimal::ZERO,
                }),
        );
        Ok(orders)
    }

    async fn market_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.mark(symbol))
    }

    async fn format_quantity(
        &self,
        _symbol: &str,
        quantity: Decimal,
    ) -> Result<String, ExchangeError> {
        Ok(precision::format_quantity(quantity, SymbolFilters::default()))
    }

    async fn format_price(&self, _symbol: &str, price: Decimal) -> Result<String, ExchangeError> {
        Ok(precision::format_price(price, SymbolFilters::default()))
    }
}

fn close_mock_position(
    trader: &MockTrader,
    symbol: &str,
    side: PositionSide,
    quantity: Decimal,
) -> Result<OrderAck, ExchangeError> {
    let mut state = trader.state.write();
    let key = (symbol.to_string(), side);
    let Some(position) = state.positions.get(&key).cloned() else {
        return Err(ExchangeError::NoPosition { symbol: symbol.to_string(), side });
    };

    let close_qty = if quantity.is_zero() { position.quantity } else { quantity.min(position.quantity) };
    let mark = state.marks.get(symbol).copied().unwrap_or(position.mark_price);
    let pnl = match side {
        PositionSide::Long => (mark - position.entry_price) * close_qty,
        PositionSide::Short => (position.entry_price - mark) * close_qty,
    };

    state.wallet += pnl;
    if close_qty >= position.quantity {
        state.positions.remove(&key);
    } else if let Some(p) = state.positions.get_mut(&key) {
        p.quantity -= close_qty;
    }
    state.protective.remove(symbol);

    Ok(OrderAck {
        order_id: trader.next_id(),
        symbol: symbol.to_string(),
        status: VenueOrderStatus::Filled,
        realized_pnl: Some(pnl),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn open_and_close_round_trip_updates_wallet() {
        let trader = MockTrader::new(dec!(1000));
        trader.set_mark_price("BTCUSDT", dec!(100));

        trader.open_long("BTCUSDT", dec!(1), 5).await.unwrap();
        trader.set_mark_price("BTCUSDT", dec!(110));

        let ack = trader.close_long("BTCUSDT", dec!(0)).await.unwrap();
        assert_eq!(ack.realized_pnl, Some(dec!(10)));

        let balance = trader.balance().await.unwrap();
        assert_eq!(balance.total_wallet_balance, dec!(1010));
        assert!(trader.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn limit_order_lifecycle() {
        let trader = MockTrader::new(dec!(1000));
        let ack = trader
            .place_limit_order("ETHUSDT", PositionSide::Long, dec!(2000), dec!(0.5), 5)
            .await
            .unwrap();

        let status = trader.order_status("ETHUSDT", ack.order_id).await.unwrap();
        assert_eq!(status.status, VenueOrderStatus::New);

        trader.fill_limit_order(ack.order_id, dec!(0.2));
        let status = trader.order_status("ETHUSDT", ack.order_id).await.unwrap();
        assert_eq!(status.status, VenueOrderStatus::PartiallyFilled);
        assert_eq!(status.executed_qty, dec!(0.2));

        let positions = trader.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(0.2));
    }

    #[tokio::test]
    async fn protective_orders_visible_until_cancelled() {
        let trader = MockTrader::new(dec!(1000));
        trader
            .set_stop_loss("BTCUSDT", PositionSide::Long, dec!(1), dec!(95))
            .await
            .unwrap();
        trader
            .set_take_profit("BTCUSDT", PositionSide::Long, dec!(1), dec!(120))
            .await
            .unwrap();

        let orders = trader.open_orders("BTCUSDT").await.unwrap();
        assert_eq!(orders.iter().filter(|o| o.is_protective()).count(), 2);

        trader.cancel_all_orders("BTCUSDT").await.unwrap();
        assert!(trader.open_orders("BTCUSDT").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_price_moves_unrealized_pnl() {
        let trader = MockTrader::new(dec!(1000));
        trader.set_mark_price("BTCUSDT", dec!(100));
        trader.open_short("BTCUSDT", dec!(2), 4).await.unwrap();
        trader.set_mark_price("BTCUSDT", dec!(90));

        let positions = trader.positions().await.unwrap();
        assert_eq!(positions[0].unrealized_pnl, dec!(20));
        assert!(positions[0].unrealized_pnl_pct > 0.0);
    }
}
