//! Per-tick reconciliation of resting limit orders against the venue.
//!
//! A fill registers the open with the constraints and installs the
//! protective stop/take-profit; a partial fill cancels the remainder and
//! protects the filled slice; terminal orders are dropped from the store.

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::constraints::TradingConstraints;
use crate::order_manager::OrderManager;
use perppilot_core::types::PositionSide;
use perppilot_exchange::{Trader, VenueOrderStatus};

/// What the reconciliation pass did for one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    Filled { symbol: String, side: PositionSide },
    PartiallyFilled { symbol: String, side: PositionSide },
    /// Fill violated the one-position-per-side rule and was flattened.
    EmergencyClosed { symbol: String, side: PositionSide },
    Removed { symbol: String, status: VenueOrderStatus },
}

pub struct OrderReconciler<'a> {
    pub trader: &'a dyn Trader,
    pub orders: &'a OrderManager,
    pub constraints: &'a TradingConstraints,
    pub single_position_per_side: bool,
}

impl OrderReconciler<'_> {
    /// Walks every tracked order and resolves its venue state.
    pub async fn run(&self) -> Vec<ReconcileEvent> {
        let mut events = Vec::new();

        for order in self.orders.all() {
            let status = match self.trader.order_status(&order.symbol, order.order_id).await {
                Ok(status) => status,
                Err(err) => {
                    warn!(symbol = %order.symbol, order_id = order.order_id, error = %err,
                        "order status query failed, leaving order in place");
                    continue;
                }
            };

            match status.status {
                VenueOrderStatus::Filled => {
                    info!(symbol = %order.symbol, order_id = order.order_id, "limit order filled");
                    if self.guard_single_side(&order.symbol, order.side).await {
                        events.push(ReconcileEvent::EmergencyClosed {
                            symbol: order.symbol.clone(),
                            side: order.side,
                        });
                    } else {
                        self.register_fill(&order.symbol, order.side, order.quantity, order.stop_loss, order.take_profit)
                            .await;
                        events.push(ReconcileEvent::Filled {
                            symbol: order.symbol.clone(),
                            side: order.side,
                        });
                    }
                    let _ = self.orders.remove(&order.symbol);
                }
                VenueOrderStatus::PartiallyFilled => {
                    warn!(
                        symbol = %order.symbol,
                        executed = %status.executed_qty,
                        total = %order.quantity,
                        "limit order partially filled, canceling remainder"
                    );
                    if let Err(err) =
                        self.trader.cancel_order(&order.symbol, order.order_id).await
                    {
                        warn!(symbol = %order.symbol, error = %err, "failed to cancel remainder");
                    }

                    if self.guard_single_side(&order.symbol, order.side).await {
                        events.push(ReconcileEvent::EmergencyClosed {
                            symbol: order.symbol.clone(),
                            side: order.side,
                        });
                    } else {
                        self.register_fill(
                            &order.symbol,
                            order.side,
                            status.executed_qty,
                            order.stop_loss,
                            order.take_profit,
                        )
                        .await;
                        events.push(ReconcileEvent::PartiallyFilled {
                            symbol: order.symbol.clone(),
                            side: order.side,
                        });
                    }
                    let _ = self.orders.remove(&order.symbol);
                }
                VenueOrderStatus::Canceled | VenueOrderStatus::Expired => {
                    info!(symbol = %order.symbol, status = ?status.status, "limit order terminal, dropping");
                    let _ = self.orders.remove(&order.symbol);
                    events.push(ReconcileEvent::Removed {
                        symbol: order.symbol.clone(),
                        status: status.status,
                    });
                }
                VenueOrderStatus::New | VenueOrderStatus::Unknown => {}
            }
        }

        events
    }

    /// Registers the open with the constraint machine and installs the
    /// protective orders for the filled quantity.
    async fn register_fill(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        stop_loss: f64,
        take_profit: f64,
    ) {
        self.constraints.record_open_position(symbol, side);

        let stop = Decimal::try_from(stop_loss).unwrap_or_default();
        let tp = Decimal::try_from(take_profit).unwrap_or_default();
        if let Err(err) = self.trader.set_stop_loss(symbol, side, quantity, stop).await {
            error!(
                symbol,
                side = side.as_str(),
                error = %err,
                unprotected_position = true,
                "stop-loss placement failed after fill"
            );
        }
        if let Err(err) = self.trader.set_take_profit(symbol, side, quantity, tp).await {
            warn!(symbol, side = side.as_str(), error = %err, "take-profit placement failed");
        }
    }

    /// Returns true (and flattens the fill) when a second same-side
    /// position would violate the single-position-per-side rule.
    async fn guard_single_side(&self, symbol: &str, side: PositionSide) -> bool {
        if !self.single_position_per_side {
            return false;
        }
        let Ok(positions) = self.trader.positions().await else {
            return false;
        };
        let conflict = positions
            .iter()
            .any(|p| p.symbol != symbol && p.side == side);
        if !conflict {
            return false;
        }

        warn!(
            symbol,
            side = side.as_str(),
            "fill violates single-position-per-side, emergency closing"
        );
        let result = match side {
            PositionSide::Long => self.trader.close_long(symbol, Decimal::ZERO).await,
            PositionSide::Short => self.trader.close_short(symbol, Decimal::ZERO).await,
        };
        if let Err(err) = result {
            error!(symbol, error = %err, "emergency close failed");
        }
        true
    }
}
