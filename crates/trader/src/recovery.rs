//! Startup recovery: re-install protective orders for positions whose
//! limit order filled while the process was down, and reap store entries
//! whose venue status went terminal.

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::order_manager::OrderManager;
use perppilot_exchange::{Trader, VenueOrderStatus};

/// For every held position without a venue-side stop order, recovers the
/// stop/take-profit from the matching persisted limit order. Positions with
/// no matching record are logged for human action. Returns the number of
/// recovered positions.
pub async fn recover_missing_stop_loss(
    trader: &dyn Trader,
    orders: &OrderManager,
) -> anyhow::Result<usize> {
    let positions = trader.positions().await?;
    let mut recovered = 0usize;

    for position in &positions {
        let open_orders = match trader.open_orders(&position.symbol).await {
            Ok(orders) => orders,
            Err(err) => {
                warn!(symbol = %position.symbol, error = %err, "cannot query open orders");
                continue;
            }
        };
        let has_protection = open_orders.iter().any(|o| o.is_protective() && o.side == position.side);
        if has_protection {
            continue;
        }

        let Some(record) = orders.get(&position.symbol) else {
            warn!(
                symbol = %position.symbol,
                side = position.side.as_str(),
                "position has no venue stop and no persisted order; set protection manually"
            );
            continue;
        };

        info!(
            symbol = %position.symbol,
            stop = record.stop_loss,
            take_profit = record.take_profit,
            "re-installing protection from the persisted order"
        );

        let stop = Decimal::try_from(record.stop_loss).unwrap_or_default();
        let tp = Decimal::try_from(record.take_profit).unwrap_or_default();
        if let Err(err) = trader
            .set_stop_loss(&position.symbol, position.side, position.quantity, stop)
            .await
        {
            warn!(symbol = %position.symbol, error = %err, "stop-loss recovery failed");
            continue;
        }
        if let Err(err) = trader
            .set_take_profit(&position.symbol, position.side, position.quantity, tp)
            .await
        {
            warn!(symbol = %position.symbol, error = %err, "take-profit recovery failed");
        }

        let _ = orders.remove(&position.symbol);
        recovered += 1;
    }

    if recovered > 0 {
        info!(recovered, "protective orders re-installed");
    }
    Ok(recovered)
}

/// Drops persisted orders whose venue status is terminal (filled orders are
/// left to [`recover_missing_stop_loss`] first, then reconciliation).
pub async fn reap_terminal_orders(trader: &dyn Trader, orders: &OrderManager) -> usize {
    let mut reaped = 0usize;
    for order in orders.all() {
        match trader.order_status(&order.symbol, order.order_id).await {
            Ok(status)
                if matches!(
                    status.status,
                    VenueOrderStatus::Canceled | VenueOrderStatus::Expired
                ) =>
            {
                info!(symbol = %order.symbol, status = ?status.status, "reaping terminal order");
                let _ = orders.remove(&order.symbol);
                reaped += 1;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(symbol = %order.symbol, error = %err, "status check failed during reap");
            }
        }
    }
    reaped
}
