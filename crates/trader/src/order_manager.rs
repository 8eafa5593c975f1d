//! Limit-order manager: one outstanding order per symbol, persisted
//! atomically on every mutation so fills can be recovered after a restart.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use perppilot_core::types::{Direction, PositionSide};
use perppilot_exchange::VenueOrderStatus;

/// Price deviation that forces a replace, percent.
const REPLACE_PRICE_DEVIATION_PCT: f64 = 1.0;

#[derive(Error, Debug)]
pub enum OrderStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A tracked limit order with its protective levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedOrder {
    pub order_id: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub price: f64,
    pub quantity: Decimal,
    pub leverage: u32,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub status: VenueOrderStatus,
    #[serde(default)]
    pub filled_qty: Decimal,
    /// The prediction direction that motivated this order.
    pub ai_direction: Direction,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    #[serde(default)]
    pub reasoning: String,
}

pub struct OrderManager {
    path: PathBuf,
    orders: Mutex<HashMap<String, ManagedOrder>>,
}

impl OrderManager {
    /// Opens the store, loading any persisted orders. A corrupt file is
    /// logged and treated as empty.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, OrderStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join("active_orders.json");

        let orders = match fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<HashMap<String, ManagedOrder>>(&data) {
                Ok(orders) => {
                    info!(count = orders.len(), "loaded persisted limit orders");
                    orders
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "corrupt order store, starting empty");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self { path, orders: Mutex::new(orders) })
    }

    fn persist(&self, orders: &HashMap<String, ManagedOrder>) -> Result<(), OrderStoreError> {
        let data = serde_json::to_vec_pretty(orders)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Inserts (or replaces) the symbol's order and persists.
    pub fn add(&self, order: ManagedOrder) -> Result<(), OrderStoreError> {
        let mut orders = self.orders.lock();
        debug!(symbol = %order.symbol, order_id = order.order_id, price = order.price, "tracking limit order");
        orders.insert(order.symbol.clone(), order);
        self.persist(&orders)
    }

    /// Removes the symbol's order and persists.
    pub fn remove(&self, symbol: &str) -> Result<Option<ManagedOrder>, OrderStoreError> {
        let mut orders = self.orders.lock();
        let removed = orders.remove(symbol);
        if removed.is_some() {
            self.persist(&orders)?;
        }
        Ok(removed)
    }

    /// Updates venue-reported status fields and persists.
    pub fn update_status(
        &self,
        symbol: &str,
        status: VenueOrderStatus,
        filled_qty: Decimal,
    ) -> Result<(), OrderStoreError> {
        let mut orders = self.orders.lock();
        if let Some(order) = orders.get_mut(symbol) {
            order.status = status;
            order.filled_qty = filled_qty;
            order.update_time = Utc::now();
            self.persist(&orders)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<ManagedOrder> {
        self.orders.lock().get(symbol).cloned()
    }

    #[must_use]
    pub fn has_order(&self, symbol: &str) -> bool {
        self.orders.lock().contains_key(symbol)
    }

    #[must_use]
    pub fn all(&self) -> Vec<ManagedOrder> {
        self.orders.lock().values().cloned().collect()
    }

    /// Whether the resting order should be replaced: the intended direction
    /// flipped, or the target price drifted more than 1%.
    #[must_use]
    pub fn should_update_price(
        &self,
        symbol: &str,
        new_price: f64,
        direction: Direction,
    ) -> Option<String> {
        let orders = self.orders.lock();
        let order = orders.get(symbol)?;

        if order.ai_direction != direction {
            return Some(format!(
                "direction changed: {} -> {}",
                order.ai_direction.as_str(),
                direction.as_str()
            ));
        }

        if order.price > 0.0 {
            let deviation_pct = (new_price - order.price) / order.price * 100.0;
            if deviation_pct.abs() > REPLACE_PRICE_DEVIATION_PCT {
                return Some(format!(
                    "price drifted {deviation_pct:+.2}% from the resting order"
                ));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn order(symbol: &str, price: f64, direction: Direction) -> ManagedOrder {
        ManagedOrder {
            order_id: 42,
            symbol: symbol.to_string(),
            side: if direction == Direction::Up { PositionSide::Long } else { PositionSide::Short },
            price,
            quantity: dec!(0.5),
            leverage: 5,
            stop_loss: price * 0.98,
            take_profit: price * 1.04,
            status: VenueOrderStatus::New,
            filled_qty: Decimal::ZERO,
            ai_direction: direction,
            create_time: Utc::now(),
            update_time: Utc::now(),
            reasoning: String::new(),
        }
    }

    #[test]
    fn every_mutation_is_persisted() {
        let dir = TempDir::new().unwrap();
        let manager = OrderManager::open(dir.path()).unwrap();
        manager.add(order("ETHUSDT", 2000.0, Direction::Up)).unwrap();

        // A fresh manager over the same directory sees the order.
        let reloaded = OrderManager::open(dir.path()).unwrap();
        assert!(reloaded.has_order("ETHUSDT"));

        reloaded.remove("ETHUSDT").unwrap();
        let reloaded2 = OrderManager::open(dir.path()).unwrap();
        assert!(!reloaded2.has_order("ETHUSDT"));
    }

    #[test]
    fn status_updates_survive_reload() {
        let dir = TempDir::new().unwrap();
        let manager = OrderManager::open(dir.path()).unwrap();
        manager.add(order("ETHUSDT", 2000.0, Direction::Up)).unwrap();
        manager
            .update_status("ETHUSDT", VenueOrderStatus::PartiallyFilled, dec!(0.2))
            .unwrap();

        let reloaded = OrderManager::open(dir.path()).unwrap();
        let order = reloaded.get("ETHUSDT").unwrap();
        assert_eq!(order.status, VenueOrderStatus::PartiallyFilled);
        assert_eq!(order.filled_qty, dec!(0.2));
    }

    #[test]
    fn replace_on_direction_flip() {
        let dir = TempDir::new().unwrap();
        let manager = OrderManager::open(dir.path()).unwrap();
        manager.add(order("ETHUSDT", 2000.0, Direction::Up)).unwrap();

        let reason = manager
            .should_update_price("ETHUSDT", 2001.0, Direction::Down)
            .unwrap();
        assert!(reason.contains("direction changed"));
    }

    #[test]
    fn replace_on_price_drift_over_one_percent() {
        let dir = TempDir::new().unwrap();
        let manager = OrderManager::open(dir.path()).unwrap();
        manager.add(order("ETHUSDT", 2000.0, Direction::Up)).unwrap();

        assert!(manager.should_update_price("ETHUSDT", 2010.0, Direction::Up).is_none());
        assert!(manager.should_update_price("ETHUSDT", 2021.0, Direction::Up).is_some());
        assert!(manager.should_update_price("ETHUSDT", 1979.0, Direction::Up).is_some());
    }

    #[test]
    fn second_add_for_a_symbol_wins() {
        // Two replace decisions in one tick: the store holds exactly one
        // order and the file reflects the last write.
        let dir = TempDir::new().unwrap();
        let manager = OrderManager::open(dir.path()).unwrap();
        manager.add(order("ETHUSDT", 2000.0, Direction::Up)).unwrap();
        let mut second = order("ETHUSDT", 1990.0, Direction::Up);
        second.order_id = 43;
        manager.add(second).unwrap();

        let reloaded = OrderManager::open(dir.path()).unwrap();
        assert_eq!(reloaded.all().len(), 1);
        let survivor = reloaded.get("ETHUSDT").unwrap();
        assert_eq!(survivor.order_id, 43);
        assert!((survivor.price - 1990.0).abs() < 1e-9);
    }

    #[test]
    fn no_replace_hint_for_unknown_symbol() {
        let dir = TempDir::new().unwrap();
        let manager = OrderManager::open(dir.path()).unwrap();
        assert!(manager.should_update_price("SOLUSDT", 100.0, Direction::Up).is_none());
    }
}
