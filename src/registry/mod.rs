//! Concurrent keyed stores, one per entity type
//!
//! Each registry keeps entities in an append-only slot list and maps the
//! natural key to a slot index. The index lock is always taken before the
//! list lock. Callers only ever receive clones.

use crate::analysis::Analysis;
use crate::models::{
    Asset, AssetKey, Market, Order, OrderBook, OrderKey, PairKey, Trade,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Recent trades kept per pair
pub const TRADE_WINDOW: usize = 50;

/// Entity with a natural key
pub trait Keyed: Clone {
    type Key: Eq + Hash + Clone;

    fn key(&self) -> Self::Key;
}

impl Keyed for Market {
    type Key = PairKey;

    fn key(&self) -> PairKey {
        Market::key(self)
    }
}

impl Keyed for Order {
    type Key = OrderKey;

    fn key(&self) -> OrderKey {
        Order::key(self)
    }
}

impl Keyed for Asset {
    type Key = AssetKey;

    fn key(&self) -> AssetKey {
        Asset::key(self)
    }
}

impl Keyed for OrderBook {
    type Key = PairKey;

    fn key(&self) -> PairKey {
        OrderBook::key(self)
    }
}

impl Keyed for TradeWindow {
    type Key = PairKey;

    fn key(&self) -> PairKey {
        PairKey::new(&self.pair, &self.exchange)
    }
}

impl Keyed for Analysis {
    type Key = PairKey;

    fn key(&self) -> PairKey {
        PairKey::new(&self.pair, &self.exchange)
    }
}

// Every write swaps in a fully built entity, so a poisoned lock never guards a torn value.
fn read<U>(lock: &RwLock<U>) -> RwLockReadGuard<'_, U> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<U>(lock: &RwLock<U>) -> RwLockWriteGuard<'_, U> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe keyed store
pub struct Registry<T: Keyed> {
    index: Arc<RwLock<HashMap<T::Key, usize>>>,
    slots: Arc<RwLock<Vec<T>>>,
}

impl<T: Keyed> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            index: Arc::clone(&self.index),
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T: Keyed> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Keyed> Registry<T> {
    pub fn new() -> Self {
        Self {
            index: Arc::new(RwLock::new(HashMap::new())),
            slots: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Copy of the entity stored under `key`
    pub fn get(&self, key: &T::Key) -> Option<T> {
        let index = read(&self.index);
        let slot = *index.get(key)?;
        let slots = read(&self.slots);
        slots.get(slot).cloned()
    }

    /// Insert under a new key or replace in place
    ///
    /// Returns `true` when the key was unseen.
    pub fn upsert(&self, entity: T) -> bool {
        let key = entity.key();
        let mut index = write(&self.index);
        let mut slots = write(&self.slots);

        match index.get(&key) {
            Some(&slot) => {
                slots[slot] = entity;
                false
            }
            None => {
                slots.push(entity);
                index.insert(key, slots.len() - 1);
                true
            }
        }
    }

    /// Atomic read-modify-write of an existing entity
    ///
    /// `f` runs on a copy that replaces the stored entity once `f` returns,
    /// all while the list write lock is held. Returns `None` for an unseen key.
    pub fn update<R>(&self, key: &T::Key, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let index = read(&self.index);
        let slot = *index.get(key)?;
        let mut slots = write(&self.slots);

        let mut next = slots.get(slot)?.clone();
        let result = f(&mut next);
        slots[slot] = next;
        Some(result)
    }

    /// Get-or-insert, then mutate, under both write locks
    pub fn upsert_with(&self, key: T::Key, init: impl FnOnce() -> T, f: impl FnOnce(&mut T)) -> T {
        let mut index = write(&self.index);
        let mut slots = write(&self.slots);

        let slot = match index.get(&key) {
            Some(&slot) => slot,
            None => {
                slots.push(init());
                index.insert(key, slots.len() - 1);
                slots.len() - 1
            }
        };

        let mut next = slots[slot].clone();
        f(&mut next);
        slots[slot] = next.clone();
        next
    }

    /// Point-in-time copy of every entity
    pub fn snapshot(&self) -> Vec<T> {
        read(&self.slots).clone()
    }

    pub fn len(&self) -> usize {
        read(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded list of the latest trades for a pair, oldest first
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TradeWindow {
    pub pair: String,
    pub exchange: String,
    pub trades: VecDeque<Trade>,
}

impl TradeWindow {
    pub fn new(key: &PairKey) -> Self {
        Self {
            pair: key.pair.clone(),
            exchange: key.exchange.clone(),
            trades: VecDeque::with_capacity(TRADE_WINDOW),
        }
    }

    pub fn push(&mut self, trade: Trade) {
        self.trades.push_back(trade);
        while self.trades.len() > TRADE_WINDOW {
            self.trades.pop_front();
        }
    }
}

/// One registry per entity type, shared by every component
#[derive(Clone, Default)]
pub struct Registries {
    pub markets: Registry<Market>,
    pub orders: Registry<Order>,
    pub assets: Registry<Asset>,
    pub order_books: Registry<OrderBook>,
    pub trades: Registry<TradeWindow>,
    pub analyses: Registry<Analysis>,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enabled markets of one exchange
    pub fn enabled_markets(&self, exchange: &str) -> Vec<Market> {
        self.markets
            .snapshot()
            .into_iter()
            .filter(|m| m.is_enabled() && m.exchange.eq_ignore_ascii_case(exchange))
            .collect()
    }

    pub fn record_trade(&self, trade: Trade) {
        let key = PairKey::new(&trade.pair, &trade.exchange);
        self.trades
            .upsert_with(key.clone(), || TradeWindow::new(&key), |window| window.push(trade));
    }

    pub fn clear_trades(&self, key: &PairKey) {
        self.trades.update(key, |window| window.trades.clear());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, Side};
    use chrono::Utc;

    fn create_test_market(pair: &str, close: f64) -> Market {
        let mut market = Market::new(pair, "binance", "BTC", "USDT");
        market.close = close;
        market
    }

    fn create_test_trade(id: u64) -> Trade {
        Trade {
            pair: "BTCUSDT".to_string(),
            exchange: "binance".to_string(),
            side: Side::Buy,
            price: 100.0 + id as f64,
            quantity: 1.0,
            trade_id: id,
            trade_time: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_then_get() {
        let registry = Registry::new();
        let market = create_test_market("BTCUSDT", 100.0);

        assert!(registry.upsert(market.clone()));
        assert_eq!(registry.get(&market.key()), Some(market));
    }

    #[test]
    fn test_upsert_replaces_without_duplicating() {
        let registry = Registry::new();
        registry.upsert(create_test_market("BTCUSDT", 100.0));
        let inserted = registry.upsert(create_test_market("BTCUSDT", 105.0));

        assert!(!inserted);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get(&PairKey::new("BTCUSDT", "binance")).unwrap().close,
            105.0
        );
    }

    #[test]
    fn test_get_missing() {
        let registry: Registry<Market> = Registry::new();
        assert!(registry.get(&PairKey::new("ETHUSDT", "binance")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_readers_get_copies() {
        let registry = Registry::new();
        registry.upsert(create_test_market("BTCUSDT", 100.0));

        let mut copy = registry.get(&PairKey::new("BTCUSDT", "binance")).unwrap();
        copy.close = 1.0;

        assert_eq!(registry.snapshot()[0].close, 100.0);
    }

    #[test]
    fn test_update_is_check_and_set() {
        let registry = Registry::new();
        let order = Order {
            order_id: 7,
            pair: "BTCUSDT".to_string(),
            exchange: "binance".to_string(),
            side: Side::Buy,
            status: OrderStatus::Filled,
            price: 100.0,
            quantity: 1.0,
            total: 100.0,
            stoploss: 1.0,
            takeprofit: 0.0,
            ref_enabled: true,
            ref_side: None,
            ref_tripped: None,
            ref_order_id: 0,
            auto_repeat: 0,
            auto_repeat_id: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        registry.upsert(order.clone());

        let trip = |o: &mut Order| {
            if o.ref_tripped.is_some() {
                return false;
            }
            o.ref_tripped = Some("tripped".to_string());
            true
        };

        assert_eq!(registry.update(&order.key(), trip), Some(true));
        assert_eq!(registry.update(&order.key(), trip), Some(false));
        assert_eq!(registry.update(&OrderKey::new(8, "binance"), trip), None);
    }

    #[test]
    fn test_trade_window_is_bounded() {
        let registries = Registries::new();
        for id in 0..60 {
            registries.record_trade(create_test_trade(id));
        }

        let window = registries.trades.get(&PairKey::new("BTCUSDT", "binance")).unwrap();
        assert_eq!(window.trades.len(), TRADE_WINDOW);
        assert_eq!(window.trades.front().unwrap().trade_id, 10);
        assert_eq!(window.trades.back().unwrap().trade_id, 59);

        registries.clear_trades(&PairKey::new("BTCUSDT", "binance"));
        let window = registries.trades.get(&PairKey::new("BTCUSDT", "binance")).unwrap();
        assert!(window.trades.is_empty());
    }

    #[test]
    fn test_enabled_markets() {
        let registries = Registries::new();
        registries.markets.upsert(create_test_market("BTCUSDT", 1.0));
        let mut disabled = create_test_market("ETHUSDT", 1.0);
        disabled.status = crate::models::Status::Disabled;
        registries.markets.upsert(disabled);

        let enabled = registries.enabled_markets("BINANCE");
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].pair, "BTCUSDT");
    }

    #[test]
    fn test_concurrent_upserts() {
        use std::thread;

        let registry = Registry::new();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        registry.upsert(create_test_market(&format!("P{}USDT", i), t as f64));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 50);
    }
}
