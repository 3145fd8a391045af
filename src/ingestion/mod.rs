//! Ingestion Coordinator
//!
//! One reconnecting stream task per feed kind turns exchange events into
//! registry upserts and fans out triggers to the downstream services.

pub mod feed;

use crate::analysis::KlineTick;
use crate::db::PostgresPersistence;
use crate::exchange::{ExchangeAdapter, ExecutionReport, FeedEvent, FeedKind};
use crate::execution::candle_buffer::CandleKey;
use crate::indicators::truncate;
use crate::models::{
    Asset, AssetKey, Candle, Market, Order, OrderBook, OrderKey, OrderStatus, PairKey, Status, Trade,
};
use crate::notify::NotificationSender;
use crate::persistence::{PersistRecord, PersistSender};
use crate::registry::Registries;
use serde::Deserialize;
use std::cell::Cell;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub use feed::{FeedTask, RestartHandle};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedConfig {
    /// Interval of the live kline stream
    pub kline_interval: String,
    pub reconnect_backoff_secs: u64,
    pub reconnect_jitter_secs: u64,
    pub keep_alive_secs: u64,
    pub trigger_capacity: usize,
    pub orderbook_capacity: usize,
    pub notification_capacity: usize,
    pub persist_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            kline_interval: "1m".to_string(),
            reconnect_backoff_secs: 10,
            reconnect_jitter_secs: 5,
            keep_alive_secs: 20 * 60,
            trigger_capacity: 256,
            orderbook_capacity: 64,
            notification_capacity: 128,
            persist_capacity: 1024,
        }
    }
}

/// Applies decoded feed events to the registries of one exchange
#[derive(Clone)]
pub struct Ingestor {
    exchange: String,
    registries: Registries,
    persist: PersistSender,
    notifier: NotificationSender,
    kline_tx: mpsc::Sender<KlineTick>,
    book_tx: mpsc::Sender<OrderBook>,
}

impl Ingestor {
    pub fn new(
        exchange: &str,
        registries: Registries,
        persist: PersistSender,
        notifier: NotificationSender,
        kline_tx: mpsc::Sender<KlineTick>,
        book_tx: mpsc::Sender<OrderBook>,
    ) -> Self {
        Self {
            exchange: exchange.to_lowercase(),
            registries,
            persist,
            notifier,
            kline_tx,
            book_tx,
        }
    }

    pub fn apply(&self, event: FeedEvent) {
        match event {
            FeedEvent::Kline {
                pair,
                interval,
                candle,
                closed,
                quote_volume,
                trades,
            } => self.apply_kline(&pair, &interval, candle, closed, quote_volume, trades),
            FeedEvent::Depth { pair, bids, asks } => self.apply_depth(&pair, bids, asks),
            FeedEvent::Trade(trade) => self.apply_trade(trade),
            FeedEvent::AccountPosition { balances } => {
                for (symbol, free, locked) in balances {
                    self.apply_balance(&symbol, |asset| {
                        asset.free = free;
                        asset.locked = locked;
                    });
                }
            }
            FeedEvent::BalanceDelta { symbol, delta } => {
                self.apply_balance(&symbol, |asset| asset.free += delta);
            }
            FeedEvent::Execution(report) => self.apply_execution(report),
            // Resubscription belongs to the feed task
            FeedEvent::StreamExpired => {}
        }
    }

    fn apply_kline(&self, pair: &str, interval: &str, candle: Candle, closed: bool, quote_volume: f64, trades: u64) {
        let key = PairKey::new(pair, &self.exchange);

        let updated = self.registries.markets.update(&key, |market| {
            market.closed = closed;
            market.num_of_trades = trades;
            market.open = candle.open;
            market.high = candle.high;
            market.low = candle.low;
            market.close = candle.close;
            market.volume = candle.volume;
            market.quote_volume = quote_volume;
            market.last_price = market.price;
            market.price = candle.close;
            market.clone()
        });

        let Some(market) = updated else {
            tracing::debug!(pair = %key, "Ignoring kline for unknown market");
            return;
        };

        if trades == 0 {
            self.registries.clear_trades(&key);
        }

        if closed {
            self.persist.send(PersistRecord::Market(market.clone()));
            self.persist.send(PersistRecord::Candle {
                key: CandleKey::new(&key, interval),
                candle: candle.clone(),
            });
        }

        let tick = KlineTick {
            market,
            interval: interval.to_string(),
            candle,
        };
        if let Err(e) = self.kline_tx.try_send(tick) {
            tracing::debug!(pair = %key, error = %e, "Kline trigger dropped");
        }
    }

    fn apply_depth(&self, pair: &str, bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>) {
        let book = OrderBook::from_levels(pair, &self.exchange, bids, asks);
        self.registries.order_books.upsert(book.clone());

        if let Err(e) = self.book_tx.try_send(book) {
            tracing::debug!(pair = %pair, error = %e, "Order book tick dropped");
        }
    }

    fn apply_trade(&self, mut trade: Trade) {
        trade.exchange = self.exchange.clone();
        let key = PairKey::new(&trade.pair, &self.exchange);
        let price = trade.price;

        self.registries.record_trade(trade);
        self.registries.markets.update(&key, |market| {
            market.last_price = market.price;
            market.price = price;
        });
    }

    fn apply_balance(&self, symbol: &str, f: impl FnOnce(&mut Asset)) {
        let asset = self.registries.assets.upsert_with(
            AssetKey::new(symbol, &self.exchange),
            || Asset::new(symbol, &self.exchange),
            f,
        );
        self.persist.send(PersistRecord::Asset(asset));
    }

    fn apply_execution(&self, report: ExecutionReport) {
        let key = OrderKey::new(report.order_id, &self.exchange);

        let status = if report.status == OrderStatus::Canceled && report.executed_quantity > 0.0 {
            OrderStatus::Filled
        } else {
            report.status
        };

        let created = Cell::new(false);
        let fresh = || {
            created.set(true);
            let (quantity, total) = if status == OrderStatus::Filled && report.cumulative_quote > 0.0 {
                (report.executed_quantity, report.cumulative_quote)
            } else {
                (report.quantity, truncate(report.price * report.quantity, 8))
            };

            Order {
                order_id: report.order_id,
                pair: report.pair.to_uppercase(),
                exchange: self.exchange.clone(),
                side: report.side,
                status,
                price: report.price,
                quantity,
                total,
                stoploss: 0.0,
                takeprofit: 0.0,
                ref_enabled: false,
                ref_side: None,
                ref_tripped: None,
                ref_order_id: 0,
                auto_repeat: 0,
                auto_repeat_id: 0,
                created_at: report.event_time,
                updated_at: report.event_time,
            }
        };

        let order = self.registries.orders.upsert_with(key, fresh, |order| {
            if created.get() {
                return;
            }
            // Automation fields are owned by the position manager
            order.status = status;
            if report.executed_quantity > 0.0 {
                order.quantity = report.executed_quantity;
                order.total = report.cumulative_quote;
            }
            if report.last_price > 0.0 {
                order.price = report.last_price;
            }
            order.updated_at = report.event_time;
        });

        self.persist.send(PersistRecord::Order(order.clone()));
        self.notifier.send(
            "Order update",
            format!(
                "{} limit {} order [{}] for {} {}",
                order.status, order.side, order.order_id, order.quantity, order.pair
            ),
        );
    }
}

/// Owns the feed tasks of one exchange
pub struct Coordinator {
    adapter: Arc<dyn ExchangeAdapter>,
    registries: Registries,
    persist: PersistSender,
    restarts: Vec<RestartHandle>,
}

impl Coordinator {
    /// Spawn one task per feed kind plus the listen-key keep-alive
    pub fn spawn(
        adapter: Arc<dyn ExchangeAdapter>,
        ingestor: Ingestor,
        registries: Registries,
        persist: PersistSender,
        config: &FeedConfig,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let mut restarts = Vec::with_capacity(FeedKind::ALL.len());
        let mut handles = Vec::with_capacity(FeedKind::ALL.len() + 1);

        for feed in FeedKind::ALL {
            let (task, restart) = FeedTask::new(feed, Arc::clone(&adapter), ingestor.clone(), registries.clone(), config);
            restarts.push(restart);
            handles.push(tokio::spawn(task.run()));
        }

        if let Some(account) = restarts.iter().find(|h| h.feed() == FeedKind::Account) {
            handles.push(tokio::spawn(feed::keep_alive_loop(
                Arc::clone(&adapter),
                account.clone(),
                std::time::Duration::from_secs(config.keep_alive_secs.max(1)),
            )));
        }

        tracing::info!("🔌 Started {} feeds for {}", FeedKind::ALL.len(), adapter.name());

        (
            Self {
                adapter,
                registries,
                persist,
                restarts,
            },
            handles,
        )
    }

    /// Ask every feed to rebuild its subscription
    pub fn restart_all(&self) {
        for handle in &self.restarts {
            handle.request();
        }
    }

    /// Enable or disable a market and resubscribe
    ///
    /// Returns `false` for a market the registry doesn't know.
    pub fn set_market_status(&self, pair: &str, status: Status) -> bool {
        let key = PairKey::new(pair, self.adapter.name());

        let updated = self.registries.markets.update(&key, |market| {
            market.status = status;
            market.clone()
        });

        let Some(market) = updated else {
            return false;
        };

        tracing::info!(pair = %key, status = status.as_str(), "Market status changed");
        self.persist.send(PersistRecord::Market(market));
        self.restart_all();
        true
    }

    /// Reconcile the registry with the stored market list
    ///
    /// Adds markets it has not seen and applies status changes; feeds are
    /// restarted when anything changed. Returns the number of changes.
    pub fn sync_markets(&self, markets: Vec<Market>) -> usize {
        let mut changed = 0;

        for market in markets {
            if !market.exchange.eq_ignore_ascii_case(self.adapter.name()) {
                continue;
            }

            match self.registries.markets.get(&market.key()) {
                Some(current) if current.status == market.status => {}
                Some(_) => {
                    if self.set_market_status(&market.pair, market.status) {
                        changed += 1;
                    }
                }
                None => {
                    tracing::info!(pair = %market.key(), "Market added");
                    self.registries.markets.upsert(market);
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            self.restart_all();
        }
        changed
    }

    /// Poll the stored market list until the task is dropped
    pub async fn sync_loop(self, db: PostgresPersistence, every: std::time::Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Startup state is already loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match db.load_markets().await {
                Ok(markets) => {
                    let changed = self.sync_markets(markets);
                    if changed > 0 {
                        tracing::info!("🔄 {} market changes, resubscribing feeds", changed);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to reload markets"),
            }
        }
    }
}
