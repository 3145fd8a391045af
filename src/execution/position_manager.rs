use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::exchange::ExchangeAdapter;
use crate::indicators::truncate;
use crate::models::{Market, Order, OrderBook, OrderKey, OrderRequest, OrderStatus, Side};
use crate::notify::NotificationSender;
use crate::persistence::{PersistRecord, PersistSender};
use crate::registry::Registries;

/// Thresholds gating take-profit exits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutomationConfig {
    /// Order book side imbalance (percent) that confirms a reversal
    pub book_imbalance_pct: f64,
    pub overbought_rsi: f64,
    pub oversold_rsi: f64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            book_imbalance_pct: 5.0,
            overbought_rsi: 65.0,
            oversold_rsi: 35.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "Take profit",
            ExitReason::StopLoss => "Stop loss",
        }
    }
}

/// A satisfied exit condition for one filled order
#[derive(Debug, Clone, PartialEq)]
pub struct Trip {
    pub order_id: u64,
    pub exit: ExitReason,
    /// Side of the closing order
    pub side: Side,
    /// Best bid (closing a BUY) or best ask (closing a SELL)
    pub price: f64,
    pub reason: String,
}

fn pct(numerator: f64, denominator: f64) -> f64 {
    if denominator <= 0.0 {
        return 0.0;
    }
    truncate(numerator / denominator * 100.0, 3)
}

/// Exit condition for `order` against the latest market and book, if any
///
/// Take-profit is checked before stop-loss; at most one trip is returned.
pub fn check_trip(order: &Order, market: &Market, book: &OrderBook, config: &AutomationConfig) -> Option<Trip> {
    if order.price <= 0.0 {
        return None;
    }

    let (bid, ask) = (book.best_bid(), book.best_ask());

    let (exit, price, reason) = match order.side {
        Side::Buy => {
            let gain = pct(bid - order.price, order.price);
            let loss = pct(order.price - bid, order.price);
            let sell_pressure = pct(book.asks_base_total - book.bids_base_total, book.asks_base_total);

            let take_profit = order.takeprofit > 0.0
                && market.upper_band > 0.0
                && market.close >= market.upper_band
                && market.close < market.open
                && (sell_pressure > config.book_imbalance_pct || market.rsi > config.overbought_rsi)
                && gain >= order.takeprofit;

            if take_profit {
                (
                    ExitReason::TakeProfit,
                    bid,
                    format!("> {:.3}% TP: {:.8} @ RSI {:.2}", gain, bid, market.rsi),
                )
            } else if order.stoploss > 0.0 && loss >= order.stoploss {
                (ExitReason::StopLoss, bid, format!("< {:.3}% SL: {:.8}", loss, bid))
            } else {
                return None;
            }
        }
        Side::Sell => {
            let gain = pct(order.price - ask, order.price);
            let loss = pct(ask - order.price, order.price);
            let buy_pressure = pct(book.bids_base_total - book.asks_base_total, book.bids_base_total);

            let take_profit = order.takeprofit > 0.0
                && market.lower_band > 0.0
                && market.close <= market.lower_band
                && market.close > market.open
                && (buy_pressure > config.book_imbalance_pct || market.rsi < config.oversold_rsi)
                && gain >= order.takeprofit;

            if take_profit {
                (
                    ExitReason::TakeProfit,
                    ask,
                    format!("< {:.3}% TP: {:.8} @ RSI {:.2}", gain, ask, market.rsi),
                )
            } else if order.stoploss > 0.0 && loss >= order.stoploss {
                (ExitReason::StopLoss, ask, format!("> {:.3}% SL: {:.8}", loss, ask))
            } else {
                return None;
            }
        }
    };

    Some(Trip {
        order_id: order.order_id,
        exit,
        side: order.side.opposite(),
        price,
        reason,
    })
}

/// Closing order for a tripped order, carrying the auto-repeat chain forward
pub fn closing_request(tripped: &Order, trip: &Trip) -> OrderRequest {
    let mut request = OrderRequest {
        pair: tripped.pair.clone(),
        exchange: tripped.exchange.clone(),
        side: trip.side,
        price: trip.price,
        quantity: tripped.quantity,
        stoploss: 0.0,
        takeprofit: 0.0,
        ref_order_id: tripped.order_id,
        auto_repeat: 0,
        auto_repeat_id: 0,
    };

    if tripped.auto_repeat > 0 {
        request.auto_repeat = tripped.auto_repeat - 1;
        request.auto_repeat_id = if tripped.auto_repeat_id == 0 {
            tripped.order_id
        } else {
            tripped.auto_repeat_id
        };
        request.stoploss = tripped.stoploss;
        request.takeprofit = tripped.takeprofit;
    }

    request
}

/// Watches filled orders and closes them on stop-loss or take-profit
#[derive(Clone)]
pub struct PositionManager {
    adapter: Arc<dyn ExchangeAdapter>,
    registries: Registries,
    config: AutomationConfig,
    persist: PersistSender,
    notifier: NotificationSender,
}

impl PositionManager {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        registries: Registries,
        config: AutomationConfig,
        persist: PersistSender,
        notifier: NotificationSender,
    ) -> Self {
        Self {
            adapter,
            registries,
            config,
            persist,
            notifier,
        }
    }

    /// Mark every qualifying order of the book's pair as tripped
    ///
    /// Each mark is a check-and-set on the order registry, so an order is
    /// returned at most once no matter how often the same tick is seen.
    pub fn trip_orders(&self, book: &OrderBook) -> Vec<(Order, Trip)> {
        let key = book.key();

        if book.best_bid() == 0.0 || book.best_ask() == 0.0 {
            tracing::debug!(pair = %key, "Empty order book, skipping tick");
            return Vec::new();
        }

        let Some(market) = self.registries.markets.get(&key) else {
            tracing::debug!(pair = %key, "No market for order book tick");
            return Vec::new();
        };

        let mut tripped = Vec::new();

        for order in self.registries.orders.snapshot() {
            if !order.pair.eq_ignore_ascii_case(&key.pair)
                || !order.exchange.eq_ignore_ascii_case(&key.exchange)
                || !order.is_automation_candidate()
            {
                continue;
            }

            let Some(trip) = check_trip(&order, &market, book, &self.config) else {
                continue;
            };

            let marked = self
                .registries
                .orders
                .update(&order.key(), |current| {
                    if !current.is_automation_candidate() {
                        return None;
                    }
                    current.ref_tripped = Some(trip.reason.clone());
                    current.ref_side = Some(trip.side);
                    current.updated_at = Utc::now();
                    Some(current.clone())
                })
                .flatten();

            match marked {
                Some(order) => {
                    tracing::info!(
                        pair = %key,
                        order_id = order.order_id,
                        "⚡ {} tripped: {}",
                        trip.exit.as_str(),
                        trip.reason
                    );
                    self.persist.send(PersistRecord::Order(order.clone()));
                    tripped.push((order, trip));
                }
                None => {
                    tracing::debug!(pair = %key, order_id = order.order_id, "Order already tripped");
                }
            }
        }

        tripped
    }

    /// Place the closing order and link it to the tripped one
    pub async fn submit(&self, tripped: &Order, trip: &Trip) -> anyhow::Result<u64> {
        let request = closing_request(tripped, trip);

        let new_id = self
            .adapter
            .create_order(&request)
            .await
            .with_context(|| format!("Failed to place {} order for {}", request.side, request.pair))?;

        let now = Utc::now();
        let ref_enabled = request.stoploss > 0.0 || request.takeprofit > 0.0;
        let link = |order: &mut Order| {
            order.stoploss = request.stoploss;
            order.takeprofit = request.takeprofit;
            order.ref_enabled = ref_enabled;
            order.ref_order_id = request.ref_order_id;
            order.auto_repeat = request.auto_repeat;
            order.auto_repeat_id = request.auto_repeat_id;
        };

        // The execution report may already have created this order
        let placeholder = self.registries.orders.upsert_with(
            OrderKey::new(new_id, &request.exchange),
            || Order {
                order_id: new_id,
                pair: request.pair.clone(),
                exchange: request.exchange.to_lowercase(),
                side: request.side,
                status: OrderStatus::New,
                price: request.price,
                quantity: request.quantity,
                total: truncate(request.price * request.quantity, 8),
                stoploss: 0.0,
                takeprofit: 0.0,
                ref_enabled: false,
                ref_side: None,
                ref_tripped: None,
                ref_order_id: 0,
                auto_repeat: 0,
                auto_repeat_id: 0,
                created_at: now,
                updated_at: now,
            },
            link,
        );
        self.persist.send(PersistRecord::Order(placeholder));

        let linked = self.registries.orders.update(&tripped.key(), |order| {
            order.ref_order_id = new_id;
            order.clone()
        });
        if let Some(order) = linked {
            self.persist.send(PersistRecord::Order(order));
        }

        self.notifier.send(
            trip.exit.as_str(),
            format!(
                "{} limit {} order [{}] for {} {} @ {:.8} ({})",
                OrderStatus::New,
                request.side,
                new_id,
                request.quantity,
                request.pair,
                request.price,
                trip.reason
            ),
        );

        Ok(new_id)
    }

    /// Trip and close every qualifying order for one book tick
    pub async fn evaluate_tick(&self, book: &OrderBook) -> Vec<u64> {
        let mut placed = Vec::new();

        for (order, trip) in self.trip_orders(book) {
            match self.submit(&order, &trip).await {
                Ok(id) => placed.push(id),
                Err(e) => {
                    tracing::error!(order_id = order.order_id, error = %e, "Automated order failed");
                    self.notifier.send(
                        format!("{} failed", trip.exit.as_str()),
                        format!("[{}] {} {}: {:#}", order.order_id, trip.side, order.pair, e),
                    );
                }
            }
        }

        placed
    }

    /// Consume order book ticks until the channel closes
    pub async fn run(self, mut rx: mpsc::Receiver<OrderBook>) {
        tracing::info!("🛡️ Position manager started");

        while let Some(book) = rx.recv().await {
            self.evaluate_tick(&book).await;
        }

        tracing::info!("Position manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeError, FeedEvent, FeedKind};
    use crate::models::{Candle, Notification};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockExchange {
        next_id: Mutex<u64>,
        fail: bool,
        requests: Mutex<Vec<OrderRequest>>,
    }

    impl MockExchange {
        fn new(fail: bool) -> Self {
            Self {
                next_id: Mutex::new(1000),
                fail,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExchangeAdapter for MockExchange {
        fn name(&self) -> &str {
            "binance"
        }

        async fn stream_url(&self, _feed: FeedKind, _pairs: &[String]) -> Result<Option<String>, ExchangeError> {
            Ok(None)
        }

        fn decode(&self, _feed: FeedKind, _payload: &str) -> Result<Vec<FeedEvent>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn create_order(&self, request: &OrderRequest) -> Result<u64, ExchangeError> {
            if self.fail {
                return Err(ExchangeError::Api {
                    exchange: "binance".to_string(),
                    code: -2010,
                    message: "Account has insufficient balance".to_string(),
                });
            }
            self.requests.lock().unwrap().push(request.clone());
            let mut id = self.next_id.lock().unwrap();
            *id += 1;
            Ok(*id)
        }

        async fn cancel_order(&self, _pair: &str, _order_id: u64) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn query_order(&self, _pair: &str, order_id: u64) -> Result<Order, ExchangeError> {
            Err(ExchangeError::Decode(format!("unknown order {}", order_id)))
        }

        async fn klines(&self, _pair: &str, _interval: &str, _limit: usize) -> Result<Vec<Candle>, ExchangeError> {
            Ok(Vec::new())
        }
    }

    fn create_test_order(order_id: u64, side: Side, price: f64) -> Order {
        Order {
            order_id,
            pair: "BTCUSDT".to_string(),
            exchange: "binance".to_string(),
            side,
            status: OrderStatus::Filled,
            price,
            quantity: 0.5,
            total: price * 0.5,
            stoploss: 3.0,
            takeprofit: 5.0,
            ref_enabled: true,
            ref_side: None,
            ref_tripped: None,
            ref_order_id: 0,
            auto_repeat: 0,
            auto_repeat_id: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Bearish candle closing above the upper band
    fn overbought_market() -> Market {
        let mut market = Market::new("BTCUSDT", "binance", "BTC", "USDT");
        market.open = 111.0;
        market.close = 110.0;
        market.upper_band = 109.0;
        market.lower_band = 90.0;
        market.rsi = 70.0;
        market
    }

    /// Bullish candle closing below the lower band
    fn oversold_market() -> Market {
        let mut market = Market::new("BTCUSDT", "binance", "BTC", "USDT");
        market.open = 89.0;
        market.close = 90.0;
        market.upper_band = 110.0;
        market.lower_band = 91.0;
        market.rsi = 30.0;
        market
    }

    fn book(bid: f64, ask: f64) -> OrderBook {
        OrderBook::from_levels("BTCUSDT", "binance", vec![(bid, 2.0)], vec![(ask, 2.0)])
    }

    fn manager(
        adapter: Arc<MockExchange>,
        registries: &Registries,
    ) -> (PositionManager, mpsc::Receiver<Notification>) {
        let (notifier, rx) = NotificationSender::channel(16);
        let manager = PositionManager::new(
            adapter,
            registries.clone(),
            AutomationConfig::default(),
            PersistSender::disabled(),
            notifier,
        );
        (manager, rx)
    }

    #[test]
    fn test_buy_take_profit() {
        let order = create_test_order(1, Side::Buy, 100.0);
        let trip = check_trip(&order, &overbought_market(), &book(106.0, 106.5), &AutomationConfig::default()).unwrap();

        assert_eq!(trip.exit, ExitReason::TakeProfit);
        assert_eq!(trip.side, Side::Sell);
        assert_eq!(trip.price, 106.0);
        assert_eq!(trip.reason, "> 6.000% TP: 106.00000000 @ RSI 70.00");
    }

    #[test]
    fn test_take_profit_needs_reversal_candle() {
        let order = create_test_order(1, Side::Buy, 100.0);
        let mut market = overbought_market();
        market.open = 105.0;

        // Bullish candle: no take-profit, and the position is in profit
        assert!(check_trip(&order, &market, &book(106.0, 106.5), &AutomationConfig::default()).is_none());
    }

    #[test]
    fn test_buy_stop_loss() {
        let order = create_test_order(1, Side::Buy, 100.0);
        let trip = check_trip(&order, &overbought_market(), &book(96.0, 96.5), &AutomationConfig::default()).unwrap();

        assert_eq!(trip.exit, ExitReason::StopLoss);
        assert_eq!(trip.price, 96.0);
        assert_eq!(trip.reason, "< 4.000% SL: 96.00000000");
    }

    #[test]
    fn test_sell_take_profit_and_stop_loss() {
        let order = create_test_order(2, Side::Sell, 100.0);
        let config = AutomationConfig::default();

        let trip = check_trip(&order, &oversold_market(), &book(93.5, 94.0), &config).unwrap();
        assert_eq!(trip.exit, ExitReason::TakeProfit);
        assert_eq!(trip.side, Side::Buy);
        assert_eq!(trip.reason, "< 6.000% TP: 94.00000000 @ RSI 30.00");

        let trip = check_trip(&order, &oversold_market(), &book(103.5, 104.0), &config).unwrap();
        assert_eq!(trip.exit, ExitReason::StopLoss);
        assert_eq!(trip.reason, "> 4.000% SL: 104.00000000");
    }

    #[test]
    fn test_closing_request_continues_auto_repeat() {
        let mut order = create_test_order(42, Side::Buy, 100.0);
        order.auto_repeat = 3;
        let trip = check_trip(&order, &overbought_market(), &book(96.0, 96.5), &AutomationConfig::default()).unwrap();

        let request = closing_request(&order, &trip);
        assert_eq!(request.side, Side::Sell);
        assert_eq!(request.ref_order_id, 42);
        assert_eq!(request.auto_repeat, 2);
        assert_eq!(request.auto_repeat_id, 42);
        assert_eq!((request.stoploss, request.takeprofit), (3.0, 5.0));

        order.auto_repeat = 0;
        let request = closing_request(&order, &trip);
        assert_eq!((request.auto_repeat, request.auto_repeat_id), (0, 0));
        assert_eq!((request.stoploss, request.takeprofit), (0.0, 0.0));
    }

    #[test]
    fn test_same_tick_trips_once() {
        let registries = Registries::new();
        registries.markets.upsert(overbought_market());
        registries.orders.upsert(create_test_order(1, Side::Buy, 100.0));
        let (manager, _rx) = manager(Arc::new(MockExchange::new(false)), &registries);

        let tick = book(96.0, 96.5);
        assert_eq!(manager.trip_orders(&tick).len(), 1);
        assert!(manager.trip_orders(&tick).is_empty());

        let order = registries.orders.get(&OrderKey::new(1, "binance")).unwrap();
        assert_eq!(order.ref_side, Some(Side::Sell));
        assert_eq!(order.ref_tripped.as_deref(), Some("< 4.000% SL: 96.00000000"));
    }

    #[test]
    fn test_empty_book_is_skipped() {
        let registries = Registries::new();
        registries.markets.upsert(overbought_market());
        registries.orders.upsert(create_test_order(1, Side::Buy, 100.0));
        let (manager, _rx) = manager(Arc::new(MockExchange::new(false)), &registries);

        let empty = OrderBook::from_levels("BTCUSDT", "binance", vec![], vec![]);
        assert!(manager.trip_orders(&empty).is_empty());
        assert!(registries.orders.get(&OrderKey::new(1, "binance")).unwrap().ref_tripped.is_none());
    }

    #[test]
    fn test_other_pairs_are_ignored() {
        let registries = Registries::new();
        registries.markets.upsert(overbought_market());
        let mut order = create_test_order(1, Side::Buy, 100.0);
        order.pair = "ETHUSDT".to_string();
        registries.orders.upsert(order);
        let (manager, _rx) = manager(Arc::new(MockExchange::new(false)), &registries);

        assert!(manager.trip_orders(&book(96.0, 96.5)).is_empty());
    }

    #[tokio::test]
    async fn test_evaluate_tick_links_new_order() {
        let registries = Registries::new();
        registries.markets.upsert(overbought_market());
        let mut order = create_test_order(42, Side::Buy, 100.0);
        order.auto_repeat = 2;
        registries.orders.upsert(order);

        let adapter = Arc::new(MockExchange::new(false));
        let (manager, mut rx) = manager(Arc::clone(&adapter), &registries);

        let placed = manager.evaluate_tick(&book(106.0, 106.5)).await;
        assert_eq!(placed, vec![1001]);

        let requests = adapter.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].side, Side::Sell);
        assert_eq!(requests[0].price, 106.0);
        assert_eq!(requests[0].quantity, 0.5);

        let placeholder = registries.orders.get(&OrderKey::new(1001, "binance")).unwrap();
        assert_eq!(placeholder.status, OrderStatus::New);
        assert!(placeholder.ref_enabled);
        assert_eq!(placeholder.ref_order_id, 42);
        assert_eq!((placeholder.auto_repeat, placeholder.auto_repeat_id), (1, 42));

        let tripped = registries.orders.get(&OrderKey::new(42, "binance")).unwrap();
        assert_eq!(tripped.ref_order_id, 1001);

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.title, "Take profit");
        assert!(notification.message.starts_with("NEW limit SELL order [1001]"));

        // Nothing left to trip
        assert!(manager.evaluate_tick(&book(106.0, 106.5)).await.is_empty());
        assert_eq!(registries.orders.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_submit_is_notified() {
        let registries = Registries::new();
        registries.markets.upsert(overbought_market());
        registries.orders.upsert(create_test_order(7, Side::Buy, 100.0));
        let (manager, mut rx) = manager(Arc::new(MockExchange::new(true)), &registries);

        assert!(manager.evaluate_tick(&book(96.0, 96.5)).await.is_empty());

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.title, "Stop loss failed");
        assert!(notification.message.contains("insufficient balance"));

        // The trip is not retried
        let order = registries.orders.get(&OrderKey::new(7, "binance")).unwrap();
        assert!(order.ref_tripped.is_some());
        assert_eq!(registries.orders.len(), 1);
    }
}
