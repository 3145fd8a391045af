use async_trait::async_trait;
use backpocket::analysis::IndicatorEngine;
use backpocket::exchange::{ExchangeAdapter, ExchangeError, FeedEvent, FeedKind};
use backpocket::execution::{AutomationConfig, CandleBuffer, PositionManager};
use backpocket::indicators::IndicatorConfig;
use backpocket::ingestion::Ingestor;
use backpocket::models::{Candle, Market, Notification, Order, OrderBook, OrderKey, OrderRequest, OrderStatus, PairKey, Side};
use backpocket::notify::NotificationSender;
use backpocket::persistence::PersistSender;
use backpocket::registry::Registries;
use backpocket::strategy::{timeframe_intervals, OpportunityConfig, OpportunityDetector, OpportunityError};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_test::{assert_err, assert_ok};

/// In-memory exchange: serves fixed klines and records placed orders
struct MockExchange {
    candles: Vec<Candle>,
    orders: Mutex<Vec<OrderRequest>>,
}

impl MockExchange {
    fn new(candles: Vec<Candle>) -> Self {
        Self {
            candles,
            orders: Mutex::new(Vec::new()),
        }
    }

    fn placed(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap().clone()
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
        let mut orders = self.orders.lock().unwrap();
        orders.push(request.clone());
        Ok(9000 + orders.len() as u64)
    }

    async fn cancel_order(&self, _pair: &str, _order_id: u64) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn query_order(&self, _pair: &str, order_id: u64) -> Result<Order, ExchangeError> {
        Err(ExchangeError::Decode(format!("unknown order {}", order_id)))
    }

    async fn klines(&self, _pair: &str, _interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let skip = self.candles.len().saturating_sub(limit);
        Ok(self.candles[skip..].to_vec())
    }
}

fn create_test_candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + ChronoDuration::minutes(i),
        open,
        high,
        low,
        close,
        volume: 1000.0,
    }
}

/// 20-candle uptrend followed by a bearish engulfing reversal
fn reversal_history() -> Vec<Candle> {
    let mut candles: Vec<Candle> = (0..20)
        .map(|i| {
            let open = 100.0 + i as f64;
            create_test_candle(i, open, open + 1.5, open - 0.5, open + 1.0)
        })
        .collect();
    candles.push(reversal_candle());
    candles
}

fn reversal_candle() -> Candle {
    create_test_candle(20, 120.5, 124.0, 116.0, 118.5)
}

fn live_kline(closed: bool) -> FeedEvent {
    FeedEvent::Kline {
        pair: "BTCUSDT".to_string(),
        interval: "1m".to_string(),
        candle: reversal_candle(),
        closed,
        quote_volume: 118_500.0,
        trades: 42,
    }
}

fn filled_order(order_id: u64) -> Order {
    Order {
        order_id,
        pair: "BTCUSDT".to_string(),
        exchange: "binance".to_string(),
        side: Side::Buy,
        status: OrderStatus::Filled,
        price: 100.0,
        quantity: 0.25,
        total: 25.0,
        stoploss: 2.0,
        takeprofit: 0.0,
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

async fn next_notification(rx: &mut mpsc::Receiver<Notification>) -> Notification {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification channel closed")
}

#[tokio::test]
async fn test_reversal_emits_sell_once_per_candle() {
    let _ = tracing_subscriber::fmt::try_init();

    let registries = Registries::new();
    registries.markets.upsert(Market::new("BTCUSDT", "binance", "BTC", "USDT"));
    let key = PairKey::new("BTCUSDT", "binance");

    let adapter = Arc::new(MockExchange::new(reversal_history()));
    let engine = IndicatorEngine::new(
        registries.clone(),
        CandleBuffer::new(250),
        IndicatorConfig::default(),
        vec!["1m".to_string(), "5m".to_string(), "15m".to_string()],
        "1m",
    );
    assert_eq!(engine.backfill(adapter.as_ref(), &key, 250).await, 3);

    let (notifier, mut notify_rx) = NotificationSender::channel(16);
    let (kline_tx, kline_rx) = mpsc::channel(16);
    let (book_tx, _book_rx) = mpsc::channel(16);
    let (detector_tx, detector_rx) = mpsc::channel(16);

    let detector = OpportunityDetector::new(
        registries.clone(),
        OpportunityConfig::default(),
        notifier.clone(),
        PersistSender::disabled(),
    );
    tokio::spawn(engine.run(kline_rx, detector_tx));
    tokio::spawn(detector.clone().run(detector_rx));

    let ingestor = Ingestor::new("binance", registries.clone(), PersistSender::disabled(), notifier, kline_tx, book_tx);
    ingestor.apply(live_kline(false));

    let notification = next_notification(&mut notify_rx).await;
    assert_eq!(notification.title, "Opportunity");
    assert_eq!(
        notification.message,
        "SELL BTCUSDT [1m] @ 118.50000000 SL: 124.00000000 TP: 110.50000000"
    );

    let opportunity = assert_ok!(detector.assess(&key, "1m")).expect("analysis should exist");
    assert_eq!(opportunity.action, Some(Side::Sell));
    assert!(opportunity.stoploss > opportunity.takeprofit);

    // Same candle again, then its close: still one notification
    ingestor.apply(live_kline(false));
    ingestor.apply(live_kline(true));
    // The next candle may fire again
    ingestor.apply(live_kline(false));

    let renotified = next_notification(&mut notify_rx).await;
    assert_eq!(renotified.message, notification.message);
    assert!(notify_rx.try_recv().is_err());

    let market = registries.markets.get(&key).unwrap();
    assert_eq!(market.price, 118.5);
    assert!(market.upper_band > 0.0);
}

#[tokio::test]
async fn test_identical_ticks_trip_once() {
    let registries = Registries::new();
    registries.markets.upsert(Market::new("BTCUSDT", "binance", "BTC", "USDT"));
    registries.orders.upsert(filled_order(1));

    let adapter = Arc::new(MockExchange::new(Vec::new()));
    let (notifier, mut notify_rx) = NotificationSender::channel(16);
    let manager = PositionManager::new(
        adapter.clone(),
        registries.clone(),
        AutomationConfig::default(),
        PersistSender::disabled(),
        notifier,
    );

    let book = OrderBook::from_levels("BTCUSDT", "binance", vec![(97.5, 1.0)], vec![(97.6, 1.0)]);
    let (first, second) = tokio::join!(manager.evaluate_tick(&book), manager.evaluate_tick(&book));

    assert_eq!(first.len() + second.len(), 1);
    let placed = adapter.placed();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].side, Side::Sell);
    assert_eq!(placed[0].price, 97.5);
    assert_eq!(placed[0].ref_order_id, 1);

    let tripped = registries.orders.get(&OrderKey::new(1, "binance")).unwrap();
    assert_eq!(tripped.ref_tripped.as_deref(), Some("< 2.500% SL: 97.50000000"));
    assert_eq!(tripped.ref_order_id, 9001);

    let notification = next_notification(&mut notify_rx).await;
    assert_eq!(notification.title, "Stop loss");
}

#[tokio::test]
async fn test_empty_book_is_skipped() {
    let registries = Registries::new();
    registries.markets.upsert(Market::new("BTCUSDT", "binance", "BTC", "USDT"));
    registries.orders.upsert(filled_order(1));

    let adapter = Arc::new(MockExchange::new(Vec::new()));
    let (notifier, _notify_rx) = NotificationSender::channel(16);
    let manager = PositionManager::new(
        adapter.clone(),
        registries.clone(),
        AutomationConfig::default(),
        PersistSender::disabled(),
        notifier,
    );

    let book = OrderBook::from_levels("BTCUSDT", "binance", vec![], vec![]);
    assert_eq!(book.bids_base_total, 0.0);
    assert_eq!(book.asks_base_total, 0.0);

    assert!(manager.evaluate_tick(&book).await.is_empty());
    assert!(adapter.placed().is_empty());
    assert!(registries.orders.get(&OrderKey::new(1, "binance")).unwrap().ref_tripped.is_none());
}

#[test]
fn test_registry_round_trip() {
    let registries = Registries::new();
    let mut market = Market::new("ethusdt", "Binance", "ETH", "USDT");
    market.close = 2500.0;

    assert!(registries.markets.upsert(market.clone()));
    assert_eq!(registries.markets.get(&market.key()), Some(market.clone()));

    market.close = 2510.0;
    assert!(!registries.markets.upsert(market.clone()));
    assert_eq!(registries.markets.len(), 1);
    assert_eq!(registries.markets.get(&PairKey::new("ETHUSDT", "binance")), Some(market));
}

#[test]
fn test_timeframe_resolution() {
    let intervals = assert_ok!(timeframe_intervals("4h"));
    assert_eq!(intervals, ["4h", "12h", "1d"]);

    let err = assert_err!(timeframe_intervals("2w"));
    assert_eq!(err, OpportunityError::UnknownTimeframe("2w".to_string()));
}
