use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::indicators::precision::truncate;

/// Composite key for anything tracked per (pair, exchange)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub pair: String,
    pub exchange: String,
}

impl PairKey {
    pub fn new(pair: &str, exchange: &str) -> Self {
        Self {
            pair: pair.to_uppercase(),
            exchange: exchange.to_lowercase(),
        }
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.pair, self.exchange)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange-reported order lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "PENDING_CANCEL" => Some(OrderStatus::Canceled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" | "EXPIRED_IN_MATCH" => Some(OrderStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a market (or asset) is actively streamed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Enabled,
    Disabled,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Enabled => "enabled",
            Status::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("disabled") {
            Status::Disabled
        } else {
            Status::Enabled
        }
    }
}

/// Direction of a single interval's composite trend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

impl Trend {
    pub fn sign(self) -> i32 {
        match self {
            Trend::Bullish => 1,
            Trend::Bearish => -1,
            Trend::Neutral => 0,
        }
    }
}

/// Weighted multi-timeframe trend classification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AggregateTrend {
    StrongBullish,
    Bullish,
    Neutral,
    Bearish,
    StrongBearish,
}

/// OHLCV candlestick
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn body_top(&self) -> f64 {
        self.open.max(self.close)
    }

    pub fn body_bottom(&self) -> f64 {
        self.open.min(self.close)
    }

    pub fn upper_shadow(&self) -> f64 {
        self.high - self.body_top()
    }

    pub fn lower_shadow(&self) -> f64 {
        self.body_bottom() - self.low
    }
}

/// Live state of a traded pair on one exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Market {
    pub pair: String,
    pub exchange: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub status: Status,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub last_price: f64,
    pub price: f64,
    pub upper_band: f64,
    pub middle_band: f64,
    pub lower_band: f64,
    pub rsi: f64,
    pub num_of_trades: u64,
    /// Set on the final tick of a candle
    pub closed: bool,
}

impl Market {
    pub fn new(pair: &str, exchange: &str, base_asset: &str, quote_asset: &str) -> Self {
        let key = PairKey::new(pair, exchange);
        Self {
            pair: key.pair,
            exchange: key.exchange,
            base_asset: base_asset.to_uppercase(),
            quote_asset: quote_asset.to_uppercase(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> PairKey {
        PairKey::new(&self.pair, &self.exchange)
    }

    pub fn is_enabled(&self) -> bool {
        self.status == Status::Enabled
    }
}

/// An exchange order, optionally enrolled in stop-loss/take-profit automation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub order_id: u64,
    pub pair: String,
    pub exchange: String,
    pub side: Side,
    pub status: OrderStatus,
    pub price: f64,
    pub quantity: f64,
    pub total: f64,
    /// Percentage below (BUY) or above (SELL) the fill price
    pub stoploss: f64,
    pub takeprofit: f64,
    pub ref_enabled: bool,
    pub ref_side: Option<Side>,
    pub ref_tripped: Option<String>,
    pub ref_order_id: u64,
    pub auto_repeat: u32,
    pub auto_repeat_id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn key(&self) -> OrderKey {
        OrderKey {
            order_id: self.order_id,
            exchange: self.exchange.to_lowercase(),
        }
    }

    /// True when the order is a candidate for a stop-loss/take-profit trip
    pub fn is_automation_candidate(&self) -> bool {
        self.status == OrderStatus::Filled
            && self.ref_enabled
            && (self.stoploss > 0.0 || self.takeprofit > 0.0)
            && self.ref_side.is_none()
            && self.ref_tripped.as_deref().map_or(true, str::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderKey {
    pub order_id: u64,
    pub exchange: String,
}

impl OrderKey {
    pub fn new(order_id: u64, exchange: &str) -> Self {
        Self {
            order_id,
            exchange: exchange.to_lowercase(),
        }
    }
}

/// Request to place a limit order through an exchange adapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub pair: String,
    pub exchange: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub stoploss: f64,
    pub takeprofit: f64,
    pub ref_order_id: u64,
    pub auto_repeat: u32,
    pub auto_repeat_id: u64,
}

/// Account balance of one asset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    pub symbol: String,
    pub exchange: String,
    pub free: f64,
    pub locked: f64,
    pub status: Status,
}

impl Asset {
    pub fn new(symbol: &str, exchange: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            exchange: exchange.to_lowercase(),
            free: 0.0,
            locked: 0.0,
            status: Status::Enabled,
        }
    }

    pub fn key(&self) -> AssetKey {
        AssetKey {
            symbol: self.symbol.to_uppercase(),
            exchange: self.exchange.to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetKey {
    pub symbol: String,
    pub exchange: String,
}

impl AssetKey {
    pub fn new(symbol: &str, exchange: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            exchange: exchange.to_lowercase(),
        }
    }
}

/// One price level with running totals from the top of book
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderBookLevel {
    pub price: f64,
    pub quantity: f64,
    pub base_total: f64,
    pub quote_total: f64,
    /// Share of the side's base total up to and including this level
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OrderBook {
    pub pair: String,
    pub exchange: String,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub bids_base_total: f64,
    pub asks_base_total: f64,
    pub bids_quote_total: f64,
    pub asks_quote_total: f64,
}

impl OrderBook {
    /// Build a snapshot from raw (price, quantity) levels
    ///
    /// Bids are sorted descending and asks ascending before totals are accumulated.
    pub fn from_levels(
        pair: &str,
        exchange: &str,
        mut bids: Vec<(f64, f64)>,
        mut asks: Vec<(f64, f64)>,
    ) -> Self {
        bids.retain(|(_, qty)| *qty > 0.0);
        asks.retain(|(_, qty)| *qty > 0.0);
        bids.sort_by(|a, b| b.0.total_cmp(&a.0));
        asks.sort_by(|a, b| a.0.total_cmp(&b.0));

        let (bids, bids_base_total, bids_quote_total) = accumulate(&bids);
        let (asks, asks_base_total, asks_quote_total) = accumulate(&asks);
        let key = PairKey::new(pair, exchange);

        Self {
            pair: key.pair,
            exchange: key.exchange,
            bids,
            asks,
            bids_base_total,
            asks_base_total,
            bids_quote_total,
            asks_quote_total,
        }
    }

    pub fn key(&self) -> PairKey {
        PairKey::new(&self.pair, &self.exchange)
    }

    pub fn best_bid(&self) -> f64 {
        self.bids.first().map(|l| l.price).unwrap_or(0.0)
    }

    pub fn best_ask(&self) -> f64 {
        self.asks.first().map(|l| l.price).unwrap_or(0.0)
    }
}

fn accumulate(levels: &[(f64, f64)]) -> (Vec<OrderBookLevel>, f64, f64) {
    let base_sum: f64 = levels.iter().map(|(_, qty)| qty).sum();

    let mut base_total = 0.0;
    let mut quote_total = 0.0;
    let mut out = Vec::with_capacity(levels.len());

    for (price, quantity) in levels {
        base_total += quantity;
        quote_total += price * quantity;
        let percentage = if base_sum > 0.0 {
            truncate(base_total / base_sum * 100.0, 3)
        } else {
            0.0
        };
        out.push(OrderBookLevel {
            price: *price,
            quantity: *quantity,
            base_total,
            quote_total,
            percentage,
        });
    }

    (out, base_total, quote_total)
}

/// Executed trade from the aggregated trade stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub pair: String,
    pub exchange: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub trade_id: u64,
    pub trade_time: DateTime<Utc>,
}

/// Output of one Opportunity Detector evaluation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Opportunity {
    pub id: Uuid,
    pub pair: String,
    pub exchange: String,
    pub timeframe: String,
    pub action: Option<Side>,
    pub price: f64,
    pub stoploss: f64,
    pub takeprofit: f64,
    /// Rule name -> passed, per side
    pub analysis: BTreeMap<String, BTreeMap<String, bool>>,
    pub created_at: DateTime<Utc>,
}

/// Operator-facing message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_normalizes_case() {
        let key = PairKey::new("btcusdt", "Binance");
        assert_eq!(key.pair, "BTCUSDT");
        assert_eq!(key.exchange, "binance");
        assert_eq!(key.to_string(), "BTCUSDT-binance");
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::parse("sell"), Some(Side::Sell));
        assert_eq!(Side::parse("hold"), None);
    }

    #[test]
    fn test_order_status_parse() {
        assert_eq!(OrderStatus::parse("PARTIALLY_FILLED"), Some(OrderStatus::PartiallyFilled));
        assert_eq!(OrderStatus::parse("FILLED"), Some(OrderStatus::Filled));
        assert_eq!(OrderStatus::parse("TRADE"), None);
    }

    #[test]
    fn test_order_book_sorting_and_totals() {
        let book = OrderBook::from_levels(
            "BTCUSDT",
            "binance",
            vec![(99.0, 1.0), (100.0, 3.0), (98.0, 0.0)],
            vec![(102.0, 2.0), (101.0, 2.0)],
        );

        assert_eq!(book.best_bid(), 100.0);
        assert_eq!(book.best_ask(), 101.0);
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.bids_base_total, 4.0);
        assert_eq!(book.asks_base_total, 4.0);
        assert_eq!(book.bids[0].percentage, 75.0);
        assert_eq!(book.bids[1].percentage, 100.0);
        assert_eq!(book.asks_quote_total, 101.0 * 2.0 + 102.0 * 2.0);
    }

    #[test]
    fn test_empty_order_book() {
        let book = OrderBook::from_levels("BTCUSDT", "binance", vec![], vec![]);
        assert_eq!(book.best_bid(), 0.0);
        assert_eq!(book.best_ask(), 0.0);
        assert_eq!(book.bids_base_total, 0.0);
    }

    #[test]
    fn test_candle_shadows() {
        let candle = Candle {
            timestamp: Utc::now(),
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close: 11.0,
            volume: 1.0,
        };

        assert!(candle.is_bullish());
        assert_eq!(candle.body(), 1.0);
        assert_eq!(candle.upper_shadow(), 1.0);
        assert_eq!(candle.lower_shadow(), 1.0);
    }
}
