//! Exchange adapters
//!
//! Every exchange implements [`ExchangeAdapter`]: order create/cancel/query,
//! kline history, and the stream side (subscription URL plus payload
//! decoding into exchange-neutral [`FeedEvent`]s).

pub mod binance;

use crate::models::{Candle, Order, OrderRequest, OrderStatus, Side, Trade};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use binance::{BinanceConfig, BinanceExchange};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{exchange} API error {code}: {message}")]
    Api {
        exchange: String,
        code: i64,
        message: String,
    },

    #[error("Failed to decode payload: {0}")]
    Decode(String),

    #[error("{exchange} has no {feed} feed")]
    UnsupportedFeed { exchange: String, feed: FeedKind },

    #[error("Missing API credentials for {0}")]
    MissingCredentials(String),
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        ExchangeError::Decode(e.to_string())
    }
}

/// One streaming subscription per kind and exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    Kline,
    Depth,
    Trade,
    Account,
}

impl FeedKind {
    pub const ALL: [FeedKind; 4] = [FeedKind::Kline, FeedKind::Depth, FeedKind::Trade, FeedKind::Account];

    pub fn as_str(self) -> &'static str {
        match self {
            FeedKind::Kline => "kline",
            FeedKind::Depth => "depth",
            FeedKind::Trade => "trade",
            FeedKind::Account => "account",
        }
    }
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order update pushed on the account stream
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub pair: String,
    pub order_id: u64,
    pub side: Side,
    pub status: OrderStatus,
    pub price: f64,
    pub last_price: f64,
    pub quantity: f64,
    pub executed_quantity: f64,
    pub cumulative_quote: f64,
    pub event_time: DateTime<Utc>,
}

/// Exchange-neutral stream event
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Kline {
        pair: String,
        interval: String,
        candle: Candle,
        closed: bool,
        quote_volume: f64,
        trades: u64,
    },
    Depth {
        pair: String,
        bids: Vec<(f64, f64)>,
        asks: Vec<(f64, f64)>,
    },
    Trade(Trade),
    /// Absolute free/locked balances per asset
    AccountPosition { balances: Vec<(String, f64, f64)> },
    /// Deposit/withdrawal delta applied to the free balance
    BalanceDelta { symbol: String, delta: f64 },
    Execution(ExecutionReport),
    /// Stream credentials expired; the feed must resubscribe
    StreamExpired,
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Lower-case exchange name used in every natural key
    fn name(&self) -> &str;

    /// Subscription URL for `pairs`, or `None` when there is nothing to subscribe
    async fn stream_url(&self, feed: FeedKind, pairs: &[String]) -> Result<Option<String>, ExchangeError>;

    /// Decode one text frame; control frames decode to no events
    fn decode(&self, feed: FeedKind, payload: &str) -> Result<Vec<FeedEvent>, ExchangeError>;

    async fn create_order(&self, request: &OrderRequest) -> Result<u64, ExchangeError>;

    async fn cancel_order(&self, pair: &str, order_id: u64) -> Result<(), ExchangeError>;

    async fn query_order(&self, pair: &str, order_id: u64) -> Result<Order, ExchangeError>;

    /// Closed and live candles, oldest first
    async fn klines(&self, pair: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError>;

    /// Refresh whatever keeps the account stream alive
    async fn keep_alive(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}
