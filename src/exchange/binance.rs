use super::{ExchangeAdapter, ExchangeError, ExecutionReport, FeedEvent, FeedKind};
use crate::models::{Candle, Order, OrderRequest, OrderStatus, Side, Trade};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const EXCHANGE: &str = "binance";
const MAX_RETRIES: u32 = 3;
const RECV_WINDOW: u64 = 60_000;

// Type alias for the rate limiter to simplify signatures
type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BinanceConfig {
    pub api_key: String,
    pub secret_key: String,
    pub rest_url: String,
    pub ws_url: String,
    pub requests_per_minute: u32,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            rest_url: "https://api.binance.com/api/v3".to_string(),
            ws_url: "wss://stream.binance.com:9443".to_string(),
            requests_per_minute: 1200,
        }
    }
}

impl BinanceConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }
}

/// Binance spot adapter
///
/// Cloneable; all clones share the rate limiter and the cached listen key.
#[derive(Clone)]
pub struct BinanceExchange {
    client: Client,
    config: BinanceConfig,
    kline_interval: String,
    rate_limiter: Arc<BinanceRateLimiter>,
    listen_key: Arc<Mutex<Option<String>>>,
}

/// HMAC-SHA256 signature of a query string, hex encoded
pub fn sign_query(secret: &str, query: &str) -> Result<String, ExchangeError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::MissingCredentials(format!("{EXCHANGE}: {e}")))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Price/quantity rendered without exponent or trailing zeros
fn format_decimal(value: f64) -> String {
    let formatted = format!("{:.8}", crate::indicators::truncate(value, 8));
    formatted.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Binance sends most numbers as strings
fn de_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Str(String),
        Num(f64),
    }

    match Number::deserialize(deserializer)? {
        Number::Str(s) => s.parse().map_err(D::Error::custom),
        Number::Num(n) => Ok(n),
    }
}

fn de_levels<'de, D>(deserializer: D) -> Result<Vec<(f64, f64)>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<(String, String)> = Vec::deserialize(deserializer)?;
    let mut levels = Vec::with_capacity(raw.len());

    for (price, qty) in raw {
        let price: f64 = price.parse().map_err(D::Error::custom)?;
        let qty: f64 = qty.parse().map_err(D::Error::custom)?;
        levels.push((price, qty));
    }

    Ok(levels)
}

/// Combined stream wrapper
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    stream: Option<String>,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o", deserialize_with = "de_number")]
    open: f64,
    #[serde(rename = "h", deserialize_with = "de_number")]
    high: f64,
    #[serde(rename = "l", deserialize_with = "de_number")]
    low: f64,
    #[serde(rename = "c", deserialize_with = "de_number")]
    close: f64,
    #[serde(rename = "v", deserialize_with = "de_number")]
    volume: f64,
    #[serde(rename = "q", deserialize_with = "de_number")]
    quote_volume: f64,
    #[serde(rename = "n")]
    trades: u64,
    #[serde(rename = "x")]
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct AggTradeEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "a")]
    trade_id: u64,
    #[serde(rename = "p", deserialize_with = "de_number")]
    price: f64,
    #[serde(rename = "q", deserialize_with = "de_number")]
    quantity: f64,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Debug, Deserialize)]
struct DepthPayload {
    #[serde(deserialize_with = "de_levels")]
    bids: Vec<(f64, f64)>,
    #[serde(deserialize_with = "de_levels")]
    asks: Vec<(f64, f64)>,
}

#[derive(Debug, Deserialize)]
struct AccountPositionEvent {
    #[serde(rename = "B")]
    balances: Vec<BalancePayload>,
}

#[derive(Debug, Deserialize)]
struct BalancePayload {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "f", deserialize_with = "de_number")]
    free: f64,
    #[serde(rename = "l", deserialize_with = "de_number")]
    locked: f64,
}

#[derive(Debug, Deserialize)]
struct BalanceUpdateEvent {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "d", deserialize_with = "de_number")]
    delta: f64,
}

#[derive(Debug, Deserialize)]
struct ExecutionReportEvent {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "i")]
    order_id: u64,
    #[serde(rename = "p", deserialize_with = "de_number")]
    price: f64,
    #[serde(rename = "q", deserialize_with = "de_number")]
    quantity: f64,
    #[serde(rename = "L", deserialize_with = "de_number")]
    last_price: f64,
    #[serde(rename = "z", deserialize_with = "de_number")]
    executed_quantity: f64,
    #[serde(rename = "Z", deserialize_with = "de_number")]
    cumulative_quote: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderAck {
    order_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload {
    symbol: String,
    order_id: u64,
    #[serde(deserialize_with = "de_number")]
    price: f64,
    #[serde(deserialize_with = "de_number")]
    orig_qty: f64,
    #[serde(rename = "cummulativeQuoteQty", deserialize_with = "de_number")]
    cumulative_quote: f64,
    status: String,
    side: String,
    time: i64,
    update_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKey {
    listen_key: String,
}

fn parse_side(value: &str) -> Result<Side, ExchangeError> {
    Side::parse(value).ok_or_else(|| ExchangeError::Decode(format!("unknown side {value}")))
}

fn parse_status(value: &str) -> Result<OrderStatus, ExchangeError> {
    OrderStatus::parse(value).ok_or_else(|| ExchangeError::Decode(format!("unknown order status {value}")))
}

fn parse_kline_row(row: &[serde_json::Value]) -> Result<Candle, ExchangeError> {
    let number = |idx: usize| -> Result<f64, ExchangeError> {
        match row.get(idx) {
            Some(serde_json::Value::String(s)) => s
                .parse()
                .map_err(|_| ExchangeError::Decode(format!("kline field {idx} is not a number"))),
            Some(serde_json::Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| ExchangeError::Decode(format!("kline field {idx} is not a number"))),
            _ => Err(ExchangeError::Decode(format!("kline field {idx} missing"))),
        }
    };

    let open_time = row
        .first()
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| ExchangeError::Decode("kline open time missing".to_string()))?;

    Ok(Candle {
        timestamp: ms_to_datetime(open_time),
        open: number(1)?,
        high: number(2)?,
        low: number(3)?,
        close: number(4)?,
        volume: number(5)?,
    })
}

impl BinanceExchange {
    pub fn new(config: BinanceConfig, kline_interval: &str) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let rpm = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            config,
            kline_interval: kline_interval.to_string(),
            rate_limiter,
            listen_key: Arc::new(Mutex::new(None)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.rest_url.trim_end_matches('/'), path)
    }

    fn credentials(&self) -> Result<(&str, &str), ExchangeError> {
        if !self.config.has_credentials() {
            return Err(ExchangeError::MissingCredentials(EXCHANGE.to_string()));
        }
        Ok((&self.config.api_key, &self.config.secret_key))
    }

    async fn api_error(response: reqwest::Response) -> ExchangeError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(err) => ExchangeError::Api {
                exchange: EXCHANGE.to_string(),
                code: err.code,
                message: err.msg,
            },
            Err(_) => ExchangeError::Api {
                exchange: EXCHANGE.to_string(),
                code: i64::from(status.as_u16()),
                message: body,
            },
        }
    }

    /// Rate-limited public GET with retry on 429 and 5xx
    async fn get_public<T: DeserializeOwned>(&self, url: &str) -> Result<T, ExchangeError> {
        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json::<T>().await?);
                    }

                    if (status.as_u16() == 429 || status.is_server_error()) && attempt < MAX_RETRIES {
                        let backoff_secs = 2u64.pow(attempt);
                        tracing::warn!(
                            "Binance returned {}, retrying in {}s (attempt {}/{})",
                            status,
                            backoff_secs,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                        continue;
                    }

                    return Err(Self::api_error(response).await);
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let backoff_secs = 2u64.pow(attempt);
                    tracing::warn!(
                        "Network error: {}, retrying in {}s (attempt {}/{})",
                        e,
                        backoff_secs,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ExchangeError::Api {
            exchange: EXCHANGE.to_string(),
            code: 0,
            message: format!("failed after {MAX_RETRIES} retries"),
        })
    }

    /// Signed request, never retried since order endpoints are not idempotent
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let (api_key, secret) = self.credentials()?;

        let mut query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>();
        query.push(format!("recvWindow={RECV_WINDOW}"));
        query.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        let query = query.join("&");

        let signature = sign_query(secret, &query)?;
        let url = format!("{}?{}&signature={}", self.url(path), query, signature);

        self.rate_limiter.until_ready().await;
        let response = self
            .client
            .request(method, url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        Ok(response.json::<T>().await?)
    }

    /// Request that only carries the API key header
    async fn keyed(&self, method: Method, url: String) -> Result<reqwest::Response, ExchangeError> {
        let (api_key, _) = self.credentials()?;

        self.rate_limiter.until_ready().await;
        let response = self
            .client
            .request(method, url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(response)
    }

    fn cached_key(&self) -> MutexGuard<'_, Option<String>> {
        self.listen_key.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached user-data listen key, created on first use
    async fn listen_key(&self) -> Result<String, ExchangeError> {
        let cached = self.cached_key().clone();
        if let Some(key) = cached {
            return Ok(key);
        }

        let response = self.keyed(Method::POST, self.url("/userDataStream")).await?;
        let key = response.json::<ListenKey>().await?.listen_key;

        *self.cached_key() = Some(key.clone());
        tracing::info!("🔑 Binance listen key created");
        Ok(key)
    }

    /// Forget the listen key so the next account subscription creates one
    fn invalidate_listen_key(&self) {
        if self.cached_key().take().is_some() {
            tracing::info!("Binance listen key invalidated");
        }
    }

    fn decode_event(&self, data: serde_json::Value) -> Result<Vec<FeedEvent>, ExchangeError> {
        let event_type = data.get("e").and_then(|e| e.as_str()).unwrap_or_default().to_string();

        let event = match event_type.as_str() {
            "kline" => {
                let event: KlineEvent = serde_json::from_value(data)?;
                let k = event.kline;
                FeedEvent::Kline {
                    pair: event.symbol.to_uppercase(),
                    interval: k.interval,
                    candle: Candle {
                        timestamp: ms_to_datetime(k.open_time),
                        open: k.open,
                        high: k.high,
                        low: k.low,
                        close: k.close,
                        volume: k.volume,
                    },
                    closed: k.closed,
                    quote_volume: k.quote_volume,
                    trades: k.trades,
                }
            }
            "aggTrade" => {
                let event: AggTradeEvent = serde_json::from_value(data)?;
                FeedEvent::Trade(Trade {
                    pair: event.symbol.to_uppercase(),
                    exchange: EXCHANGE.to_string(),
                    side: if event.buyer_is_maker { Side::Sell } else { Side::Buy },
                    price: event.price,
                    quantity: event.quantity,
                    trade_id: event.trade_id,
                    trade_time: ms_to_datetime(event.trade_time),
                })
            }
            "outboundAccountPosition" => {
                let event: AccountPositionEvent = serde_json::from_value(data)?;
                FeedEvent::AccountPosition {
                    balances: event
                        .balances
                        .into_iter()
                        .map(|b| (b.asset.to_uppercase(), b.free, b.locked))
                        .collect(),
                }
            }
            "balanceUpdate" => {
                let event: BalanceUpdateEvent = serde_json::from_value(data)?;
                FeedEvent::BalanceDelta {
                    symbol: event.asset.to_uppercase(),
                    delta: event.delta,
                }
            }
            "executionReport" => {
                let event: ExecutionReportEvent = serde_json::from_value(data)?;
                FeedEvent::Execution(ExecutionReport {
                    pair: event.symbol.to_uppercase(),
                    order_id: event.order_id,
                    side: parse_side(&event.side)?,
                    status: parse_status(&event.status)?,
                    price: event.price,
                    last_price: event.last_price,
                    quantity: event.quantity,
                    executed_quantity: event.executed_quantity,
                    cumulative_quote: event.cumulative_quote,
                    event_time: ms_to_datetime(event.event_time),
                })
            }
            "listenKeyExpired" => {
                self.invalidate_listen_key();
                FeedEvent::StreamExpired
            }
            other => {
                tracing::debug!(event = other, "Ignoring Binance event");
                return Ok(Vec::new());
            }
        };

        Ok(vec![event])
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceExchange {
    fn name(&self) -> &str {
        EXCHANGE
    }

    async fn stream_url(&self, feed: FeedKind, pairs: &[String]) -> Result<Option<String>, ExchangeError> {
        let streams: Vec<String> = match feed {
            FeedKind::Kline => pairs
                .iter()
                .map(|p| format!("{}@kline_{}", p.to_lowercase(), self.kline_interval))
                .collect(),
            FeedKind::Depth => pairs
                .iter()
                .map(|p| format!("{}@depth20@1000ms", p.to_lowercase()))
                .collect(),
            FeedKind::Trade => pairs.iter().map(|p| format!("{}@aggTrade", p.to_lowercase())).collect(),
            FeedKind::Account => {
                if !self.config.has_credentials() {
                    return Ok(None);
                }
                vec![self.listen_key().await?]
            }
        };

        if streams.is_empty() {
            return Ok(None);
        }

        Ok(Some(format!(
            "{}/stream?streams={}",
            self.config.ws_url.trim_end_matches('/'),
            streams.join("/")
        )))
    }

    fn decode(&self, feed: FeedKind, payload: &str) -> Result<Vec<FeedEvent>, ExchangeError> {
        let envelope: Envelope = serde_json::from_str(payload)?;

        if feed == FeedKind::Depth {
            let stream = envelope
                .stream
                .ok_or_else(|| ExchangeError::Decode("depth payload without stream name".to_string()))?;
            let pair = stream.split('@').next().unwrap_or_default().to_uppercase();
            let depth: DepthPayload = serde_json::from_value(envelope.data)?;

            return Ok(vec![FeedEvent::Depth {
                pair,
                bids: depth.bids,
                asks: depth.asks,
            }]);
        }

        self.decode_event(envelope.data)
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<u64, ExchangeError> {
        let params = [
            ("symbol", request.pair.to_uppercase()),
            ("side", request.side.as_str().to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", format_decimal(request.quantity)),
            ("price", format_decimal(request.price)),
        ];

        let ack: OrderAck = self.signed(Method::POST, "/order", &params).await?;
        Ok(ack.order_id)
    }

    async fn cancel_order(&self, pair: &str, order_id: u64) -> Result<(), ExchangeError> {
        let params = [("symbol", pair.to_uppercase()), ("orderId", order_id.to_string())];
        let _: serde_json::Value = self.signed(Method::DELETE, "/order", &params).await?;
        Ok(())
    }

    async fn query_order(&self, pair: &str, order_id: u64) -> Result<Order, ExchangeError> {
        let params = [("symbol", pair.to_uppercase()), ("orderId", order_id.to_string())];
        let payload: OrderPayload = self.signed(Method::GET, "/order", &params).await?;

        let total = if payload.cumulative_quote > 0.0 {
            payload.cumulative_quote
        } else {
            payload.price * payload.orig_qty
        };

        Ok(Order {
            order_id: payload.order_id,
            pair: payload.symbol.to_uppercase(),
            exchange: EXCHANGE.to_string(),
            side: parse_side(&payload.side)?,
            status: parse_status(&payload.status)?,
            price: payload.price,
            quantity: payload.orig_qty,
            total,
            stoploss: 0.0,
            takeprofit: 0.0,
            ref_enabled: false,
            ref_side: None,
            ref_tripped: None,
            ref_order_id: 0,
            auto_repeat: 0,
            auto_repeat_id: 0,
            created_at: ms_to_datetime(payload.time),
            updated_at: ms_to_datetime(payload.update_time),
        })
    }

    async fn klines(&self, pair: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let url = format!(
            "{}?symbol={}&interval={}&limit={}",
            self.url("/klines"),
            pair.to_uppercase(),
            interval,
            limit
        );

        let rows: Vec<Vec<serde_json::Value>> = self.get_public(&url).await?;
        rows.iter().map(|row| parse_kline_row(row)).collect()
    }

    async fn keep_alive(&self) -> Result<(), ExchangeError> {
        let cached = self.cached_key().clone();
        let Some(key) = cached else {
            return Ok(());
        };

        let url = format!("{}?listenKey={}", self.url("/userDataStream"), key);
        if let Err(e) = self.keyed(Method::PUT, url).await {
            self.invalidate_listen_key();
            return Err(e);
        }
        tracing::debug!("Binance listen key refreshed");
        Ok(())
    }
}
