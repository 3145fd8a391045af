//! Async persistence mirror
//!
//! Components hand records to a bounded channel; a single writer task
//! upserts them into Postgres and caches closed candles in Redis.

use crate::db::PostgresPersistence;
use crate::execution::candle_buffer::CandleKey;
use crate::models::{Asset, Candle, Market, Opportunity, Order};
use crate::Result;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{timeout, Duration};

/// Redis cache of closed candles
///
/// Uses sorted sets with open time (ms) as score, one per pair/exchange/interval.
#[derive(Clone)]
pub struct RedisCandleCache {
    conn: ConnectionManager,
}

fn cache_key(key: &CandleKey) -> String {
    format!("candles:{}:{}:{}", key.pair.exchange, key.pair.pair, key.interval)
}

impl RedisCandleCache {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    /// Store candles, replacing any entry with the same open time
    pub async fn save_candles(&mut self, key: &CandleKey, candles: &[Candle]) -> Result<()> {
        let redis_key = cache_key(key);

        for candle in candles {
            let value = serde_json::to_string(candle)?;
            let score = candle.timestamp.timestamp_millis() as f64;

            self.conn.zrembyscore::<_, _, _, ()>(&redis_key, score, score).await?;
            self.conn.zadd::<_, _, _, ()>(&redis_key, value, score).await?;
        }

        tracing::debug!("Cached {} candles for {}", candles.len(), key);

        Ok(())
    }

    /// Load the most recent `limit` candles, oldest first
    pub async fn load_candles(&mut self, key: &CandleKey, limit: usize) -> Result<Vec<Candle>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let results: Vec<String> = self
            .conn
            .zrange(cache_key(key), -(limit as isize), -1)
            .await?;

        let mut candles = Vec::with_capacity(results.len());
        for json_str in results {
            candles.push(serde_json::from_str::<Candle>(&json_str)?);
        }

        tracing::debug!("Loaded {} cached candles for {}", candles.len(), key);

        Ok(candles)
    }

    /// Keep only the newest `keep` candles
    pub async fn trim(&mut self, key: &CandleKey, keep: usize) -> Result<usize> {
        let stop = -(keep as isize) - 1;
        let removed: usize = self.conn.zremrangebyrank(cache_key(key), 0, stop).await?;

        if removed > 0 {
            tracing::debug!("Trimmed {} cached candles for {}", removed, key);
        }

        Ok(removed)
    }
}

/// Entity to mirror
#[derive(Debug, Clone)]
pub enum PersistRecord {
    Market(Market),
    Order(Order),
    Asset(Asset),
    Opportunity(Opportunity),
    Candle { key: CandleKey, candle: Candle },
}

impl PersistRecord {
    fn kind(&self) -> &'static str {
        match self {
            PersistRecord::Market(_) => "market",
            PersistRecord::Order(_) => "order",
            PersistRecord::Asset(_) => "asset",
            PersistRecord::Opportunity(_) => "opportunity",
            PersistRecord::Candle { .. } => "candle",
        }
    }
}

/// Non-blocking handle to the writer task
#[derive(Clone)]
pub struct PersistSender {
    tx: Option<mpsc::Sender<PersistRecord>>,
}

impl PersistSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PersistRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// Sender that discards every record
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Returns `false` when the record was dropped
    pub fn send(&self, record: PersistRecord) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };

        match tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                tracing::warn!(kind = record.kind(), "Persistence channel full, dropping record");
                false
            }
            Err(TrySendError::Closed(record)) => {
                tracing::debug!(kind = record.kind(), "Persistence writer stopped, dropping record");
                false
            }
        }
    }
}

/// Drains [`PersistRecord`]s into whichever stores are configured
pub struct PersistWriter {
    postgres: Option<PostgresPersistence>,
    redis: Option<RedisCandleCache>,
    candle_limit: usize,
}

impl PersistWriter {
    pub fn new(
        postgres: Option<PostgresPersistence>,
        redis: Option<RedisCandleCache>,
        candle_limit: usize,
    ) -> Self {
        Self {
            postgres,
            redis,
            candle_limit,
        }
    }

    async fn write(&mut self, record: &PersistRecord) -> Result<()> {
        match record {
            PersistRecord::Market(market) => {
                if let Some(db) = &self.postgres {
                    db.save_market(market).await?;
                }
            }
            PersistRecord::Order(order) => {
                if let Some(db) = &self.postgres {
                    db.save_order(order).await?;
                }
            }
            PersistRecord::Asset(asset) => {
                if let Some(db) = &self.postgres {
                    db.save_asset(asset).await?;
                }
            }
            PersistRecord::Opportunity(opportunity) => {
                if let Some(db) = &self.postgres {
                    db.save_opportunity(opportunity).await?;
                }
            }
            PersistRecord::Candle { key, candle } => {
                if let Some(cache) = &mut self.redis {
                    cache.save_candles(key, std::slice::from_ref(candle)).await?;
                    cache.trim(key, self.candle_limit).await?;
                }
            }
        }

        Ok(())
    }

    /// Consume records until every sender is dropped
    ///
    /// Failures are logged; in-memory state is never rolled back.
    pub async fn run(mut self, mut rx: mpsc::Receiver<PersistRecord>) {
        tracing::info!(
            "💾 Persistence writer started (postgres: {}, redis: {})",
            self.postgres.is_some(),
            self.redis.is_some()
        );

        while let Some(record) = rx.recv().await {
            if let Err(e) = self.write(&record).await {
                tracing::warn!(kind = record.kind(), error = %e, "Failed to persist record");
            }
        }

        tracing::info!("Persistence writer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PairKey;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn create_test_candle(minute: i64, price: f64) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + ChronoDuration::minutes(minute),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: price * 1000.0,
        }
    }

    fn test_key(pair: &str) -> CandleKey {
        CandleKey::new(&PairKey::new(pair, "binance"), "1m")
    }

    #[test]
    fn test_cache_key_layout() {
        assert_eq!(cache_key(&test_key("btcusdt")), "candles:binance:BTCUSDT:1m");
    }

    #[tokio::test]
    async fn test_sender_drops_when_full() {
        let (sender, mut rx) = PersistSender::channel(1);
        let market = Market::new("BTCUSDT", "binance", "BTC", "USDT");

        assert!(sender.send(PersistRecord::Market(market.clone())));
        assert!(!sender.send(PersistRecord::Market(market)));
        assert!(matches!(rx.recv().await, Some(PersistRecord::Market(_))));
    }

    #[test]
    fn test_disabled_sender() {
        let sender = PersistSender::disabled();
        assert!(!sender.send(PersistRecord::Asset(Asset::new("BTC", "binance"))));
    }

    #[tokio::test]
    async fn test_writer_without_stores_drains_channel() {
        let (sender, rx) = PersistSender::channel(4);
        let handle = tokio::spawn(PersistWriter::new(None, None, 10).run(rx));

        sender.send(PersistRecord::Candle {
            key: test_key("BTCUSDT"),
            candle: create_test_candle(0, 100.0),
        });
        drop(sender);

        handle.await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        // Try to connect to non-existent Redis
        let result = RedisCandleCache::new("redis://192.0.2.1:6379").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_save_replaces_same_open_time() {
        let mut cache = RedisCandleCache::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");
        let key = test_key("TESTREPLACE");
        let _ = cache.trim(&key, 0).await;

        cache.save_candles(&key, &[create_test_candle(0, 100.0)]).await.unwrap();
        cache.save_candles(&key, &[create_test_candle(0, 101.0)]).await.unwrap();

        let loaded = cache.load_candles(&key, 10).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].close, 101.0);

        let _ = cache.trim(&key, 0).await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_load_and_trim() {
        let mut cache = RedisCandleCache::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");
        let key = test_key("TESTTRIM");
        let _ = cache.trim(&key, 0).await;

        let candles: Vec<Candle> = (0..5).map(|i| create_test_candle(i, 100.0 + i as f64)).collect();
        cache.save_candles(&key, &candles).await.unwrap();

        let recent = cache.load_candles(&key, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        // Oldest first
        assert_eq!(recent[0].close, 103.0);
        assert_eq!(recent[1].close, 104.0);

        assert_eq!(cache.trim(&key, 3).await.unwrap(), 2);
        assert_eq!(cache.load_candles(&key, 10).await.unwrap().len(), 3);

        let _ = cache.trim(&key, 0).await;
    }
}
