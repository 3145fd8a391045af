use crate::models::{Candle, PairKey};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

/// History is kept per pair, exchange and interval
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandleKey {
    pub pair: PairKey,
    pub interval: String,
}

impl CandleKey {
    pub fn new(pair: &PairKey, interval: &str) -> Self {
        Self {
            pair: pair.clone(),
            interval: interval.to_string(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.pair.exchange, self.pair.pair, self.interval)
    }
}

/// Thread-safe in-memory buffer for candle data
///
/// Maintains a rolling window of candles for each pair and interval
#[derive(Clone)]
pub struct CandleBuffer {
    data: Arc<RwLock<HashMap<CandleKey, VecDeque<Candle>>>>,
    max_candles: usize,
}

impl CandleBuffer {
    /// Create a new candle buffer
    ///
    /// # Arguments
    /// * `max_candles` - Maximum number of candles to keep per key
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_candles,
        }
    }

    /// Merge a candle into the history
    ///
    /// A candle with the same open time as the newest one replaces it
    /// (live kline updates); older candles are ignored. If the buffer is
    /// full, removes the oldest candle.
    pub fn add_candle(&self, key: &CandleKey, candle: Candle) -> Result<(), String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;

        let candles = data.entry(key.clone()).or_default();

        match candles.back().map(|last| last.timestamp) {
            Some(newest) if newest == candle.timestamp => {
                candles.pop_back();
                candles.push_back(candle);
            }
            Some(newest) if newest > candle.timestamp => {}
            _ => candles.push_back(candle),
        }

        while candles.len() > self.max_candles {
            candles.pop_front();
        }

        Ok(())
    }

    /// Replace the whole history, e.g. after a REST backfill
    pub fn replace(&self, key: &CandleKey, mut candles: Vec<Candle>) -> Result<(), String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;

        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        let skip = candles.len().saturating_sub(self.max_candles);

        data.insert(key.clone(), candles.into_iter().skip(skip).collect());
        Ok(())
    }

    /// Get all candles for a key
    pub fn get_candles(&self, key: &CandleKey) -> Result<Vec<Candle>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;

        Ok(data
            .get(key)
            .map(|deque| deque.iter().cloned().collect())
            .unwrap_or_default())
    }

    #[cfg(test)]
    pub fn candle_count(&self, key: &CandleKey) -> Result<usize, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.get(key).map(|d| d.len()).unwrap_or(0))
    }
}
