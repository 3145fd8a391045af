//! Indicator Engine service
//!
//! Owns the candle history, turns it into per-interval Summaries and the
//! weighted aggregate trend, and writes the results back into the registries.

use crate::exchange::ExchangeAdapter;
use crate::execution::candle_buffer::{CandleBuffer, CandleKey};
use crate::indicators::{trading_summary, weighted_trend, IndicatorConfig, IndicatorError, Summary};
use crate::models::{AggregateTrend, Candle, Market, PairKey};
use crate::registry::Registries;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// All Summaries of one pair plus the multi-timeframe verdict
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Analysis {
    pub pair: String,
    pub exchange: String,
    pub trend: AggregateTrend,
    pub summaries: BTreeMap<String, Summary>,
    pub updated_at: DateTime<Utc>,
}

impl Analysis {
    pub fn summary(&self, interval: &str) -> Option<&Summary> {
        self.summaries.get(interval)
    }
}

/// Live kline forwarded by ingestion
#[derive(Debug, Clone)]
pub struct KlineTick {
    pub market: Market,
    pub interval: String,
    pub candle: Candle,
}

#[derive(Clone)]
pub struct IndicatorEngine {
    registries: Registries,
    buffer: CandleBuffer,
    config: IndicatorConfig,
    intervals: Vec<String>,
    /// Interval whose bands and RSI are mirrored onto the Market
    primary_interval: String,
}

impl IndicatorEngine {
    pub fn new(
        registries: Registries,
        buffer: CandleBuffer,
        config: IndicatorConfig,
        mut intervals: Vec<String>,
        primary_interval: &str,
    ) -> Self {
        if !intervals.iter().any(|i| i == primary_interval) {
            intervals.insert(0, primary_interval.to_string());
        }

        Self {
            registries,
            buffer,
            config,
            intervals,
            primary_interval: primary_interval.to_string(),
        }
    }

    pub fn intervals(&self) -> &[String] {
        &self.intervals
    }

    /// Replace the history of one interval
    pub fn ingest_history(&self, key: &PairKey, interval: &str, candles: Vec<Candle>) -> Result<()> {
        self.buffer.replace(&CandleKey::new(key, interval), candles)?;
        Ok(())
    }

    /// Merge a live candle into the history
    pub fn apply_kline(&self, key: &PairKey, interval: &str, candle: Candle) -> Result<()> {
        self.buffer.add_candle(&CandleKey::new(key, interval), candle)?;
        Ok(())
    }

    /// Rebuild the Analysis of a pair from the buffered history
    ///
    /// Intervals without enough history are skipped. Returns `None` when no
    /// interval could be summarized.
    pub fn recompute(&self, key: &PairKey) -> Result<Option<Analysis>> {
        let mut summaries = BTreeMap::new();

        for interval in &self.intervals {
            let candles = self.buffer.get_candles(&CandleKey::new(key, interval))?;
            match trading_summary(interval, &candles, &self.config) {
                Ok(summary) => {
                    summaries.insert(interval.clone(), summary);
                }
                Err(IndicatorError::InsufficientData { required, available, .. }) => {
                    tracing::debug!(
                        pair = %key,
                        interval = %interval,
                        required,
                        available,
                        "Skipping interval with insufficient history"
                    );
                }
            }
        }

        if summaries.is_empty() {
            return Ok(None);
        }

        let trend = weighted_trend(summaries.iter().map(|(interval, s)| (interval.as_str(), s.trend)));

        if let Some(primary) = summaries.get(&self.primary_interval) {
            let (bands, rsi) = (primary.bollinger, primary.rsi);
            self.registries.markets.update(key, |market| {
                market.upper_band = bands.upper;
                market.middle_band = bands.middle;
                market.lower_band = bands.lower;
                market.rsi = rsi;
            });
        }

        let analysis = Analysis {
            pair: key.pair.clone(),
            exchange: key.exchange.clone(),
            trend,
            summaries,
            updated_at: Utc::now(),
        };
        self.registries.analyses.upsert(analysis.clone());

        Ok(Some(analysis))
    }

    /// Fetch REST history for every interval of a pair
    ///
    /// Returns how many intervals were loaded; failed intervals are logged.
    pub async fn backfill(&self, adapter: &dyn ExchangeAdapter, key: &PairKey, limit: usize) -> usize {
        let mut loaded = 0;

        for interval in &self.intervals {
            match adapter.klines(&key.pair, interval, limit).await {
                Ok(candles) => {
                    let count = candles.len();
                    if let Err(e) = self.ingest_history(key, interval, candles) {
                        tracing::warn!(pair = %key, interval = %interval, error = %e, "Failed to store klines");
                        continue;
                    }
                    tracing::debug!(pair = %key, interval = %interval, count, "Backfilled klines");
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(pair = %key, interval = %interval, error = %e, "Kline backfill failed");
                }
            }
        }

        loaded
    }

    /// Consume live klines until the channel closes
    ///
    /// Each tick updates the history and the Analysis, then the refreshed
    /// Market is offered to the Opportunity Detector without blocking.
    pub async fn run(self, mut rx: mpsc::Receiver<KlineTick>, detector_tx: mpsc::Sender<Market>) {
        tracing::info!("📈 Indicator engine started ({} intervals)", self.intervals.len());

        while let Some(tick) = rx.recv().await {
            let key = tick.market.key();

            if let Err(e) = self.apply_kline(&key, &tick.interval, tick.candle) {
                tracing::warn!(pair = %key, error = %e, "Failed to apply kline");
                continue;
            }

            match self.recompute(&key) {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(pair = %key, error = %e, "Recompute failed");
                    continue;
                }
            }

            let market = self.registries.markets.get(&key).unwrap_or(tick.market);
            if let Err(e) = detector_tx.try_send(market) {
                tracing::debug!(pair = %key, error = %e, "Detector trigger dropped");
            }
        }

        tracing::info!("Indicator engine stopped");
    }

    /// Periodically backfill and recompute every enabled market of an exchange
    pub async fn refresh_loop(self, adapter: Arc<dyn ExchangeAdapter>, every: Duration, limit: usize) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            for market in self.registries.enabled_markets(adapter.name()) {
                let key = market.key();
                if self.backfill(adapter.as_ref(), &key, limit).await == 0 {
                    continue;
                }
                if let Err(e) = self.recompute(&key) {
                    tracing::warn!(pair = %key, error = %e, "Refresh recompute failed");
                }
            }
        }
    }
}
