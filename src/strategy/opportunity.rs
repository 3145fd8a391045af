use crate::analysis::Analysis;
use crate::indicators::precision::tick_tolerance;
use crate::indicators::Summary;
use crate::models::{Market, Opportunity, PairKey, Side, Trend};
use crate::notify::NotificationSender;
use crate::persistence::{PersistRecord, PersistSender};
use crate::registry::Registries;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq)]
pub enum OpportunityError {
    #[error("unknown timeframe: {0}")]
    UnknownTimeframe(String),
}

/// Thresholds and timeframes for opportunity detection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OpportunityConfig {
    /// Timeframes evaluated on every market trigger
    pub timeframes: Vec<String>,
    pub buy_rsi_max: f64,
    pub sell_rsi_min: f64,
}

impl Default for OpportunityConfig {
    fn default() -> Self {
        Self {
            timeframes: vec!["1m".to_string()],
            buy_rsi_max: 35.0,
            sell_rsi_min: 65.0,
        }
    }
}

/// (short, medium, long) intervals backing a timeframe
pub fn timeframe_intervals(timeframe: &str) -> Result<[&'static str; 3], OpportunityError> {
    let intervals = match timeframe {
        "1m" => ["1m", "5m", "15m"],
        "3m" => ["3m", "15m", "1h"],
        "5m" => ["5m", "15m", "1h"],
        "15m" => ["15m", "1h", "4h"],
        "30m" => ["30m", "2h", "6h"],
        "1h" => ["1h", "4h", "12h"],
        "4h" => ["4h", "12h", "1d"],
        "1d" => ["1d", "3d", "1w"],
        other => return Err(OpportunityError::UnknownTimeframe(other.to_string())),
    };
    Ok(intervals)
}

/// Every interval the given timeframes need, deduplicated in first-seen order
pub fn required_intervals(timeframes: &[String]) -> Result<Vec<String>, OpportunityError> {
    let mut intervals: Vec<String> = Vec::new();
    for timeframe in timeframes {
        for interval in timeframe_intervals(timeframe)? {
            if !intervals.iter().any(|i| i == interval) {
                intervals.push(interval.to_string());
            }
        }
    }
    Ok(intervals)
}

type RuleSet = BTreeMap<String, bool>;

fn rule_set(rules: [(&str, bool); 5]) -> RuleSet {
    rules.into_iter().map(|(name, passed)| (name.to_string(), passed)).collect()
}

fn fired(rules: &RuleSet) -> bool {
    !rules.is_empty() && rules.values().all(|passed| *passed)
}

fn has_tag(summaries: [&Summary; 3], tag: &str) -> bool {
    let [short, _, _] = summaries;
    summaries
        .iter()
        .filter_map(|s| s.candle_pattern.as_deref())
        .chain(short.chart_pattern.as_deref())
        .any(|pattern| pattern.contains(tag))
}

fn bands_align(a: Option<f64>, b: Option<f64>, tolerance: f64) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() <= tolerance,
        _ => false,
    }
}

fn buy_rules(summaries: [&Summary; 3], price: f64, config: &OpportunityConfig, tolerance: f64) -> RuleSet {
    let short = summaries[0];
    rule_set([
        ("rsi", short.rsi <= config.buy_rsi_max),
        ("fibonacci", short.retracement.contains(price)),
        (
            "alignment",
            bands_align(
                short.short.map(|b| b.support),
                short.medium.map(|b| b.support),
                tolerance,
            ),
        ),
        ("bollinger", short.candle.low <= short.bollinger.lower),
        (
            "pattern",
            short.trend_at(price) != Trend::Bullish && has_tag(summaries, "Bullish"),
        ),
    ])
}

fn sell_rules(summaries: [&Summary; 3], price: f64, config: &OpportunityConfig, tolerance: f64) -> RuleSet {
    let short = summaries[0];
    rule_set([
        ("rsi", short.rsi >= config.sell_rsi_min),
        ("fibonacci", short.retracement.contains(price)),
        (
            "alignment",
            bands_align(
                short.short.map(|b| b.resistance),
                short.medium.map(|b| b.resistance),
                tolerance,
            ),
        ),
        ("bollinger", short.candle.high >= short.bollinger.upper),
        (
            "pattern",
            short.trend_at(price) != Trend::Bearish && has_tag(summaries, "Bearish"),
        ),
    ])
}

/// Side whose rules all passed; contradicting sides cancel out
fn resolve(buy: &RuleSet, sell: &RuleSet) -> Option<Side> {
    match (fired(buy), fired(sell)) {
        (true, false) => Some(Side::Buy),
        (false, true) => Some(Side::Sell),
        _ => None,
    }
}

/// Stoploss and takeprofit for a fired side, if both bands exist
fn targets(side: Side, short: &Summary, medium: &Summary) -> Option<(f64, f64)> {
    match side {
        Side::Buy => Some((short.medium?.support, medium.short?.resistance)),
        Side::Sell => Some((short.medium?.resistance, medium.short?.support)),
    }
}

fn brackets(side: Side, price: f64, stoploss: f64, takeprofit: f64) -> bool {
    match side {
        Side::Buy => stoploss < price && price < takeprofit,
        Side::Sell => takeprofit < price && price < stoploss,
    }
}

/// Evaluate one timeframe of an Analysis against a live price
///
/// Never fails for missing data: an incomplete Analysis yields an
/// Opportunity without an action. A `price` of 0 falls back to the short
/// interval's latest close.
pub fn assess(
    analysis: &Analysis,
    timeframe: &str,
    price: f64,
    config: &OpportunityConfig,
) -> Result<Opportunity, OpportunityError> {
    let [short_iv, medium_iv, long_iv] = timeframe_intervals(timeframe)?;

    let mut opportunity = Opportunity {
        id: Uuid::new_v4(),
        pair: analysis.pair.clone(),
        exchange: analysis.exchange.clone(),
        timeframe: timeframe.to_string(),
        action: None,
        price,
        stoploss: 0.0,
        takeprofit: 0.0,
        analysis: BTreeMap::new(),
        created_at: Utc::now(),
    };

    let (Some(short), Some(medium), Some(long)) = (
        analysis.summary(short_iv),
        analysis.summary(medium_iv),
        analysis.summary(long_iv),
    ) else {
        return Ok(opportunity);
    };

    let price = if price > 0.0 { price } else { short.candle.close };
    opportunity.price = price;

    let candle = &short.candle;
    let tolerance = tick_tolerance(&[candle.open, candle.high, candle.low, candle.close]) * (1.0 + 1e-6);
    let summaries = [short, medium, long];

    let buy = buy_rules(summaries, price, config, tolerance);
    let sell = sell_rules(summaries, price, config, tolerance);

    let action = resolve(&buy, &sell);

    opportunity.analysis.insert(Side::Buy.to_string(), buy);
    opportunity.analysis.insert(Side::Sell.to_string(), sell);

    if let Some(side) = action {
        match targets(side, short, medium) {
            Some((stoploss, takeprofit)) if brackets(side, price, stoploss, takeprofit) => {
                opportunity.action = Some(side);
                opportunity.stoploss = stoploss;
                opportunity.takeprofit = takeprofit;
            }
            _ => {
                tracing::debug!(
                    pair = %analysis.pair,
                    timeframe,
                    side = %side,
                    "Targets do not bracket price, dropping signal"
                );
            }
        }
    }

    Ok(opportunity)
}

/// Human-readable line for a fired opportunity
pub fn describe(opportunity: &Opportunity) -> String {
    let action = opportunity.action.map_or("NONE", Side::as_str);
    format!(
        "{} {} [{}] @ {:.8} SL: {:.8} TP: {:.8}",
        action,
        opportunity.pair,
        opportunity.timeframe,
        opportunity.price,
        opportunity.stoploss,
        opportunity.takeprofit
    )
}

/// Pair and timeframe a notification was sent for
type SignalKey = (PairKey, String);

/// Turns refreshed Analyses into notified BUY/SELL opportunities
#[derive(Clone)]
pub struct OpportunityDetector {
    registries: Registries,
    config: OpportunityConfig,
    notifier: NotificationSender,
    persist: PersistSender,
    last_notified: Arc<Mutex<HashMap<SignalKey, Side>>>,
}

impl OpportunityDetector {
    pub fn new(
        registries: Registries,
        config: OpportunityConfig,
        notifier: NotificationSender,
        persist: PersistSender,
    ) -> Self {
        Self {
            registries,
            config,
            notifier,
            persist,
            last_notified: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Read-only evaluation of the stored Analysis
    ///
    /// Returns `Ok(None)` when the pair has no Analysis or Market yet.
    pub fn assess(&self, key: &PairKey, timeframe: &str) -> Result<Option<Opportunity>, OpportunityError> {
        let Some(analysis) = self.registries.analyses.get(key) else {
            return Ok(None);
        };
        let price = self.registries.markets.get(key).map_or(0.0, |m| m.price);

        assess(&analysis, timeframe, price, &self.config).map(Some)
    }

    /// Evaluate every configured timeframe for a refreshed Market
    ///
    /// Fired actions are notified and persisted once per candle and timeframe.
    pub fn evaluate_market(&self, market: &Market) -> Vec<Opportunity> {
        let key = market.key();
        let Some(analysis) = self.registries.analyses.get(&key) else {
            return Vec::new();
        };

        let mut results = Vec::with_capacity(self.config.timeframes.len());

        for timeframe in &self.config.timeframes {
            let opportunity = match assess(&analysis, timeframe, market.price, &self.config) {
                Ok(opportunity) => opportunity,
                Err(e) => {
                    tracing::warn!(pair = %key, error = %e, "Skipping timeframe");
                    continue;
                }
            };

            if let Some(action) = opportunity.action {
                if self.notify_once(&key, action, &opportunity) {
                    self.persist.send(PersistRecord::Opportunity(opportunity.clone()));
                }
            }

            results.push(opportunity);
        }

        if market.closed {
            self.lock().retain(|(pair, _), _| pair != &key);
        }

        results
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SignalKey, Side>> {
        self.last_notified.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` when a notification was sent
    fn notify_once(&self, key: &PairKey, action: Side, opportunity: &Opportunity) -> bool {
        let signal_key = (key.clone(), opportunity.timeframe.clone());
        let mut last = self.lock();

        if last.get(&signal_key).is_some_and(|prev| *prev == action) {
            tracing::debug!(
                pair = %key,
                timeframe = %opportunity.timeframe,
                action = %action,
                "Opportunity already notified for this candle"
            );
            return false;
        }

        let message = describe(opportunity);
        tracing::info!(pair = %key, timeframe = %opportunity.timeframe, "🎯 {}", message);
        self.notifier.send("Opportunity", message);
        last.insert(signal_key, action);

        true
    }

    /// Consume Market triggers until the channel closes
    pub async fn run(self, mut rx: mpsc::Receiver<Market>) {
        tracing::info!("🔍 Opportunity detector started ({:?})", self.config.timeframes);

        while let Some(market) = rx.recv().await {
            self.evaluate_market(&market);
        }

        tracing::info!("Opportunity detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{trading_summary, IndicatorConfig};
    use crate::models::{AggregateTrend, Candle, Notification};
    use chrono::{Duration, TimeZone};

    fn create_test_candle(i: usize, open: f64, close: f64) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::minutes(i as i64),
            open,
            high: open.max(close) + 0.5,
            low: open.min(close) - 0.5,
            close,
            volume: 1000.0,
        }
    }

    /// 20 rising candles capped by a bearish engulfing reversal
    fn reversal_history() -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..20)
            .map(|i| create_test_candle(i, 100.0 + i as f64, 101.0 + i as f64))
            .collect();
        candles.push(Candle {
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::minutes(20),
            open: 120.5,
            high: 124.0,
            low: 116.0,
            close: 118.5,
            volume: 1000.0,
        });
        candles
    }

    fn create_test_analysis(intervals: &[&str], candles: &[Candle]) -> Analysis {
        let config = IndicatorConfig::default();
        let summaries = intervals
            .iter()
            .map(|iv| (iv.to_string(), trading_summary(iv, candles, &config).unwrap()))
            .collect();

        Analysis {
            pair: "BTCUSDT".to_string(),
            exchange: "binance".to_string(),
            trend: AggregateTrend::Bullish,
            summaries,
            updated_at: Utc::now(),
        }
    }

    fn detector() -> (OpportunityDetector, mpsc::Receiver<Notification>, Registries) {
        let registries = Registries::new();
        let (notifier, rx) = NotificationSender::channel(16);
        let detector = OpportunityDetector::new(
            registries.clone(),
            OpportunityConfig::default(),
            notifier,
            PersistSender::disabled(),
        );
        (detector, rx, registries)
    }

    #[test]
    fn test_timeframe_table() {
        assert_eq!(timeframe_intervals("1m").unwrap(), ["1m", "5m", "15m"]);
        assert_eq!(timeframe_intervals("30m").unwrap(), ["30m", "2h", "6h"]);
        assert_eq!(timeframe_intervals("1d").unwrap(), ["1d", "3d", "1w"]);
        assert_eq!(
            timeframe_intervals("2m"),
            Err(OpportunityError::UnknownTimeframe("2m".to_string()))
        );
    }

    #[test]
    fn test_required_intervals_are_deduplicated() {
        let intervals = required_intervals(&["1m".to_string(), "5m".to_string()]).unwrap();
        assert_eq!(intervals, vec!["1m", "5m", "15m", "1h"]);
    }

    #[test]
    fn test_reversal_produces_sell() {
        let analysis = create_test_analysis(&["1m", "5m", "15m"], &reversal_history());
        let opportunity = assess(&analysis, "1m", 0.0, &OpportunityConfig::default()).unwrap();

        assert_eq!(opportunity.action, Some(Side::Sell));
        assert_eq!(opportunity.price, 118.5);
        assert_eq!(opportunity.stoploss, 124.0);
        assert_eq!(opportunity.takeprofit, 110.5);
        assert!(opportunity.stoploss > opportunity.takeprofit);
        assert!(opportunity.analysis["SELL"].values().all(|passed| *passed));
        assert!(!opportunity.analysis["BUY"]["rsi"]);
    }

    #[test]
    fn test_missing_interval_is_no_signal() {
        let analysis = create_test_analysis(&["1m", "5m"], &reversal_history());
        let opportunity = assess(&analysis, "1m", 118.5, &OpportunityConfig::default()).unwrap();

        assert_eq!(opportunity.action, None);
        assert!(opportunity.analysis.is_empty());
    }

    #[test]
    fn test_price_outside_fibonacci_zone() {
        let analysis = create_test_analysis(&["1m", "5m", "15m"], &reversal_history());
        let opportunity = assess(&analysis, "1m", 123.0, &OpportunityConfig::default()).unwrap();

        assert_eq!(opportunity.action, None);
        assert!(!opportunity.analysis["SELL"]["fibonacci"]);
    }

    #[test]
    fn test_both_sides_firing_is_no_signal() {
        let all = |passed| rule_set([
            ("rsi", passed),
            ("fibonacci", true),
            ("alignment", true),
            ("bollinger", true),
            ("pattern", true),
        ]);

        assert_eq!(resolve(&all(true), &all(true)), None);
        assert_eq!(resolve(&all(true), &all(false)), Some(Side::Buy));
        assert_eq!(resolve(&all(false), &all(true)), Some(Side::Sell));
        assert_eq!(resolve(&BTreeMap::new(), &BTreeMap::new()), None);
    }

    #[test]
    fn test_loose_thresholds_keep_single_side() {
        let analysis = create_test_analysis(&["1m", "5m", "15m"], &reversal_history());
        let config = OpportunityConfig {
            buy_rsi_max: 100.0,
            sell_rsi_min: 0.0,
            ..OpportunityConfig::default()
        };

        let opportunity = assess(&analysis, "1m", 118.5, &config).unwrap();
        assert_eq!(opportunity.action, Some(Side::Sell));
        assert!(opportunity.analysis["BUY"]["rsi"]);
        assert!(!opportunity.analysis["BUY"]["alignment"]);
    }

    #[test]
    fn test_targets_must_bracket_price() {
        assert!(brackets(Side::Sell, 118.5, 124.0, 110.5));
        assert!(!brackets(Side::Sell, 118.5, 110.5, 124.0));
        assert!(brackets(Side::Buy, 100.0, 95.0, 105.0));
        assert!(!brackets(Side::Buy, 100.0, 100.0, 105.0));
    }

    #[test]
    fn test_unknown_timeframe() {
        let analysis = create_test_analysis(&["1m"], &reversal_history());
        let err = assess(&analysis, "7m", 0.0, &OpportunityConfig::default()).unwrap_err();
        assert_eq!(err.to_string(), "unknown timeframe: 7m");
    }

    #[tokio::test]
    async fn test_notifies_once_per_candle() {
        let (detector, mut rx, registries) = detector();
        registries
            .analyses
            .upsert(create_test_analysis(&["1m", "5m", "15m"], &reversal_history()));

        let mut market = Market::new("BTCUSDT", "binance", "BTC", "USDT");
        market.price = 118.5;

        let first = detector.evaluate_market(&market);
        let second = detector.evaluate_market(&market);
        assert_eq!(first[0].action, Some(Side::Sell));
        assert_eq!(second[0].action, Some(Side::Sell));

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.title, "Opportunity");
        assert!(notification.message.starts_with("SELL BTCUSDT [1m]"));
        assert!(rx.try_recv().is_err());

        // The closing tick is still suppressed, then clears the cache
        market.closed = true;
        detector.evaluate_market(&market);
        assert!(rx.try_recv().is_err());

        market.closed = false;
        detector.evaluate_market(&market);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_each_timeframe_notifies_once_per_candle() {
        let registries = Registries::new();
        let (notifier, mut rx) = NotificationSender::channel(16);
        let (persist, mut persist_rx) = PersistSender::channel(16);
        let config = OpportunityConfig {
            timeframes: vec!["1m".to_string(), "5m".to_string()],
            ..OpportunityConfig::default()
        };
        let detector = OpportunityDetector::new(registries.clone(), config, notifier, persist);
        registries
            .analyses
            .upsert(create_test_analysis(&["1m", "5m", "15m", "1h"], &reversal_history()));

        let mut market = Market::new("BTCUSDT", "binance", "BTC", "USDT");
        market.price = 118.5;

        let first = detector.evaluate_market(&market);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|o| o.action == Some(Side::Sell)));

        let mut messages = vec![rx.recv().await.unwrap().message, rx.recv().await.unwrap().message];
        messages.sort();
        assert!(messages[0].starts_with("SELL BTCUSDT [1m]"));
        assert!(messages[1].starts_with("SELL BTCUSDT [5m]"));

        // Later ticks of the same candle neither notify nor audit again
        detector.evaluate_market(&market);
        detector.evaluate_market(&market);
        assert!(rx.try_recv().is_err());

        let mut audited = 0;
        while let Ok(record) = persist_rx.try_recv() {
            assert!(matches!(record, PersistRecord::Opportunity(_)));
            audited += 1;
        }
        assert_eq!(audited, 2);

        market.closed = true;
        detector.evaluate_market(&market);
        assert!(rx.try_recv().is_err());
        assert!(detector.lock().is_empty());

        market.closed = false;
        detector.evaluate_market(&market);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert_eq!(detector.lock().len(), 2);
    }

    #[test]
    fn test_assess_has_no_side_effects() {
        let (detector, mut rx, registries) = detector();
        let key = PairKey::new("BTCUSDT", "binance");
        assert_eq!(detector.assess(&key, "1m"), Ok(None));

        registries
            .analyses
            .upsert(create_test_analysis(&["1m", "5m", "15m"], &reversal_history()));

        let opportunity = detector.assess(&key, "1m").unwrap().unwrap();
        assert_eq!(opportunity.action, Some(Side::Sell));
        assert!(rx.try_recv().is_err());
        assert!(detector.lock().is_empty());
    }
}
