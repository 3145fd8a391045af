use super::precision::truncate;
use crate::models::{AggregateTrend, Candle, Trend};
use serde::{Deserialize, Serialize};

/// Support/resistance envelope over one lookback window
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrendBand {
    pub period: usize,
    pub support: f64,
    pub resistance: f64,
    pub entry: f64,
    pub stoploss: f64,
    pub takeprofit: f64,
    /// (resistance - support) / support, in percent
    pub spread: f64,
}

/// Band over the last `period` candles
///
/// Returns `None` when the window is empty, longer than the history, or
/// the support is not a positive price.
pub fn analyze_trend(candles: &[Candle], period: usize) -> Option<TrendBand> {
    if period == 0 || candles.len() < period {
        return None;
    }

    let window = &candles[candles.len() - period..];
    let support = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let resistance = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let entry = window.iter().map(|c| c.close).sum::<f64>() / period as f64;

    if support <= 0.0 {
        return None;
    }

    Some(TrendBand {
        period,
        support: truncate(support, 8),
        resistance: truncate(resistance, 8),
        entry: truncate(entry, 8),
        stoploss: truncate(entry - (entry - support) * 0.5, 8),
        takeprofit: truncate(resistance + (resistance - entry) * 0.5, 8),
        spread: truncate((resistance - support) / support * 100.0, 3),
    })
}

/// Direction from the short/medium/long bands and the current price
///
/// Missing longer windows fall back to fewer comparisons; a missing short
/// window is always Neutral.
pub fn composite_trend(
    short: Option<&TrendBand>,
    medium: Option<&TrendBand>,
    long: Option<&TrendBand>,
    price: f64,
) -> Trend {
    let Some(short) = short else {
        return Trend::Neutral;
    };

    let (bullish, bearish) = match (medium, long) {
        (Some(medium), Some(long)) => (
            short.entry >= medium.entry && medium.entry >= long.entry,
            short.entry <= medium.entry && medium.entry <= long.entry,
        ),
        (Some(medium), None) => (short.entry >= medium.entry, short.entry <= medium.entry),
        (None, _) => (true, true),
    };

    if bullish && price >= short.entry {
        Trend::Bullish
    } else if bearish && price <= short.entry {
        Trend::Bearish
    } else {
        Trend::Neutral
    }
}

/// Weight of an interval in the multi-timeframe aggregate
pub fn interval_weight(interval: &str) -> u32 {
    match interval {
        "1m" | "3m" => 1,
        "5m" => 2,
        "15m" | "30m" => 3,
        "1h" | "2h" => 4,
        "4h" | "6h" => 5,
        "8h" | "12h" => 6,
        "1d" => 7,
        "3d" => 8,
        "1w" => 9,
        "1M" => 10,
        _ => 1,
    }
}

/// Classify `sum(sign * weight)` against the sum of weights that had data
pub fn weighted_trend<'a, I>(trends: I) -> AggregateTrend
where
    I: IntoIterator<Item = (&'a str, Trend)>,
{
    let (score, max_score) = trends.into_iter().fold((0i64, 0i64), |(score, max), (interval, trend)| {
        let weight = interval_weight(interval) as i64;
        (score + trend.sign() as i64 * weight, max + weight)
    });

    if max_score == 0 {
        return AggregateTrend::Neutral;
    }

    let ratio = score as f64 / max_score as f64;
    if ratio >= 0.7 {
        AggregateTrend::StrongBullish
    } else if ratio >= 0.3 {
        AggregateTrend::Bullish
    } else if ratio <= -0.7 {
        AggregateTrend::StrongBearish
    } else if ratio <= -0.3 {
        AggregateTrend::Bearish
    } else {
        AggregateTrend::Neutral
    }
}
