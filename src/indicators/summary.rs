use super::bollinger::{calculate_bollinger_bands, BollingerBands};
use super::candlestick::identify_candlestick_pattern;
use super::chart::{identify_chart_pattern, ChartWindow};
use super::fibonacci::RetracementLevels;
use super::rsi::calculate_smoothed_rsi;
use super::trend::{analyze_trend, composite_trend, TrendBand};
use crate::models::{Candle, Trend};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shortest history the short window will accept
pub const MIN_SHORT_WINDOW: usize = 5;

#[derive(Debug, Error, PartialEq)]
pub enum IndicatorError {
    #[error("insufficient data for {interval}: need {required} candles, have {available}")]
    InsufficientData {
        interval: String,
        required: usize,
        available: usize,
    },
}

/// Lookback windows and periods used to build a Summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndicatorConfig {
    pub short_window: usize,
    pub medium_window: usize,
    pub long_window: usize,
    pub rsi_period: usize,
    pub rsi_smoothing: usize,
    pub bollinger_period: usize,
    pub bollinger_k: f64,
    pub chart_window: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            short_window: 10,
            medium_window: 20,
            long_window: 50,
            rsi_period: 14,
            rsi_smoothing: 5,
            bollinger_period: 20,
            bollinger_k: 2.0,
            chart_window: 10,
        }
    }
}

/// Everything derived for one (pair, interval)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub interval: String,
    pub trend: Trend,
    pub rsi: f64,
    pub short: Option<TrendBand>,
    pub medium: Option<TrendBand>,
    pub long: Option<TrendBand>,
    pub bollinger: BollingerBands,
    pub retracement: RetracementLevels,
    pub candle_pattern: Option<String>,
    pub chart_pattern: Option<String>,
    pub candle: Candle,
}

impl Summary {
    /// Composite trend re-derived against a live price
    pub fn trend_at(&self, price: f64) -> Trend {
        composite_trend(self.short.as_ref(), self.medium.as_ref(), self.long.as_ref(), price)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.candle_pattern
            .as_deref()
            .into_iter()
            .chain(self.chart_pattern.as_deref())
    }
}

/// Window length for `nominal`, or `None` if it collapses
///
/// A window shrinks to `len - 1` and is undefined once that drops below
/// `floor` (the next-shorter window's nominal size).
fn effective_window(nominal: usize, floor: usize, len: usize) -> Option<usize> {
    let available = len.checked_sub(1)?;
    if available < floor {
        return None;
    }
    Some(nominal.min(available))
}

/// Build the Summary for one interval's candle history (oldest first)
pub fn trading_summary(
    interval: &str,
    candles: &[Candle],
    config: &IndicatorConfig,
) -> Result<Summary, IndicatorError> {
    let len = candles.len();
    let insufficient = || IndicatorError::InsufficientData {
        interval: interval.to_string(),
        required: MIN_SHORT_WINDOW + 1,
        available: len,
    };

    let short_period = effective_window(config.short_window, MIN_SHORT_WINDOW, len).ok_or_else(insufficient)?;
    let short = Some(analyze_trend(candles, short_period).ok_or_else(insufficient)?);
    let medium = effective_window(config.medium_window, config.short_window, len)
        .and_then(|period| analyze_trend(candles, period));
    let long = effective_window(config.long_window, config.medium_window, len)
        .and_then(|period| analyze_trend(candles, period));

    let latest = candles.last().ok_or_else(insufficient)?.clone();
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let rsi = calculate_smoothed_rsi(&closes, config.rsi_period, config.rsi_smoothing)
        .ok_or_else(insufficient)?;
    let bollinger = calculate_bollinger_bands(&closes, config.bollinger_period.min(len), config.bollinger_k)
        .ok_or_else(insufficient)?;

    let trend = composite_trend(short.as_ref(), medium.as_ref(), long.as_ref(), latest.close);
    let candle_pattern = identify_candlestick_pattern(candles).map(str::to_string);
    let chart_pattern =
        identify_chart_pattern(&ChartWindow::from_candles(candles, config.chart_window)).map(str::to_string);

    Ok(Summary {
        interval: interval.to_string(),
        trend,
        rsi,
        short,
        medium,
        long,
        bollinger,
        retracement: RetracementLevels::from_range(latest.high, latest.low),
        candle_pattern,
        chart_pattern,
        candle: latest,
    })
}
