// Technical indicators module
// Trend bands, smoothed RSI, Bollinger Bands, Fibonacci levels and pattern tags

pub mod bollinger;
pub mod candlestick;
pub mod chart;
pub mod fibonacci;
pub mod moving_average;
pub mod precision;
pub mod rsi;
pub mod summary;
pub mod trend;

pub use bollinger::{calculate_bollinger_bands, BollingerBands};
pub use candlestick::identify_candlestick_pattern;
pub use chart::{identify_chart_pattern, ChartWindow};
pub use fibonacci::RetracementLevels;
pub use moving_average::{calculate_sma, population_std_dev, sma_series};
pub use precision::truncate;
pub use rsi::{calculate_smoothed_rsi, rsi_series};
pub use summary::{trading_summary, IndicatorConfig, IndicatorError, Summary};
pub use trend::{analyze_trend, composite_trend, interval_weight, weighted_trend, TrendBand};
