use super::moving_average::{calculate_sma, population_std_dev};
use super::precision::truncate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// SMA(period) ± k × population stddev(period), truncated to 8 decimals
pub fn calculate_bollinger_bands(closes: &[f64], period: usize, k: f64) -> Option<BollingerBands> {
    let middle = calculate_sma(closes, period)?;
    let std_dev = population_std_dev(closes, period)?;

    Some(BollingerBands {
        upper: truncate(middle + k * std_dev, 8),
        middle: truncate(middle, 8),
        lower: truncate(middle - k * std_dev, 8),
    })
}
