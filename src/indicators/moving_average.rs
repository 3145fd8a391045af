/// Calculate Simple Moving Average (SMA) over the last `period` values
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Rolling SMA series, one value per full window
///
/// `sma_series(&[1, 2, 3, 4], 2)` yields `[1.5, 2.5, 3.5]`.
pub fn sma_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    values
        .windows(period)
        .map(|window| window.iter().sum::<f64>() / period as f64)
        .collect()
}

/// Population standard deviation of the last `period` values
pub fn population_std_dev(values: &[f64], period: usize) -> Option<f64> {
    let mean = calculate_sma(values, period)?;
    let variance = values
        .iter()
        .rev()
        .take(period)
        .map(|v| (v - mean).powi(2))
        .sum::<f64>()
        / period as f64;

    Some(variance.sqrt())
}
