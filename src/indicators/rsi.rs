use super::moving_average::sma_series;
use super::precision::truncate;

/// Wilder RSI series
///
/// The first value covers `prices[..=period]`; every later value applies
/// Wilder's smoothing of average gain and loss.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
pub fn rsi_series(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period + 1 {
        return Vec::new();
    }

    let changes: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();

    let mut avg_gain = changes[..period].iter().map(|c| c.max(0.0)).sum::<f64>() / period as f64;
    let mut avg_loss = changes[..period].iter().map(|c| (-c).max(0.0)).sum::<f64>() / period as f64;

    let mut series = Vec::with_capacity(changes.len() - period + 1);
    series.push(rsi_from_averages(avg_gain, avg_loss));

    for change in &changes[period..] {
        avg_gain = (avg_gain * (period as f64 - 1.0) + change.max(0.0)) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + (-change).max(0.0)) / period as f64;
        series.push(rsi_from_averages(avg_gain, avg_loss));
    }

    series
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_gain == 0.0 && avg_loss == 0.0 {
        return 50.0;
    }
    if avg_loss == 0.0 {
        return 100.0;
    }

    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// Latest RSI value smoothed by an SMA over the RSI series
///
/// Both the RSI period and the smoothing window shrink to what the
/// history can support. Result is truncated to 2 decimals.
pub fn calculate_smoothed_rsi(prices: &[f64], period: usize, smoothing: usize) -> Option<f64> {
    if prices.len() < 2 || period == 0 || smoothing == 0 {
        return None;
    }

    let period = period.min(prices.len() - 1);
    let series = rsi_series(prices, period);
    let smoothing = smoothing.min(series.len());

    sma_series(&series, smoothing)
        .last()
        .map(|rsi| truncate(*rsi, 2))
}
