/// Truncate (not round) a value to `decimals` places
///
/// Scaled values that sit within float noise of an integer snap to it first,
/// so `0.29` truncated to 2 places stays `0.29`.
pub fn truncate(value: f64, decimals: u32) -> f64 {
    if !value.is_finite() {
        return value;
    }

    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    let nearest = scaled.round();

    if (scaled - nearest).abs() < 1e-14 * nearest.abs().max(1.0) {
        nearest / factor
    } else {
        scaled.trunc() / factor
    }
}

/// Number of significant decimal places in a price, capped at 10
pub fn decimal_places(value: f64) -> u32 {
    let text = format!("{:.10}", value.abs());
    let fraction = text.split('.').nth(1).unwrap_or("");
    fraction.trim_end_matches('0').len() as u32
}

/// Smallest decimal increment observed across the given prices
///
/// `[1.5, 1.25]` yields `0.01`; whole numbers yield `1.0`.
pub fn tick_tolerance(values: &[f64]) -> f64 {
    let places = values.iter().map(|v| decimal_places(*v)).max().unwrap_or(0);
    10f64.powi(-(places as i32))
}
