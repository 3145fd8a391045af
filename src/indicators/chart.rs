//! Table-driven chart pattern recognition over a trailing price window
//!
//! Reversal formations are tried first, then continuation, then neutral
//! triangles. The V shape is the catch-all at the end of the table.

use crate::models::Candle;

/// Relative slope per bar below which a line counts as flat
const FLAT_SLOPE: f64 = 0.001;
/// Relative gap under which two swing prices count as equal
const LEVEL_TOLERANCE: f64 = 0.005;
/// Minimum move of a flag or pennant pole
const POLE_MOVE: f64 = 0.03;
/// Bars needed before a fitted trend line means anything
const MIN_TREND_BARS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartPatternKind {
    Reversal,
    Continuation,
    Neutral,
}

/// Trailing closes, highs and lows, oldest first
#[derive(Debug, Clone, PartialEq)]
pub struct ChartWindow {
    pub closes: Vec<f64>,
    pub highs: Vec<f64>,
    pub lows: Vec<f64>,
}

impl ChartWindow {
    pub fn from_candles(candles: &[Candle], size: usize) -> Self {
        let start = candles.len().saturating_sub(size);
        let window = &candles[start..];

        Self {
            closes: window.iter().map(|c| c.close).collect(),
            highs: window.iter().map(|c| c.high).collect(),
            lows: window.iter().map(|c| c.low).collect(),
        }
    }

    fn last_closes(&self, n: usize) -> Option<&[f64]> {
        self.closes.len().checked_sub(n).map(|start| &self.closes[start..])
    }
}

pub struct ChartRule {
    pub name: &'static str,
    pub kind: ChartPatternKind,
    pub matches: fn(&ChartWindow) -> bool,
}

pub const CHART_RULES: &[ChartRule] = &[
    ChartRule { name: "Head and Shoulders (Bearish Reversal)", kind: ChartPatternKind::Reversal, matches: head_and_shoulders },
    ChartRule { name: "Inverse Head and Shoulders (Bullish Reversal)", kind: ChartPatternKind::Reversal, matches: inverse_head_and_shoulders },
    ChartRule { name: "Double Top (Bearish Reversal)", kind: ChartPatternKind::Reversal, matches: double_top },
    ChartRule { name: "Double Bottom (Bullish Reversal)", kind: ChartPatternKind::Reversal, matches: double_bottom },
    ChartRule { name: "Rising Wedge (Bearish Reversal)", kind: ChartPatternKind::Reversal, matches: rising_wedge },
    ChartRule { name: "Falling Wedge (Bullish Reversal)", kind: ChartPatternKind::Reversal, matches: falling_wedge },
    ChartRule { name: "Flag (Bullish Continuation)", kind: ChartPatternKind::Continuation, matches: bull_flag },
    ChartRule { name: "Flag (Bearish Continuation)", kind: ChartPatternKind::Continuation, matches: bear_flag },
    ChartRule { name: "Pennant (Bullish Continuation)", kind: ChartPatternKind::Continuation, matches: bull_pennant },
    ChartRule { name: "Pennant (Bearish Continuation)", kind: ChartPatternKind::Continuation, matches: bear_pennant },
    ChartRule { name: "Rectangle (Neutral Continuation)", kind: ChartPatternKind::Continuation, matches: rectangle },
    ChartRule { name: "Symmetrical Triangle (Neutral)", kind: ChartPatternKind::Neutral, matches: symmetrical_triangle },
    ChartRule { name: "Ascending Triangle (Bullish)", kind: ChartPatternKind::Neutral, matches: ascending_triangle },
    ChartRule { name: "Descending Triangle (Bearish)", kind: ChartPatternKind::Neutral, matches: descending_triangle },
    ChartRule { name: "V Pattern (Bullish Reversal)", kind: ChartPatternKind::Neutral, matches: v_pattern },
    ChartRule { name: "Inverted V Pattern (Bearish Reversal)", kind: ChartPatternKind::Neutral, matches: inverted_v_pattern },
];

/// First matching chart pattern in the window
pub fn identify_chart_pattern(window: &ChartWindow) -> Option<&'static str> {
    if window.closes.len() < 3 {
        return None;
    }

    CHART_RULES
        .iter()
        .find(|rule| (rule.matches)(window))
        .map(|rule| rule.name)
}

/// Least-squares slope per bar, relative to the mean value
fn relative_slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }

    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    if mean_y == 0.0 {
        return 0.0;
    }

    let (num, den) = values.iter().enumerate().fold((0.0, 0.0), |(num, den), (i, y)| {
        let dx = i as f64 - mean_x;
        (num + dx * (y - mean_y), den + dx * dx)
    });

    num / den / mean_y
}

fn has_trend_bars(w: &ChartWindow) -> bool {
    w.closes.len() >= MIN_TREND_BARS
}

fn is_flat(slope: f64) -> bool {
    slope.abs() <= FLAT_SLOPE
}

fn same_level(a: f64, b: f64) -> bool {
    (a - b).abs() <= a.abs().max(b.abs()) * LEVEL_TOLERANCE
}

fn is_peak(p: &[f64], i: usize) -> bool {
    p[i] > p[i - 1] && p[i] > p[i + 1]
}

fn is_trough(p: &[f64], i: usize) -> bool {
    p[i] < p[i - 1] && p[i] < p[i + 1]
}

fn halves(values: &[f64]) -> (&[f64], &[f64]) {
    values.split_at(values.len() / 2)
}

/// Relative move of the first half, from its first close to the first close of the second half
fn pole_move(w: &ChartWindow) -> f64 {
    let (first, second) = halves(&w.closes);
    match (first.first(), second.first()) {
        (Some(start), Some(end)) if *start != 0.0 => (end - start) / start,
        _ => 0.0,
    }
}

// ============================================================================
// Reversal
// ============================================================================

fn head_and_shoulders(w: &ChartWindow) -> bool {
    let Some(p) = w.last_closes(7) else { return false };
    is_peak(p, 1)
        && is_peak(p, 3)
        && is_peak(p, 5)
        && p[3] > p[1]
        && p[3] > p[5]
        && (p[1] - p[5]).abs() <= p[3] * 0.02
        && p[6] < p[4]
}

fn inverse_head_and_shoulders(w: &ChartWindow) -> bool {
    let Some(p) = w.last_closes(7) else { return false };
    is_trough(p, 1)
        && is_trough(p, 3)
        && is_trough(p, 5)
        && p[3] < p[1]
        && p[3] < p[5]
        && (p[1] - p[5]).abs() <= p[3] * 0.02
        && p[6] > p[4]
}

fn double_top(w: &ChartWindow) -> bool {
    let Some(p) = w.last_closes(5) else { return false };
    is_peak(p, 1) && is_peak(p, 3) && same_level(p[1], p[3]) && p[4] < p[2]
}

fn double_bottom(w: &ChartWindow) -> bool {
    let Some(p) = w.last_closes(5) else { return false };
    is_trough(p, 1) && is_trough(p, 3) && same_level(p[1], p[3]) && p[4] > p[2]
}

fn rising_wedge(w: &ChartWindow) -> bool {
    let (highs, lows) = (relative_slope(&w.highs), relative_slope(&w.lows));
    has_trend_bars(w) && highs > FLAT_SLOPE && lows > FLAT_SLOPE && lows - highs > FLAT_SLOPE
}

fn falling_wedge(w: &ChartWindow) -> bool {
    let (highs, lows) = (relative_slope(&w.highs), relative_slope(&w.lows));
    has_trend_bars(w) && highs < -FLAT_SLOPE && lows < -FLAT_SLOPE && lows - highs > FLAT_SLOPE
}

// ============================================================================
// Continuation
// ============================================================================

fn bull_flag(w: &ChartWindow) -> bool {
    let (_, highs) = halves(&w.highs);
    let (_, lows) = halves(&w.lows);
    w.closes.len() >= MIN_TREND_BARS * 2
        && pole_move(w) >= POLE_MOVE
        && relative_slope(highs) <= FLAT_SLOPE
        && relative_slope(lows) <= FLAT_SLOPE
        && relative_slope(highs) > -POLE_MOVE
}

fn bear_flag(w: &ChartWindow) -> bool {
    let (_, highs) = halves(&w.highs);
    let (_, lows) = halves(&w.lows);
    w.closes.len() >= MIN_TREND_BARS * 2
        && pole_move(w) <= -POLE_MOVE
        && relative_slope(highs) >= -FLAT_SLOPE
        && relative_slope(lows) >= -FLAT_SLOPE
        && relative_slope(lows) < POLE_MOVE
}

fn bull_pennant(w: &ChartWindow) -> bool {
    let (_, highs) = halves(&w.highs);
    let (_, lows) = halves(&w.lows);
    w.closes.len() >= MIN_TREND_BARS * 2
        && pole_move(w) >= POLE_MOVE
        && relative_slope(highs) < -FLAT_SLOPE
        && relative_slope(lows) > FLAT_SLOPE
}

fn bear_pennant(w: &ChartWindow) -> bool {
    let (_, highs) = halves(&w.highs);
    let (_, lows) = halves(&w.lows);
    w.closes.len() >= MIN_TREND_BARS * 2
        && pole_move(w) <= -POLE_MOVE
        && relative_slope(highs) < -FLAT_SLOPE
        && relative_slope(lows) > FLAT_SLOPE
}

fn rectangle(w: &ChartWindow) -> bool {
    let top = w.highs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let bottom = w.lows.iter().copied().fold(f64::INFINITY, f64::min);
    w.closes.len() > MIN_TREND_BARS
        && bottom > 0.0
        && (top - bottom) / bottom >= 0.01
        && is_flat(relative_slope(&w.highs))
        && is_flat(relative_slope(&w.lows))
}

// ============================================================================
// Neutral
// ============================================================================

fn symmetrical_triangle(w: &ChartWindow) -> bool {
    has_trend_bars(w)
        && relative_slope(&w.highs) < -FLAT_SLOPE && relative_slope(&w.lows) > FLAT_SLOPE
}

fn ascending_triangle(w: &ChartWindow) -> bool {
    has_trend_bars(w)
        && is_flat(relative_slope(&w.highs)) && relative_slope(&w.lows) > FLAT_SLOPE
}

fn descending_triangle(w: &ChartWindow) -> bool {
    has_trend_bars(w)
        && relative_slope(&w.highs) < -FLAT_SLOPE && is_flat(relative_slope(&w.lows))
}

fn v_pattern(w: &ChartWindow) -> bool {
    w.last_closes(3).is_some_and(|p| is_trough(p, 1))
}

fn inverted_v_pattern(w: &ChartWindow) -> bool {
    w.last_closes(3).is_some_and(|p| is_peak(p, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(closes: &[f64], spread: f64) -> ChartWindow {
        ChartWindow {
            closes: closes.to_vec(),
            highs: closes.iter().map(|c| c + spread).collect(),
            lows: closes.iter().map(|c| c - spread).collect(),
        }
    }

    #[test]
    fn test_rule_order_by_kind() {
        let kinds: Vec<ChartPatternKind> = CHART_RULES.iter().map(|r| r.kind).collect();
        let first_continuation = kinds.iter().position(|k| *k == ChartPatternKind::Continuation).unwrap();
        let last_reversal = kinds.iter().rposition(|k| *k == ChartPatternKind::Reversal).unwrap();
        assert!(last_reversal < first_continuation);
        assert!(CHART_RULES.last().unwrap().name.contains("V Pattern"));
    }

    #[test]
    fn test_head_and_shoulders() {
        let w = window(&[100.0, 104.0, 101.0, 108.0, 101.0, 104.5, 99.0], 0.5);
        assert_eq!(identify_chart_pattern(&w), Some("Head and Shoulders (Bearish Reversal)"));
    }

    #[test]
    fn test_inverse_head_and_shoulders() {
        let w = window(&[104.0, 100.0, 103.0, 96.0, 103.0, 100.5, 105.0], 0.5);
        assert_eq!(
            identify_chart_pattern(&w),
            Some("Inverse Head and Shoulders (Bullish Reversal)")
        );
    }

    #[test]
    fn test_double_top() {
        let w = window(&[100.0, 105.0, 102.0, 105.2, 101.0], 0.5);
        assert_eq!(identify_chart_pattern(&w), Some("Double Top (Bearish Reversal)"));
    }

    #[test]
    fn test_double_bottom() {
        let w = window(&[105.0, 100.0, 103.0, 100.2, 104.0], 0.5);
        assert_eq!(identify_chart_pattern(&w), Some("Double Bottom (Bullish Reversal)"));
    }

    #[test]
    fn test_rising_wedge() {
        let w = ChartWindow {
            closes: vec![100.0, 101.0, 102.0, 103.0, 104.0, 105.0],
            highs: vec![104.0, 104.6, 105.2, 105.8, 106.4, 107.0],
            lows: vec![96.0, 98.0, 100.0, 102.0, 104.0, 106.0],
        };
        assert_eq!(identify_chart_pattern(&w), Some("Rising Wedge (Bearish Reversal)"));
    }

    #[test]
    fn test_bull_flag() {
        let closes = [100.0, 102.0, 104.0, 106.0, 108.0, 108.0, 107.8, 107.6, 107.4, 107.2];
        let w = window(&closes, 0.5);
        assert_eq!(identify_chart_pattern(&w), Some("Flag (Bullish Continuation)"));
    }

    #[test]
    fn test_ascending_triangle() {
        let w = ChartWindow {
            closes: vec![100.0, 100.5, 101.0, 101.2, 101.5, 101.8],
            highs: vec![102.0, 102.0, 102.0, 102.0, 102.0, 102.0],
            lows: vec![96.0, 97.0, 98.0, 99.0, 100.0, 101.0],
        };
        assert_eq!(identify_chart_pattern(&w), Some("Ascending Triangle (Bullish)"));
    }

    #[test]
    fn test_v_pattern_is_catch_all() {
        let w = window(&[100.0, 100.2, 99.0, 100.1], 0.5);
        assert_eq!(identify_chart_pattern(&w), Some("V Pattern (Bullish Reversal)"));
    }

    #[test]
    fn test_too_short() {
        let w = window(&[100.0, 101.0], 0.5);
        assert_eq!(identify_chart_pattern(&w), None);
    }
}
