//! Table-driven candlestick pattern recognition
//!
//! Rules are evaluated in table order against the trailing `window`
//! candles and the first match wins. Four-candle formations come first,
//! single-candle shapes last.

use super::precision::tick_tolerance;
use crate::models::Candle;

/// Named predicate over the last `window` candles
pub struct CandlestickRule {
    pub name: &'static str,
    pub window: usize,
    pub matches: fn(&[Candle], f64) -> bool,
}

pub const CANDLESTICK_RULES: &[CandlestickRule] = &[
    CandlestickRule { name: "Bullish Three Line Strike", window: 4, matches: bullish_three_line_strike },
    CandlestickRule { name: "Bearish Three Line Strike", window: 4, matches: bearish_three_line_strike },
    CandlestickRule { name: "Bullish Concealing Baby Swallow", window: 4, matches: concealing_baby_swallow },
    CandlestickRule { name: "Bullish Three White Soldiers", window: 3, matches: three_white_soldiers },
    CandlestickRule { name: "Bearish Three Black Crows", window: 3, matches: three_black_crows },
    CandlestickRule { name: "Bullish Morning Star", window: 3, matches: morning_star },
    CandlestickRule { name: "Bearish Evening Star", window: 3, matches: evening_star },
    CandlestickRule { name: "Bullish Engulfing", window: 2, matches: bullish_engulfing },
    CandlestickRule { name: "Bearish Engulfing", window: 2, matches: bearish_engulfing },
    CandlestickRule { name: "Bullish Tweezer Bottom", window: 2, matches: tweezer_bottom },
    CandlestickRule { name: "Bearish Tweezer Top", window: 2, matches: tweezer_top },
    CandlestickRule { name: "Bullish Hammer", window: 2, matches: hammer },
    CandlestickRule { name: "Bearish Hanging Man", window: 2, matches: hanging_man },
    CandlestickRule { name: "Bullish Inverted Hammer", window: 2, matches: inverted_hammer },
    CandlestickRule { name: "Bearish Shooting Star", window: 2, matches: shooting_star },
    CandlestickRule { name: "Bullish Marubozu", window: 1, matches: bullish_marubozu },
    CandlestickRule { name: "Bearish Marubozu", window: 1, matches: bearish_marubozu },
    CandlestickRule { name: "Bullish Dragonfly Doji", window: 1, matches: dragonfly_doji },
    CandlestickRule { name: "Bearish Gravestone Doji", window: 1, matches: gravestone_doji },
    CandlestickRule { name: "Neutral Long-Legged Doji", window: 1, matches: long_legged_doji },
    CandlestickRule { name: "Neutral Doji", window: 1, matches: doji },
];

/// First matching pattern for the trailing candles, if any
pub fn identify_candlestick_pattern(candles: &[Candle]) -> Option<&'static str> {
    let latest = candles.last()?;
    // Widened by a hair so a difference of exactly one tick survives float noise
    let tolerance =
        tick_tolerance(&[latest.open, latest.high, latest.low, latest.close]) * (1.0 + 1e-6);

    CANDLESTICK_RULES
        .iter()
        .filter(|rule| candles.len() >= rule.window)
        .find(|rule| (rule.matches)(&candles[candles.len() - rule.window..], tolerance))
        .map(|rule| rule.name)
}

fn approx_eq(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance
}

fn is_doji(c: &Candle, tolerance: f64) -> bool {
    c.range() > 0.0 && (c.body() <= c.range() * 0.1 || approx_eq(c.open, c.close, tolerance))
}

fn is_marubozu(c: &Candle, tolerance: f64) -> bool {
    c.body() > tolerance && c.upper_shadow() <= tolerance && c.lower_shadow() <= tolerance
}

fn has_hammer_shape(c: &Candle) -> bool {
    c.body() > 0.0 && c.lower_shadow() >= c.body() * 2.0 && c.upper_shadow() <= c.body() * 0.5
}

fn has_shooting_star_shape(c: &Candle) -> bool {
    c.body() > 0.0 && c.upper_shadow() >= c.body() * 2.0 && c.lower_shadow() <= c.body() * 0.5
}

fn rising_bullish(candles: &[Candle]) -> bool {
    candles.iter().all(Candle::is_bullish) && candles.windows(2).all(|w| w[1].close > w[0].close)
}

fn falling_bearish(candles: &[Candle]) -> bool {
    candles.iter().all(Candle::is_bearish) && candles.windows(2).all(|w| w[1].close < w[0].close)
}

// ============================================================================
// Four candles
// ============================================================================

fn bullish_three_line_strike(c: &[Candle], tolerance: f64) -> bool {
    rising_bullish(&c[..3])
        && c[3].is_bearish()
        && c[3].open >= c[2].close - tolerance
        && c[3].close < c[0].open
}

fn bearish_three_line_strike(c: &[Candle], tolerance: f64) -> bool {
    falling_bearish(&c[..3])
        && c[3].is_bullish()
        && c[3].open <= c[2].close + tolerance
        && c[3].close > c[0].open
}

fn concealing_baby_swallow(c: &[Candle], tolerance: f64) -> bool {
    is_marubozu(&c[0], tolerance)
        && is_marubozu(&c[1], tolerance)
        && c[0].is_bearish()
        && c[1].is_bearish()
        && c[2].is_bearish()
        && c[2].open < c[1].close
        && c[2].high > c[1].close
        && c[3].is_bearish()
        && c[3].open > c[2].high
        && c[3].close < c[2].low
}

// ============================================================================
// Three candles
// ============================================================================

fn three_white_soldiers(c: &[Candle], _tolerance: f64) -> bool {
    rising_bullish(c)
        && c.windows(2)
            .all(|w| w[1].open > w[0].open && w[1].open <= w[0].close)
}

fn three_black_crows(c: &[Candle], _tolerance: f64) -> bool {
    falling_bearish(c)
        && c.windows(2)
            .all(|w| w[1].open < w[0].open && w[1].open >= w[0].close)
}

fn morning_star(c: &[Candle], tolerance: f64) -> bool {
    let first_mid = (c[0].open + c[0].close) / 2.0;
    c[0].is_bearish()
        && c[1].body() < c[0].body() * 0.5
        && c[1].body_top() <= c[0].close + tolerance
        && c[2].is_bullish()
        && c[2].close > first_mid
}

fn evening_star(c: &[Candle], tolerance: f64) -> bool {
    let first_mid = (c[0].open + c[0].close) / 2.0;
    c[0].is_bullish()
        && c[1].body() < c[0].body() * 0.5
        && c[1].body_bottom() >= c[0].close - tolerance
        && c[2].is_bearish()
        && c[2].close < first_mid
}

// ============================================================================
// Two candles
// ============================================================================

fn bullish_engulfing(c: &[Candle], _tolerance: f64) -> bool {
    c[0].is_bearish() && c[1].is_bullish() && c[1].open < c[0].close && c[1].close > c[0].open
}

fn bearish_engulfing(c: &[Candle], _tolerance: f64) -> bool {
    c[0].is_bullish() && c[1].is_bearish() && c[1].open > c[0].close && c[1].close < c[0].open
}

fn tweezer_bottom(c: &[Candle], tolerance: f64) -> bool {
    c[0].is_bearish() && c[1].is_bullish() && approx_eq(c[0].low, c[1].low, tolerance)
}

fn tweezer_top(c: &[Candle], tolerance: f64) -> bool {
    c[0].is_bullish() && c[1].is_bearish() && approx_eq(c[0].high, c[1].high, tolerance)
}

fn hammer(c: &[Candle], _tolerance: f64) -> bool {
    c[0].is_bearish() && has_hammer_shape(&c[1])
}

fn hanging_man(c: &[Candle], _tolerance: f64) -> bool {
    c[0].is_bullish() && has_hammer_shape(&c[1])
}

fn inverted_hammer(c: &[Candle], _tolerance: f64) -> bool {
    c[0].is_bearish() && has_shooting_star_shape(&c[1])
}

fn shooting_star(c: &[Candle], _tolerance: f64) -> bool {
    c[0].is_bullish() && has_shooting_star_shape(&c[1])
}

// ============================================================================
// One candle
// ============================================================================

fn bullish_marubozu(c: &[Candle], tolerance: f64) -> bool {
    c[0].is_bullish() && is_marubozu(&c[0], tolerance)
}

fn bearish_marubozu(c: &[Candle], tolerance: f64) -> bool {
    c[0].is_bearish() && is_marubozu(&c[0], tolerance)
}

fn dragonfly_doji(c: &[Candle], tolerance: f64) -> bool {
    let candle = &c[0];
    is_doji(candle, tolerance)
        && candle.upper_shadow() <= candle.range() * 0.1
        && candle.lower_shadow() >= candle.range() * 0.6
}

fn gravestone_doji(c: &[Candle], tolerance: f64) -> bool {
    let candle = &c[0];
    is_doji(candle, tolerance)
        && candle.lower_shadow() <= candle.range() * 0.1
        && candle.upper_shadow() >= candle.range() * 0.6
}

fn long_legged_doji(c: &[Candle], tolerance: f64) -> bool {
    let candle = &c[0];
    is_doji(candle, tolerance)
        && candle.upper_shadow() >= candle.range() * 0.3
        && candle.lower_shadow() >= candle.range() * 0.3
}

fn doji(c: &[Candle], tolerance: f64) -> bool {
    is_doji(&c[0], tolerance)
}
