use super::precision::truncate;
use serde::{Deserialize, Serialize};

/// Retracement levels measured down from the high
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetracementLevels {
    #[serde(rename = "0.236")]
    pub r0236: f64,
    #[serde(rename = "0.382")]
    pub r0382: f64,
    #[serde(rename = "0.5")]
    pub r0500: f64,
    #[serde(rename = "0.618")]
    pub r0618: f64,
    #[serde(rename = "0.786")]
    pub r0786: f64,
}

impl RetracementLevels {
    /// `high - (high - low) * ratio` for each ratio
    pub fn from_range(high: f64, low: f64) -> Self {
        let level = |ratio: f64| truncate(high - (high - low) * ratio, 8);

        Self {
            r0236: level(0.236),
            r0382: level(0.382),
            r0500: level(0.5),
            r0618: level(0.618),
            r0786: level(0.786),
        }
    }

    /// Strictly between the 0.786 and 0.236 levels
    pub fn contains(&self, price: f64) -> bool {
        price > self.r0786 && price < self.r0236
    }
}
