//! Layered runtime configuration
//!
//! Built-in defaults, then an optional TOML file, then `BACKPOCKET__*`
//! environment variables (`BACKPOCKET__BINANCE__API_KEY` sets `binance.api_key`).

use crate::exchange::BinanceConfig;
use crate::execution::AutomationConfig;
use crate::indicators::IndicatorConfig;
use crate::ingestion::FeedConfig;
use crate::strategy::{required_intervals, OpportunityConfig};
use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "backpocket.toml";

/// History and refresh cadence of the indicator engine
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    pub intervals: Vec<String>,
    /// Candles kept per interval, also the REST backfill limit
    pub history_limit: usize,
    pub refresh_secs: u64,
    pub indicator: IndicatorConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            intervals: vec!["1m".to_string(), "5m".to_string(), "15m".to_string()],
            history_limit: 250,
            refresh_secs: 30,
            indicator: IndicatorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub binance: BinanceConfig,
    pub feeds: FeedConfig,
    pub analysis: AnalysisConfig,
    pub opportunity: OpportunityConfig,
    pub automation: AutomationConfig,
}

impl Settings {
    /// Load settings from `path` (if it exists) and the environment
    ///
    /// A missing file is only an error when `required` is set.
    pub fn load(path: &Path, required: bool) -> anyhow::Result<Self> {
        let defaults = AnalysisConfig::default();

        let config = Config::builder()
            .set_default("analysis.intervals", defaults.intervals)?
            .set_default("opportunity.timeframes", OpportunityConfig::default().timeframes)?
            .add_source(File::from(path).required(required))
            .add_source(
                Environment::with_prefix("BACKPOCKET")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("analysis.intervals")
                    .with_list_parse_key("opportunity.timeframes")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let settings: Settings = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        settings.validate()?;

        Ok(settings)
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        required_intervals(&self.opportunity.timeframes)?;

        if self.analysis.intervals.is_empty() {
            anyhow::bail!("analysis.intervals must not be empty");
        }
        if self.analysis.history_limit == 0 {
            anyhow::bail!("analysis.history_limit must be positive");
        }

        Ok(())
    }

    /// Every interval the engine must track: analysis intervals plus
    /// whatever the opportunity timeframes need
    pub fn tracked_intervals(&self) -> anyhow::Result<Vec<String>> {
        let mut intervals = self.analysis.intervals.clone();
        for interval in required_intervals(&self.opportunity.timeframes)? {
            if !intervals.contains(&interval) {
                intervals.push(interval);
            }
        }
        Ok(intervals)
    }
}
