// Opportunity detection module
pub mod opportunity;

pub use opportunity::{
    assess, required_intervals, timeframe_intervals, OpportunityConfig, OpportunityDetector, OpportunityError,
};
