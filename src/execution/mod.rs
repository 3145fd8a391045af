// Candle history and order automation module
pub mod candle_buffer;
pub mod position_manager;

pub use candle_buffer::{CandleBuffer, CandleKey};
pub use position_manager::{AutomationConfig, ExitReason, PositionManager, Trip};
