// Core modules
pub mod analysis;
pub mod db;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod ingestion;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod registry;
pub mod settings;
pub mod strategy;

// Re-export commonly used types
pub use models::*;
pub use registry::{Registries, Registry};

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
