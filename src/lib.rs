// Core modules
pub mod config;
pub mod error;
pub mod exchange;
pub mod models;
pub mod store;
pub mod strategy;
pub mod supervisor;

// Re-export commonly used types
pub use error::{ExchangeError, StrategyError};
pub use models::*;
pub use supervisor::Supervisor;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
