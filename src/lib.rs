// Core modules
pub mod config;
pub mod engine;
pub mod exchange;
pub mod history;
pub mod indicators;
pub mod models;
pub mod notify;
pub mod persistence;

// Re-export commonly used types
pub use config::{EngineConfig, RuleConfig};
pub use engine::Engine;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
