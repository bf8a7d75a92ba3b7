// Core modules
pub mod config;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod ws;

// Re-export commonly used types
pub use config::BotConfig;
pub use error::{BotError, ExchangeError, StoreError};
pub use models::*;
pub use strategy::EntryPlanner;
