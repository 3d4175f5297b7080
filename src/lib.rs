//! Crossed-Market Arbitrage Engine
//!
//! Finds the same token priced apart on two AMM venues, sizes the trade,
//! and races an atomic bundle through a private relay across the next
//! blocks until it lands or the attempt budget runs out.

pub mod arbitrage;
pub mod block_feed;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod error;
pub mod market;
pub mod relay;
pub mod service;
pub mod types;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use arbitrage::{AbandonReason, BundleOutcome, CrossedMarketDetector};
pub use block_feed::BlockFeed;
pub use config::{EngineConfig, EnvSettings, PolicyThresholds, SettingsSource};
pub use error::{ArbError, Result};
pub use market::{Market, MarketRegistry, MarketState};
pub use service::{ArbitrageService, Submissions};
pub use types::{BlockState, CrossedMarketOpportunity, Protocol};
