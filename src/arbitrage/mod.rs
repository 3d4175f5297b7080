//! Arbitrage Module
//!
//! Crossed-market detection, bundle construction, and submission with
//! multi-block retry.

pub mod bundle;
pub mod cooldown;
pub mod detector;
pub mod executor;

pub use bundle::{Bundle, BundleBuilder, RelayBundleParams};
pub use cooldown::{RouteGuard, RouteKey};
pub use detector::CrossedMarketDetector;
pub use executor::{AbandonReason, BundleOutcome, BundleSubmitter, DEFAULT_MAX_ATTEMPTS};
