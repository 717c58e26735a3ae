//! Provider fallback chain: per-provider rate limiting, health tracking and
//! ordered fallback across financial data providers.

pub mod adapters;
pub mod chain;
pub mod health;
pub mod rate_limiter;

#[cfg(test)]
mod tests;

pub use adapters::{AlphaVantageClient, YahooFinanceClient};
pub use chain::{ChainSettings, ProviderChain};
pub use health::{HealthTracker, ProviderHealthSnapshot};
pub use rate_limiter::{RateLimiter, RatePermit};
