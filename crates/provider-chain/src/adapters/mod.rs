//! Backup provider adapters. The primary adapter lives in `polygon-client`.

pub mod alpha_vantage;
pub mod yahoo;

pub use alpha_vantage::AlphaVantageClient;
pub use yahoo::YahooFinanceClient;
