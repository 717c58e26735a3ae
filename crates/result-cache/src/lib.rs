//! Durable per-day valuation cache backed by SQLite.

pub mod store;

pub use store::{ResultCache, WriteRetry};
