use crate::{ProviderAttempt, ProviderOutcome};
use std::time::Duration;
use thiserror::Error;

/// Failure of a single provider attempt. Every variant advances the fallback chain.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Ticker not found")]
    NotFound,

    #[error("Rate limited by provider")]
    RateLimited,

    #[error("Rate limiter wait for {provider} exceeded {waited:?}")]
    RateLimitTimeout { provider: String, waited: Duration },

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Classification used for fallback progression and health tracking
    pub fn outcome(&self) -> ProviderOutcome {
        match self {
            ProviderError::NotFound => ProviderOutcome::NotFound,
            ProviderError::RateLimited | ProviderError::RateLimitTimeout { .. } => {
                ProviderOutcome::RateLimited
            }
            ProviderError::Transient(_) | ProviderError::Malformed(_) => {
                ProviderOutcome::TransientError
            }
        }
    }

    /// Map a non-success HTTP status to a provider error.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            404 => ProviderError::NotFound,
            429 => ProviderError::RateLimited,
            _ => ProviderError::Transient(format!("HTTP {}: {}", status, truncate(body, 200))),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Provider chain failures
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("No data available for {ticker}: {}", describe_attempts(.attempts))]
    NoDataAvailable {
        ticker: String,
        attempts: Vec<ProviderAttempt>,
    },

    #[error("No providers configured")]
    NoProviders,
}

pub fn describe_attempts(attempts: &[ProviderAttempt]) -> String {
    if attempts.is_empty() {
        return "no providers attempted".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.provider, a.outcome.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result cache failures
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid row for {ticker}: {message}")]
    InvalidRow { ticker: String, message: String },

    #[error("Cache write for {ticker} failed after {attempts} attempts: {message}")]
    WriteFailed {
        ticker: String,
        attempts: u32,
        message: String,
    },
}

/// Configuration errors are fatal at batch start
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("No data providers configured")]
    NoProviders,

    #[error("Invalid weight preset for {preset}: {reason}")]
    InvalidWeightPreset { preset: String, reason: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ProviderError::from_status(404, ""), ProviderError::NotFound);
        assert_eq!(ProviderError::from_status(429, ""), ProviderError::RateLimited);
        assert_eq!(
            ProviderError::from_status(503, "down").outcome(),
            ProviderOutcome::TransientError
        );
    }

    #[test]
    fn test_rate_limit_timeout_counts_as_rate_limited() {
        let err = ProviderError::RateLimitTimeout {
            provider: "polygon".into(),
            waited: Duration::from_secs(30),
        };
        assert_eq!(err.outcome(), ProviderOutcome::RateLimited);
    }

    #[test]
    fn test_no_data_message_lists_attempts() {
        let err = ChainError::NoDataAvailable {
            ticker: "XYZ".into(),
            attempts: vec![
                ProviderAttempt {
                    provider: "polygon".into(),
                    outcome: ProviderOutcome::NotFound,
                    latency: Duration::from_millis(12),
                },
                ProviderAttempt {
                    provider: "yahoo".into(),
                    outcome: ProviderOutcome::TransientError,
                    latency: Duration::from_millis(40),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("polygon: NotFound"));
        assert!(msg.contains("yahoo: TransientError"));
    }
}
