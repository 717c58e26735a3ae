use analysis_core::{CacheError, ConfigError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Batch job not found: {0}")]
    JobNotFound(String),

    #[error("Batch job {id} is {status} and cannot be resumed")]
    NotResumable { id: String, status: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Result cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Ticker list is empty")]
    EmptyTickerList,
}
