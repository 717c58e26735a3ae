//! Analysis engine: configuration, the single-ticker analysis pipeline and
//! the batch orchestrator that drives it over whole exchanges.

pub mod batch;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod job_store;
pub mod pipeline;

pub use batch::{BatchOrchestrator, BatchSettings};
pub use bootstrap::{
    build_orchestrator, build_orchestrator_with, build_provider_chain, build_rate_limiter,
};
pub use config::EngineConfig;
pub use error::OrchestratorError;
pub use job_store::{JobStore, TickerProgress};
pub use pipeline::{AnalysisOutcome, AnalysisPipeline, Refresh};
