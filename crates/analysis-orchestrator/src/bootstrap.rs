use crate::batch::{BatchOrchestrator, BatchSettings};
use crate::config::{EngineConfig, ALPHA_VANTAGE, POLYGON, YAHOO};
use crate::error::OrchestratorError;
use crate::job_store::JobStore;
use crate::pipeline::AnalysisPipeline;
use analysis_core::{ConfigError, ProviderAdapter};
use polygon_client::PolygonClient;
use provider_chain::{
    AlphaVantageClient, ChainSettings, ProviderChain, RateLimiter, YahooFinanceClient,
};
use result_cache::{ResultCache, WriteRetry};
use std::sync::Arc;
use std::time::Duration;
use valuation_synthesizer::{ModelSet, Synthesizer};

/// One limiter for the process, holding a per-minute request budget for every
/// known provider. Share it with anything else that calls a provider.
pub fn build_rate_limiter(config: &EngineConfig) -> Arc<RateLimiter> {
    let limiter = RateLimiter::new(config.rate_limit_wait_timeout);
    for name in [POLYGON, YAHOO, ALPHA_VANTAGE] {
        if let Some(rpm) = config.rate_limit_for(name) {
            limiter.set_limit(name, rpm, Duration::from_secs(60));
        }
    }
    Arc::new(limiter)
}

/// Instantiate adapters in `PROVIDER_ORDER`, gated by `limiter`.
pub fn build_provider_chain(
    config: &EngineConfig,
    limiter: Arc<RateLimiter>,
) -> Result<ProviderChain, ConfigError> {
    let mut providers: Vec<Arc<dyn ProviderAdapter>> = Vec::new();

    for name in &config.provider_order {
        let adapter: Arc<dyn ProviderAdapter> = match name.as_str() {
            POLYGON => match &config.polygon_api_key {
                Some(key) => Arc::new(PolygonClient::new(key.clone())),
                None => {
                    tracing::warn!("POLYGON_API_KEY not set, skipping polygon");
                    continue;
                }
            },
            ALPHA_VANTAGE => match &config.alpha_vantage_api_key {
                Some(key) => Arc::new(AlphaVantageClient::new(key.clone())),
                None => {
                    tracing::warn!("ALPHA_VANTAGE_API_KEY not set, skipping alpha_vantage");
                    continue;
                }
            },
            YAHOO => Arc::new(YahooFinanceClient::new()),
            other => return Err(ConfigError::UnknownProvider(other.to_string())),
        };
        providers.push(adapter);
    }

    let names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
    tracing::info!("Provider chain: {}", names.join(" -> "));

    ProviderChain::new(
        providers,
        limiter,
        ChainSettings {
            request_timeout: config.provider_timeout,
            failure_threshold: config.provider_failure_threshold,
            cooldown: config.provider_cooldown,
        },
    )
    .map_err(|_| ConfigError::NoProviders)
}

/// Validate the config and wire cache, chain, models and job store together.
pub async fn build_orchestrator(
    config: &EngineConfig,
) -> Result<BatchOrchestrator, OrchestratorError> {
    build_orchestrator_with(config, build_rate_limiter(config)).await
}

/// Same as [`build_orchestrator`], with a caller-owned rate limiter.
pub async fn build_orchestrator_with(
    config: &EngineConfig,
    limiter: Arc<RateLimiter>,
) -> Result<BatchOrchestrator, OrchestratorError> {
    config.validate()?;

    let chain = build_provider_chain(config, limiter)?;
    let cache = ResultCache::connect(&config.database_url)
        .await?
        .with_retry(WriteRetry {
            attempts: config.cache_write_retries,
            base_backoff: config.cache_write_backoff,
        });

    let jobs = JobStore::new(cache.pool().clone());
    jobs.init_tables().await?;

    let pipeline = AnalysisPipeline::new(
        Arc::new(chain),
        cache,
        ModelSet::reference(config.assumptions),
        Synthesizer::new(config.presets.clone()),
    );

    Ok(BatchOrchestrator::new(
        Arc::new(pipeline),
        jobs,
        BatchSettings {
            concurrency: config.batch_concurrency,
            retry_failed: config.retry_failed,
        },
    ))
}
