use crate::health::{HealthTracker, ProviderHealthSnapshot};
use crate::rate_limiter::RateLimiter;
use analysis_core::{
    normalize_ticker, ChainError, ChainFetch, FinancialDataSource, NormalizedFinancialData,
    ProviderAdapter, ProviderAttempt, ProviderError, ProviderOutcome,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Tuning for the fallback chain
#[derive(Debug, Clone)]
pub struct ChainSettings {
    /// Network timeout for an adapter's `fetch_raw`, on top of the rate
    /// limiter's wait budget
    pub request_timeout: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            failure_threshold: 3,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Ordered provider list: one primary followed by backups.
///
/// Each `fetch` tries providers in order and returns the first normalized
/// success. There is no retry against the same provider inside one call;
/// advancing to the next provider is the retry mechanism.
pub struct ProviderChain {
    providers: Vec<Arc<dyn ProviderAdapter>>,
    rate_limiter: Arc<RateLimiter>,
    health: HealthTracker,
    request_timeout: Duration,
}

impl ProviderChain {
    pub fn new(
        providers: Vec<Arc<dyn ProviderAdapter>>,
        rate_limiter: Arc<RateLimiter>,
        settings: ChainSettings,
    ) -> Result<Self, ChainError> {
        if providers.is_empty() {
            return Err(ChainError::NoProviders);
        }
        Ok(Self {
            providers,
            rate_limiter,
            health: HealthTracker::new(settings.failure_threshold, settings.cooldown),
            request_timeout: settings.request_timeout,
        })
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn health_snapshot(&self) -> Vec<ProviderHealthSnapshot> {
        self.health.snapshot()
    }

    /// Fetch normalized financial data, falling back across providers.
    pub async fn fetch(&self, ticker: &str) -> Result<ChainFetch, ChainError> {
        let ticker = normalize_ticker(ticker);
        let mut attempts = Vec::with_capacity(self.providers.len());

        let (mut candidates, skipped): (Vec<_>, Vec<_>) = self
            .providers
            .iter()
            .partition(|p| !self.health.should_skip(p.name()));
        if candidates.is_empty() {
            tracing::warn!("All providers marked unhealthy, probing every provider for {}", ticker);
            candidates = skipped;
        } else {
            for provider in skipped {
                tracing::info!("Skipping unhealthy provider {} for {}", provider.name(), ticker);
                attempts.push(ProviderAttempt {
                    provider: provider.name().to_string(),
                    outcome: ProviderOutcome::Skipped,
                    latency: Duration::ZERO,
                });
            }
        }

        for provider in candidates {
            let name = provider.name().to_string();
            let started = Instant::now();
            let result = self.attempt(provider.as_ref(), &ticker).await;
            let latency = started.elapsed();

            match result {
                Ok(mut data) => {
                    tracing::debug!("{} served {} in {}ms", name, ticker, latency.as_millis());
                    self.health.record(&name, ProviderOutcome::Success);
                    attempts.push(ProviderAttempt {
                        provider: name.clone(),
                        outcome: ProviderOutcome::Success,
                        latency,
                    });
                    data.ticker = ticker.clone();
                    data.source = name.clone();
                    return Ok(ChainFetch {
                        data,
                        provider: name,
                        attempts,
                    });
                }
                Err(e) => {
                    let outcome = e.outcome();
                    tracing::info!(
                        "{} failed for {} ({}), advancing to next provider",
                        name,
                        ticker,
                        e
                    );
                    self.health.record(&name, outcome);
                    attempts.push(ProviderAttempt {
                        provider: name,
                        outcome,
                        latency,
                    });
                }
            }
        }

        Err(ChainError::NoDataAvailable { ticker, attempts })
    }

    async fn attempt(
        &self,
        provider: &dyn ProviderAdapter,
        ticker: &str,
    ) -> Result<NormalizedFinancialData, ProviderError> {
        // Gate waits happen inside fetch_raw, so the timeout includes the wait budget
        let budget = self.request_timeout + self.rate_limiter.wait_timeout();
        let fetch = provider.fetch_raw(ticker, &*self.rate_limiter);
        let raw = match tokio::time::timeout(budget, fetch).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProviderError::Transient(format!(
                    "request timed out after {}s",
                    budget.as_secs()
                )))
            }
        };

        provider.normalize(ticker, raw)
    }
}

#[async_trait]
impl FinancialDataSource for ProviderChain {
    async fn fetch(&self, ticker: &str) -> Result<ChainFetch, ChainError> {
        ProviderChain::fetch(self, ticker).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::{RawProviderPayload, RequestGate};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        NotFound,
        RateLimited,
        Transient,
        Hang,
        BadPayload,
    }

    struct MockProvider {
        name: &'static str,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl MockProvider {
        fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch_raw(
            &self,
            ticker: &str,
            gate: &dyn RequestGate,
        ) -> Result<RawProviderPayload, ProviderError> {
            gate.admit(self.name).await?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(RawProviderPayload {
                    provider: self.name.to_string(),
                    body: serde_json::json!({ "ticker": ticker, "price": 10.0 }),
                }),
                Behavior::BadPayload => Ok(RawProviderPayload {
                    provider: self.name.to_string(),
                    body: serde_json::json!({ "unexpected": true }),
                }),
                Behavior::NotFound => Err(ProviderError::NotFound),
                Behavior::RateLimited => Err(ProviderError::RateLimited),
                Behavior::Transient => Err(ProviderError::Transient("boom".into())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(ProviderError::Transient("unreachable".into()))
                }
            }
        }

        fn normalize(
            &self,
            ticker: &str,
            raw: RawProviderPayload,
        ) -> Result<NormalizedFinancialData, ProviderError> {
            let price = raw
                .body
                .get("price")
                .and_then(|p| p.as_f64())
                .ok_or_else(|| ProviderError::Malformed("missing price".into()))?;
            Ok(NormalizedFinancialData {
                ticker: ticker.to_string(),
                current_price: Some(price),
                source: "mock".into(),
                fetched_at: Utc::now(),
                ..Default::default()
            })
        }
    }

    fn chain(providers: Vec<Arc<MockProvider>>, settings: ChainSettings) -> ProviderChain {
        let adapters: Vec<Arc<dyn ProviderAdapter>> = providers
            .into_iter()
            .map(|p| p as Arc<dyn ProviderAdapter>)
            .collect();
        ProviderChain::new(adapters, Arc::new(RateLimiter::new(Duration::from_secs(1))), settings)
            .unwrap()
    }

    #[tokio::test]
    async fn test_falls_back_to_backup_provider() {
        let a = MockProvider::new("a", Behavior::Transient);
        let b = MockProvider::new("b", Behavior::Succeed);
        let chain = chain(vec![a.clone(), b.clone()], ChainSettings::default());

        let fetched = chain.fetch("aapl").await.unwrap();
        assert_eq!(fetched.provider, "b");
        assert_eq!(fetched.data.ticker, "AAPL");
        assert_eq!(fetched.data.source, "b");
        assert_eq!(fetched.attempts.len(), 2);
        assert_eq!(fetched.attempts[0].provider, "a");
        assert_eq!(fetched.attempts[0].outcome, ProviderOutcome::TransientError);
        assert_eq!(fetched.attempts[1].outcome, ProviderOutcome::Success);
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_primary_success_never_touches_backup() {
        let a = MockProvider::new("a", Behavior::Succeed);
        let b = MockProvider::new("b", Behavior::Succeed);
        let chain = chain(vec![a.clone(), b.clone()], ChainSettings::default());

        chain.fetch("MSFT").await.unwrap();
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_providers_exhausted() {
        let a = MockProvider::new("a", Behavior::NotFound);
        let b = MockProvider::new("b", Behavior::RateLimited);
        let chain = chain(vec![a.clone(), b.clone()], ChainSettings::default());

        match chain.fetch("XYZ").await {
            Err(ChainError::NoDataAvailable { ticker, attempts }) => {
                assert_eq!(ticker, "XYZ");
                let outcomes: Vec<_> = attempts.iter().map(|a| a.outcome).collect();
                assert_eq!(outcomes, vec![ProviderOutcome::NotFound, ProviderOutcome::RateLimited]);
            }
            other => panic!("expected NoDataAvailable, got {:?}", other.map(|f| f.provider)),
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_advances() {
        let a = MockProvider::new("a", Behavior::BadPayload);
        let b = MockProvider::new("b", Behavior::Succeed);
        let chain = chain(vec![a, b], ChainSettings::default());

        let fetched = chain.fetch("AAPL").await.unwrap();
        assert_eq!(fetched.attempts[0].outcome, ProviderOutcome::TransientError);
        assert_eq!(fetched.provider, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_provider_times_out_and_advances() {
        let a = MockProvider::new("a", Behavior::Hang);
        let b = MockProvider::new("b", Behavior::Succeed);
        let settings = ChainSettings {
            request_timeout: Duration::from_secs(5),
            ..ChainSettings::default()
        };
        let chain = chain(vec![a, b], settings);

        let fetched = chain.fetch("AAPL").await.unwrap();
        assert_eq!(fetched.provider, "b");
        assert_eq!(fetched.attempts[0].outcome, ProviderOutcome::TransientError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_timeout_advances_without_calling_provider() {
        let a = MockProvider::new("a", Behavior::Succeed);
        let b = MockProvider::new("b", Behavior::Succeed);
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(100)).with_limit("a", 1));
        let adapters: Vec<Arc<dyn ProviderAdapter>> =
            vec![a.clone() as Arc<dyn ProviderAdapter>, b.clone()];
        let chain = ProviderChain::new(adapters, limiter, ChainSettings::default()).unwrap();

        assert_eq!(chain.fetch("AAPL").await.unwrap().provider, "a");
        let second = chain.fetch("MSFT").await.unwrap();
        assert_eq!(second.provider, "b");
        assert_eq!(second.attempts[0].outcome, ProviderOutcome::RateLimited);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_provider_is_skipped_until_cooldown() {
        let a = MockProvider::new("a", Behavior::Transient);
        let b = MockProvider::new("b", Behavior::Succeed);
        let settings = ChainSettings {
            failure_threshold: 2,
            cooldown: Duration::from_secs(60),
            ..ChainSettings::default()
        };
        let chain = chain(vec![a.clone(), b.clone()], settings);

        chain.fetch("T1").await.unwrap();
        chain.fetch("T2").await.unwrap();
        assert_eq!(a.calls(), 2);

        let skipped = chain.fetch("T3").await.unwrap();
        assert_eq!(a.calls(), 2, "tripped provider must not be called");
        assert_eq!(skipped.attempts.len(), 2);
        assert_eq!(skipped.attempts[0].provider, "a");
        assert_eq!(skipped.attempts[0].outcome, ProviderOutcome::Skipped);
        assert_eq!(skipped.attempts[1].outcome, ProviderOutcome::Success);

        tokio::time::advance(Duration::from_secs(61)).await;
        chain.fetch("T4").await.unwrap();
        assert_eq!(a.calls(), 3, "provider re-probed after cooldown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_chain_reports_skipped_providers() {
        let a = MockProvider::new("a", Behavior::Transient);
        let b = MockProvider::new("b", Behavior::NotFound);
        let settings = ChainSettings {
            failure_threshold: 1,
            ..ChainSettings::default()
        };
        let chain = chain(vec![a.clone(), b.clone()], settings);

        assert!(chain.fetch("T1").await.is_err());
        let err = chain.fetch("T2").await.unwrap_err();
        assert_eq!(err.to_string(), "No data available for T2: a: Skipped, b: NotFound");
        let ChainError::NoDataAvailable { attempts, .. } = err else {
            panic!("expected NoDataAvailable");
        };
        assert_eq!(attempts[0].outcome, ProviderOutcome::Skipped);
        assert_eq!(attempts[0].latency, Duration::ZERO);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_everyone_when_all_unhealthy() {
        let a = MockProvider::new("a", Behavior::Transient);
        let settings = ChainSettings {
            failure_threshold: 1,
            ..ChainSettings::default()
        };
        let chain = chain(vec![a.clone()], settings);

        assert!(chain.fetch("T1").await.is_err());
        assert!(chain.fetch("T2").await.is_err());
        assert_eq!(a.calls(), 2);
        assert!(chain.health_snapshot()[0].skipping);
    }

    #[test]
    fn test_empty_chain_is_rejected() {
        let result = ProviderChain::new(
            Vec::new(),
            Arc::new(RateLimiter::new(Duration::from_secs(1))),
            ChainSettings::default(),
        );
        assert!(matches!(result, Err(ChainError::NoProviders)));
    }
}
