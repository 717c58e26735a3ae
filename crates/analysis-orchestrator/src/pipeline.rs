use analysis_core::{normalize_ticker, AnalysisResult, FinancialDataSource};
use chrono::NaiveDate;
use dashmap::DashMap;
use result_cache::ResultCache;
use std::sync::Arc;
use tokio::sync::Mutex;
use valuation_synthesizer::{classify_business, ModelSet, Synthesizer, ValuationInputs};

/// When a cached same-day result may be served instead of recomputing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Serve any cached result, including a cached failure
    Never,
    /// Serve cached successes; recompute cached failures
    FailedOnly,
    /// Always recompute and overwrite
    Always,
}

impl Refresh {
    pub fn serves(&self, cached: &AnalysisResult) -> bool {
        match self {
            Refresh::Never => true,
            Refresh::FailedOnly => !cached.is_failed(),
            Refresh::Always => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub result: AnalysisResult,
    /// Served from the cache with no provider call
    pub from_cache: bool,
    /// Written to the cache by this call
    pub persisted: bool,
}

/// Single-ticker path: cache lookup, provider chain, models, synthesis, cache write.
pub struct AnalysisPipeline {
    source: Arc<dyn FinancialDataSource>,
    cache: ResultCache,
    models: ModelSet,
    synthesizer: Synthesizer,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl AnalysisPipeline {
    pub fn new(
        source: Arc<dyn FinancialDataSource>,
        cache: ResultCache,
        models: ModelSet,
        synthesizer: Synthesizer,
    ) -> Self {
        Self {
            source,
            cache,
            models,
            synthesizer,
            in_flight: DashMap::new(),
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Analyze one ticker for `date`. Never fails: problems come back as a `Failed` result.
    pub async fn analyze(
        &self,
        ticker: &str,
        exchange: Option<&str>,
        date: NaiveDate,
        force_refresh: bool,
    ) -> AnalysisOutcome {
        let refresh = if force_refresh {
            Refresh::Always
        } else {
            Refresh::Never
        };
        self.analyze_with(ticker, exchange, date, refresh).await
    }

    pub async fn analyze_with(
        &self,
        ticker: &str,
        exchange: Option<&str>,
        date: NaiveDate,
        refresh: Refresh,
    ) -> AnalysisOutcome {
        let ticker = normalize_ticker(ticker);
        if ticker.is_empty() {
            return AnalysisOutcome {
                result: AnalysisResult::failed(&ticker, exchange, date, "Empty ticker symbol"),
                from_cache: false,
                persisted: false,
            };
        }

        if let Some(hit) = self.cached(&ticker, date, refresh).await {
            return hit;
        }

        // At most one computation per (ticker, date) at a time
        let key = format!("{}:{}", ticker, date);
        let lock = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let outcome = {
            let _guard = lock.lock().await;
            // Whoever held the lock before us may have just written the result
            match self.cached(&ticker, date, refresh).await {
                Some(hit) => hit,
                None => self.compute_and_store(&ticker, exchange, date).await,
            }
        };

        drop(lock);
        self.in_flight.remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        outcome
    }

    async fn cached(
        &self,
        ticker: &str,
        date: NaiveDate,
        refresh: Refresh,
    ) -> Option<AnalysisOutcome> {
        if refresh == Refresh::Always {
            return None;
        }
        match self.cache.get(ticker, date).await {
            Ok(Some(result)) if refresh.serves(&result) => Some(AnalysisOutcome {
                result,
                from_cache: true,
                persisted: false,
            }),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Cache read for {} failed, recomputing: {}", ticker, e);
                None
            }
        }
    }

    async fn compute_and_store(
        &self,
        ticker: &str,
        exchange: Option<&str>,
        date: NaiveDate,
    ) -> AnalysisOutcome {
        let result = match self.source.fetch(ticker).await {
            Ok(fetch) => {
                let data = fetch.data;
                let components = self.models.compute_all(&data);
                let business_type = classify_business(&data);
                tracing::debug!(
                    "{}: served by {} after {} attempt(s), classified {}",
                    ticker,
                    fetch.provider,
                    fetch.attempts.len(),
                    business_type.as_str()
                );

                self.synthesizer.synthesize(
                    ValuationInputs {
                        ticker: ticker.to_string(),
                        exchange: exchange.map(str::to_string).or(data.exchange),
                        analysis_date: date,
                        current_price: data.current_price,
                        components,
                        input_notes: data.input_notes,
                        data_source: Some(fetch.provider),
                    },
                    business_type,
                )
            }
            Err(e) => {
                tracing::info!("{}: {}", ticker, e);
                AnalysisResult::failed(ticker, exchange, date, e.to_string())
            }
        };

        match self.cache.put_with_retry(&result).await {
            Ok(()) => AnalysisOutcome {
                result,
                from_cache: false,
                persisted: true,
            },
            Err(e) => {
                tracing::error!("{}: {}", ticker, e);
                let mut failed = AnalysisResult::failed(ticker, exchange, date, e.to_string());
                failed.data_source = result.data_source;
                AnalysisOutcome {
                    result: failed,
                    from_cache: false,
                    persisted: false,
                }
            }
        }
    }
}
