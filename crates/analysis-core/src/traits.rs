use crate::{
    ChainError, ChainFetch, NormalizedFinancialData, ProviderError, RawProviderPayload,
    ValuationModelKind,
};
use async_trait::async_trait;

/// Admission control consulted before every outbound HTTP request.
#[async_trait]
pub trait RequestGate: Send + Sync {
    /// Wait for a request slot for `provider`, or fail with `RateLimitTimeout`.
    async fn admit(&self, provider: &str) -> Result<(), ProviderError>;
}

/// A financial data provider. One implementation per upstream API.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable identifier, also used as the rate-limiter key
    fn name(&self) -> &str;

    /// Fetch the raw payload, passing every HTTP request through `gate` first.
    async fn fetch_raw(
        &self,
        ticker: &str,
        gate: &dyn RequestGate,
    ) -> Result<RawProviderPayload, ProviderError>;

    /// Convert this provider's payload into the shared schema.
    fn normalize(
        &self,
        ticker: &str,
        raw: RawProviderPayload,
    ) -> Result<NormalizedFinancialData, ProviderError>;
}

/// Something that can produce normalized financial data for a ticker
#[async_trait]
pub trait FinancialDataSource: Send + Sync {
    async fn fetch(&self, ticker: &str) -> Result<ChainFetch, ChainError>;
}

/// Pure valuation model: per-share value or `None` when inputs are insufficient
pub trait ValuationModel: Send + Sync {
    fn kind(&self) -> ValuationModelKind;
    fn compute(&self, data: &NormalizedFinancialData) -> Option<f64>;
}
