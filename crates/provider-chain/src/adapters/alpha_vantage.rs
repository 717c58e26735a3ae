use analysis_core::{
    normalize_ticker, NormalizedFinancialData, ProviderAdapter, ProviderError, QualityWarning,
    RawProviderPayload, RequestGate, WarningSeverity,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

const BASE_URL: &str = "https://www.alphavantage.co/query";
pub const PROVIDER_NAME: &str = "alpha_vantage";

/// Backup provider: Alpha Vantage company overview + global quote.
#[derive(Clone)]
pub struct AlphaVantageClient {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
}

impl AlphaVantageClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn query(
        &self,
        function: &str,
        symbol: &str,
        gate: &dyn RequestGate,
    ) -> Result<serde_json::Value, ProviderError> {
        gate.admit(PROVIDER_NAME).await?;
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("function", function),
                ("symbol", symbol),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &body));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        check_body(&json)?;
        Ok(json)
    }
}

/// Alpha Vantage answers HTTP 200 for errors and quota exhaustion; the body says which.
pub fn check_body(json: &serde_json::Value) -> Result<(), ProviderError> {
    if json.get("Note").is_some() || json.get("Information").is_some() {
        return Err(ProviderError::RateLimited);
    }
    if json.get("Error Message").is_some() {
        return Err(ProviderError::NotFound);
    }
    if json.as_object().map_or(true, |o| o.is_empty()) {
        return Err(ProviderError::NotFound);
    }
    Ok(())
}

#[async_trait]
impl ProviderAdapter for AlphaVantageClient {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn fetch_raw(
        &self,
        ticker: &str,
        gate: &dyn RequestGate,
    ) -> Result<RawProviderPayload, ProviderError> {
        let overview = self.query("OVERVIEW", ticker, gate).await?;
        let quote = match self.query("GLOBAL_QUOTE", ticker, gate).await {
            Ok(q) => q,
            Err(e @ (ProviderError::RateLimited | ProviderError::RateLimitTimeout { .. })) => {
                return Err(e)
            }
            Err(e) => {
                tracing::debug!("Alpha Vantage quote unavailable for {}: {}", ticker, e);
                serde_json::Value::Null
            }
        };

        Ok(RawProviderPayload {
            provider: PROVIDER_NAME.to_string(),
            body: json!({ "overview": overview, "quote": quote }),
        })
    }

    fn normalize(
        &self,
        ticker: &str,
        raw: RawProviderPayload,
    ) -> Result<NormalizedFinancialData, ProviderError> {
        normalize_payload(ticker, raw.body)
    }
}

/// Alpha Vantage encodes numbers as strings and uses "None" / "-" for missing values.
fn num(v: &Option<String>) -> Option<f64> {
    v.as_deref()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|f| f.is_finite())
}

pub fn normalize_payload(
    ticker: &str,
    body: serde_json::Value,
) -> Result<NormalizedFinancialData, ProviderError> {
    let overview: CompanyOverview = serde_json::from_value(
        body.get("overview").cloned().unwrap_or(serde_json::Value::Null),
    )
    .map_err(|e| ProviderError::Malformed(e.to_string()))?;

    let quote: Option<GlobalQuote> = body
        .get("quote")
        .and_then(|q| q.get("Global Quote"))
        .and_then(|q| serde_json::from_value(q.clone()).ok());

    let mut notes = Vec::new();

    let revenue = num(&overview.revenue_ttm);
    let shares = num(&overview.shares_outstanding);

    let operating_income = match (revenue, num(&overview.operating_margin_ttm)) {
        (Some(r), Some(m)) => {
            notes.push(QualityWarning::estimated(
                "operating_income",
                WarningSeverity::Medium,
                "Derived from TTM revenue x operating margin",
            ));
            Some(r * m)
        }
        _ => None,
    };

    let net_income = match (revenue, num(&overview.profit_margin)) {
        (Some(r), Some(m)) => {
            notes.push(QualityWarning::estimated(
                "net_income",
                WarningSeverity::Low,
                "Derived from TTM revenue x profit margin",
            ));
            Some(r * m)
        }
        _ => None,
    };

    let shareholders_equity = match (num(&overview.book_value), shares) {
        (Some(bvps), Some(s)) => {
            notes.push(QualityWarning::estimated(
                "shareholders_equity",
                WarningSeverity::Low,
                "Derived from book value per share x shares outstanding",
            ));
            Some(bvps * s)
        }
        _ => None,
    };

    let current_price = quote.as_ref().and_then(|q| num(&q.price));

    Ok(NormalizedFinancialData {
        ticker: normalize_ticker(ticker),
        exchange: overview.exchange.clone(),
        company_name: overview.name.clone(),
        currency: overview.currency.clone(),
        current_price,
        shares_outstanding: shares,
        revenue,
        revenue_growth: num(&overview.quarterly_revenue_growth_yoy),
        operating_income,
        net_income,
        eps: num(&overview.eps),
        operating_cash_flow: None,
        capital_expenditure: None,
        free_cash_flow: None,
        total_assets: None,
        total_liabilities: None,
        shareholders_equity,
        cash_and_equivalents: None,
        total_debt: None,
        source: PROVIDER_NAME.to_string(),
        fetched_at: Utc::now(),
        input_notes: notes,
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompanyOverview {
    #[serde(rename = "Symbol")]
    pub symbol: Option<String>,
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "Exchange")]
    pub exchange: Option<String>,
    #[serde(rename = "Currency")]
    pub currency: Option<String>,
    #[serde(rename = "BookValue")]
    pub book_value: Option<String>,
    #[serde(rename = "EPS")]
    pub eps: Option<String>,
    #[serde(rename = "ProfitMargin")]
    pub profit_margin: Option<String>,
    #[serde(rename = "OperatingMarginTTM")]
    pub operating_margin_ttm: Option<String>,
    #[serde(rename = "RevenueTTM")]
    pub revenue_ttm: Option<String>,
    #[serde(rename = "QuarterlyRevenueGrowthYOY")]
    pub quarterly_revenue_growth_yoy: Option<String>,
    #[serde(rename = "SharesOutstanding")]
    pub shares_outstanding: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GlobalQuote {
    #[serde(rename = "05. price")]
    price: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_note_is_rate_limited() {
        let note = "Thank you for using Alpha Vantage! Our standard API call frequency is 5 calls \
                    per minute";
        let body = json!({ "Note": note });
        assert_eq!(check_body(&body).unwrap_err(), ProviderError::RateLimited);
        let info = json!({ "Information": "API rate limit reached" });
        assert_eq!(check_body(&info).unwrap_err(), ProviderError::RateLimited);
    }

    #[test]
    fn test_empty_overview_is_not_found() {
        assert_eq!(check_body(&json!({})).unwrap_err(), ProviderError::NotFound);
        assert_eq!(
            check_body(&json!({ "Error Message": "Invalid API call" })).unwrap_err(),
            ProviderError::NotFound
        );
    }

    #[test]
    fn test_normalize_overview() {
        let body = json!({
            "overview": {
                "Symbol": "IBM", "Name": "International Business Machines", "Exchange": "NYSE",
                "Currency": "USD", "BookValue": "24.5", "EPS": "6.4", "ProfitMargin": "0.1",
                "OperatingMarginTTM": "0.15", "RevenueTTM": "60000000000",
                "QuarterlyRevenueGrowthYOY": "0.02", "SharesOutstanding": "900000000"
            },
            "quote": { "Global Quote": { "05. price": "170.25" } }
        });
        let data = normalize_payload("ibm", body).unwrap();
        assert_eq!(data.ticker, "IBM");
        assert_eq!(data.exchange.as_deref(), Some("NYSE"));
        assert_eq!(data.current_price, Some(170.25));
        assert_eq!(data.operating_income, Some(9_000_000_000.0));
        assert_eq!(data.shareholders_equity, Some(24.5 * 900_000_000.0));
        assert_eq!(data.input_notes.len(), 3);
        assert!(data.free_cash_flow.is_none());
    }

    #[test]
    fn test_placeholder_strings_are_absent() {
        let body = json!({
            "overview": { "Symbol": "XYZ", "EPS": "None", "RevenueTTM": "-" },
            "quote": null
        });
        let data = normalize_payload("XYZ", body).unwrap();
        assert!(data.eps.is_none());
        assert!(data.revenue.is_none());
        assert!(data.current_price.is_none());
    }
}
