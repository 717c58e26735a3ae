use analysis_core::{
    normalize_ticker, NormalizedFinancialData, ProviderAdapter, ProviderError, QualityWarning,
    RawProviderPayload, RequestGate, WarningSeverity,
};
use async_trait::async_trait;
use chrono::Utc;

const BASE_URL: &str = "https://query2.finance.yahoo.com/v10/finance/quoteSummary";
const MODULES: &str =
    "price,financialData,defaultKeyStatistics,incomeStatementHistory,balanceSheetHistory";
pub const PROVIDER_NAME: &str = "yahoo";

/// Backup provider: Yahoo Finance quote summary modules. No API key.
#[derive(Clone)]
pub struct YahooFinanceClient {
    client: reqwest::Client,
    base_url: String,
}

impl YahooFinanceClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl Default for YahooFinanceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for YahooFinanceClient {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn fetch_raw(
        &self,
        ticker: &str,
        gate: &dyn RequestGate,
    ) -> Result<RawProviderPayload, ProviderError> {
        gate.admit(PROVIDER_NAME).await?;
        let url = format!("{}/{}", self.base_url, ticker);
        let response = self
            .client
            .get(&url)
            .query(&[("modules", MODULES)])
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

        Ok(RawProviderPayload {
            provider: PROVIDER_NAME.to_string(),
            body: json,
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

/// Yahoo wraps numbers as `{"raw": 1.0, "fmt": "1.00"}`
fn raw_value(module: Option<&serde_json::Value>, key: &str) -> Option<f64> {
    module?
        .get(key)
        .and_then(|v| v.get("raw").or(Some(v)))
        .and_then(|v| v.as_f64())
        .filter(|f| f.is_finite())
}

fn text_value(module: Option<&serde_json::Value>, key: &str) -> Option<String> {
    module?.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

pub fn normalize_payload(
    ticker: &str,
    body: serde_json::Value,
) -> Result<NormalizedFinancialData, ProviderError> {
    let summary = body
        .get("quoteSummary")
        .ok_or_else(|| ProviderError::Malformed("missing quoteSummary".to_string()))?;

    if summary.get("error").map_or(false, |e| !e.is_null()) {
        return Err(ProviderError::NotFound);
    }

    let result = summary
        .get("result")
        .and_then(|r| r.as_array())
        .and_then(|arr| arr.first())
        .ok_or(ProviderError::NotFound)?;

    let price = result.get("price");
    let financial = result.get("financialData");
    let stats = result.get("defaultKeyStatistics");
    let income = result
        .get("incomeStatementHistory")
        .and_then(|m| m.get("incomeStatementHistory"))
        .and_then(|h| h.as_array())
        .and_then(|h| h.first());
    let balance = result
        .get("balanceSheetHistory")
        .and_then(|m| m.get("balanceSheetStatements"))
        .and_then(|h| h.as_array())
        .and_then(|h| h.first());

    let mut notes = Vec::new();

    let current_price = raw_value(price, "regularMarketPrice").or_else(|| {
        let fallback = raw_value(financial, "currentPrice");
        if fallback.is_some() {
            notes.push(QualityWarning::estimated(
                "current_price",
                WarningSeverity::Low,
                "financialData.currentPrice used; regular market price missing",
            ));
        }
        fallback
    });

    let operating_cash_flow = raw_value(financial, "operatingCashflow");
    let free_cash_flow = raw_value(financial, "freeCashflow");

    Ok(NormalizedFinancialData {
        ticker: normalize_ticker(ticker),
        exchange: text_value(price, "exchangeName"),
        company_name: text_value(price, "longName").or_else(|| text_value(price, "shortName")),
        currency: text_value(price, "currency"),
        current_price,
        shares_outstanding: raw_value(stats, "sharesOutstanding"),
        revenue: raw_value(financial, "totalRevenue"),
        revenue_growth: raw_value(financial, "revenueGrowth"),
        operating_income: raw_value(income, "operatingIncome"),
        net_income: raw_value(income, "netIncome"),
        eps: raw_value(stats, "trailingEps"),
        operating_cash_flow,
        capital_expenditure: match (operating_cash_flow, free_cash_flow) {
            (Some(ocf), Some(fcf)) => Some(ocf - fcf),
            _ => None,
        },
        free_cash_flow,
        total_assets: raw_value(balance, "totalAssets"),
        total_liabilities: raw_value(balance, "totalLiab"),
        shareholders_equity: raw_value(balance, "totalStockholderEquity"),
        cash_and_equivalents: raw_value(financial, "totalCash"),
        total_debt: raw_value(financial, "totalDebt"),
        source: PROVIDER_NAME.to_string(),
        fetched_at: Utc::now(),
        input_notes: notes,
    })
}
