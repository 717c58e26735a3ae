use analysis_core::{
    normalize_ticker, NormalizedFinancialData, ProviderAdapter, ProviderError, QualityWarning,
    RawProviderPayload, RequestGate, WarningSeverity,
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

const BASE_URL: &str = "https://api.polygon.io";
pub const PROVIDER_NAME: &str = "polygon";

/// Primary data provider: Polygon.io reference + financials + snapshot endpoints.
///
/// Every HTTP request passes through the caller's `RequestGate` first. Retries
/// are owned by the provider chain; this adapter makes exactly one pass over its
/// endpoints per `fetch_raw` call.
#[derive(Clone)]
pub struct PolygonClient {
    api_key: String,
    client: Client,
    base_url: String,
}

impl PolygonClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_key,
            client,
            base_url: BASE_URL.to_string(),
        }
    }

    /// Point the client at a different host (proxies, recorded fixtures)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
        gate: &dyn RequestGate,
    ) -> Result<serde_json::Value, ProviderError> {
        gate.admit(PROVIDER_NAME).await?;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(&[("apiKey", self.api_key.as_str())])
            .query(query)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &body));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }

    /// List active US common stock tickers from Polygon reference API.
    /// Paginates automatically. Returns up to `max_tickers` symbols.
    pub async fn list_tickers(
        &self,
        exchange: Option<&str>,
        max_tickers: usize,
        gate: &dyn RequestGate,
    ) -> Result<Vec<String>, ProviderError> {
        let mut tickers = Vec::new();
        let mut cursor: Option<String> = None;
        let page_limit = 1000.to_string();

        loop {
            let mut query = vec![
                ("market", "stocks"),
                ("active", "true"),
                ("type", "CS"),
                ("limit", page_limit.as_str()),
                ("order", "asc"),
                ("sort", "ticker"),
            ];
            if let Some(ex) = exchange {
                query.push(("exchange", ex));
            }
            if let Some(ref c) = cursor {
                query.push(("cursor", c.as_str()));
            }

            let body: TickerListResponse = serde_json::from_value(
                self.get_json("/v3/reference/tickers", &query, gate).await?,
            )
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

            for t in &body.results {
                tickers.push(t.ticker.clone());
                if tickers.len() >= max_tickers {
                    return Ok(tickers);
                }
            }

            cursor = body.next_url.as_deref().and_then(|next| {
                next.split("cursor=")
                    .nth(1)
                    .map(|s| s.split('&').next().unwrap_or(s).to_string())
            });
            if cursor.is_none() {
                break;
            }
        }

        Ok(tickers)
    }
}

#[async_trait]
impl ProviderAdapter for PolygonClient {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn fetch_raw(
        &self,
        ticker: &str,
        gate: &dyn RequestGate,
    ) -> Result<RawProviderPayload, ProviderError> {
        let details = self
            .get_json(&format!("/v3/reference/tickers/{}", ticker), &[], gate)
            .await?;

        let financials = self
            .get_json(
                "/vX/reference/financials",
                &[("ticker", ticker), ("timeframe", "annual"), ("limit", "2")],
                gate,
            )
            .await?;

        let has_financials = financials
            .get("results")
            .and_then(|r| r.as_array())
            .map_or(false, |r| !r.is_empty());
        if !has_financials {
            return Err(ProviderError::NotFound);
        }

        // Price is optional: a missing snapshot only degrades the result
        let snapshot = match self
            .get_json(
                &format!("/v2/snapshot/locale/us/markets/stocks/tickers/{}", ticker),
                &[],
                gate,
            )
            .await
        {
            Ok(v) => v,
            Err(e @ (ProviderError::RateLimited | ProviderError::RateLimitTimeout { .. })) => {
                return Err(e)
            }
            Err(e) => {
                tracing::debug!("Polygon snapshot unavailable for {}: {}", ticker, e);
                serde_json::Value::Null
            }
        };

        Ok(RawProviderPayload {
            provider: PROVIDER_NAME.to_string(),
            body: json!({
                "details": details,
                "financials": financials,
                "snapshot": snapshot,
            }),
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

fn statement_value(statement: &HashMap<String, serde_json::Value>, key: &str) -> Option<f64> {
    statement
        .get(key)
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_f64())
}

/// Map a combined Polygon payload into the shared schema.
pub fn normalize_payload(
    ticker: &str,
    body: serde_json::Value,
) -> Result<NormalizedFinancialData, ProviderError> {
    let payload: CombinedPayload =
        serde_json::from_value(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    let mut results = payload.financials.results.into_iter();
    let latest = results.next().ok_or(ProviderError::NotFound)?;
    let prior = results.next();

    let income = &latest.financials.income_statement;
    let balance = &latest.financials.balance_sheet;
    let cash_flow = &latest.financials.cash_flow_statement;

    let mut notes = Vec::new();
    let details = payload.details.map(|d| d.results);

    let revenue = statement_value(income, "revenues");
    let net_income = statement_value(income, "net_income_loss");
    let eps = statement_value(income, "basic_earnings_per_share");

    let revenue_growth = prior.as_ref().and_then(|p| {
        let prev = statement_value(&p.financials.income_statement, "revenues")?;
        let cur = revenue?;
        (prev.abs() > f64::EPSILON).then(|| (cur - prev) / prev.abs())
    });

    let mut shares_outstanding = details
        .as_ref()
        .and_then(|d| d.weighted_shares_outstanding.or(d.share_class_shares_outstanding));
    if shares_outstanding.is_none() {
        if let (Some(ni), Some(e)) = (net_income, eps) {
            if e.abs() > f64::EPSILON {
                shares_outstanding = Some((ni / e).abs());
                notes.push(QualityWarning::estimated(
                    "shares_outstanding",
                    WarningSeverity::Medium,
                    "Derived from net income / EPS",
                ));
            }
        }
    }

    let operating_cash_flow =
        statement_value(cash_flow, "net_cash_flow_from_operating_activities");
    // Polygon does not break out capex; investing cash flow is the closest proxy
    let investing = statement_value(cash_flow, "net_cash_flow_from_investing_activities");
    let free_cash_flow = match (operating_cash_flow, investing) {
        (Some(ocf), Some(inv)) => {
            notes.push(QualityWarning::estimated(
                "free_cash_flow",
                WarningSeverity::Low,
                "Operating cash flow plus investing cash flow used as a capex proxy",
            ));
            Some(ocf + inv)
        }
        _ => None,
    };

    let snapshot = payload.snapshot;
    let last_trade = snapshot
        .as_ref()
        .and_then(|s| s.ticker.last_trade.as_ref())
        .and_then(|t| t.p);
    let prev_close = snapshot
        .as_ref()
        .and_then(|s| s.ticker.prev_day.as_ref())
        .and_then(|d| d.c);
    let current_price = match (last_trade, prev_close) {
        (Some(p), _) => Some(p),
        (None, Some(c)) => {
            notes.push(QualityWarning::estimated(
                "current_price",
                WarningSeverity::Low,
                "Previous session close used as current price",
            ));
            Some(c)
        }
        (None, None) => None,
    };

    Ok(NormalizedFinancialData {
        ticker: normalize_ticker(ticker),
        exchange: details.as_ref().and_then(|d| d.primary_exchange.clone()),
        company_name: details.as_ref().map(|d| d.name.clone()),
        currency: details.as_ref().and_then(|d| d.currency_name.clone()),
        current_price,
        shares_outstanding,
        revenue,
        revenue_growth,
        operating_income: statement_value(income, "operating_income_loss"),
        net_income,
        eps,
        operating_cash_flow,
        capital_expenditure: None,
        free_cash_flow,
        total_assets: statement_value(balance, "assets"),
        total_liabilities: statement_value(balance, "liabilities"),
        shareholders_equity: statement_value(balance, "equity"),
        cash_and_equivalents: statement_value(balance, "cash"),
        total_debt: statement_value(balance, "long_term_debt"),
        source: PROVIDER_NAME.to_string(),
        fetched_at: Utc::now(),
        input_notes: notes,
    })
}

// Response structures
#[derive(Debug, Deserialize)]
struct CombinedPayload {
    details: Option<TickerDetailsResponse>,
    financials: FinancialsResponse,
    #[serde(default)]
    snapshot: Option<SnapshotResponse>,
}

#[derive(Debug, Deserialize)]
struct TickerListResponse {
    #[serde(default)]
    results: Vec<TickerListEntry>,
    next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TickerListEntry {
    ticker: String,
}

#[derive(Debug, Deserialize)]
struct FinancialsResponse {
    #[serde(default)]
    results: Vec<FinancialResult>,
}

#[derive(Debug, Deserialize)]
struct FinancialResult {
    financials: FinancialStatements,
}

#[derive(Debug, Deserialize)]
struct FinancialStatements {
    #[serde(default)]
    income_statement: HashMap<String, serde_json::Value>,
    #[serde(default)]
    balance_sheet: HashMap<String, serde_json::Value>,
    #[serde(default)]
    cash_flow_statement: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TickerDetailsResponse {
    results: TickerDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerDetails {
    pub ticker: String,
    pub name: String,
    pub primary_exchange: Option<String>,
    pub currency_name: Option<String>,
    pub market_cap: Option<f64>,
    pub share_class_shares_outstanding: Option<f64>,
    pub weighted_shares_outstanding: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    ticker: SnapshotTicker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTicker {
    #[serde(rename = "lastTrade")]
    pub last_trade: Option<SnapshotLastTrade>,
    #[serde(rename = "prevDay")]
    pub prev_day: Option<SnapshotDay>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDay {
    pub c: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotLastTrade {
    pub p: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::WarningCategory;

    fn statement(entries: &[(&str, f64)]) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (k, v) in entries {
            map.insert(k.to_string(), json!({ "value": v }));
        }
        serde_json::Value::Object(map)
    }

    fn fixture(with_snapshot: bool, with_shares: bool) -> serde_json::Value {
        let details = if with_shares {
            json!({ "results": {
                "ticker": "AAPL", "name": "Apple Inc.", "primary_exchange": "XNAS",
                "currency_name": "usd", "weighted_shares_outstanding": 15_000_000_000.0
            }})
        } else {
            json!({ "results": { "ticker": "AAPL", "name": "Apple Inc." } })
        };
        let snapshot = if with_snapshot {
            json!({ "ticker": { "lastTrade": { "p": 187.5 }, "prevDay": { "c": 185.0 } } })
        } else {
            serde_json::Value::Null
        };
        json!({
            "details": details,
            "financials": { "results": [
                { "financials": {
                    "income_statement": statement(&[
                        ("revenues", 110.0), ("operating_income_loss", 30.0),
                        ("net_income_loss", 25.0), ("basic_earnings_per_share", 5.0)
                    ]),
                    "balance_sheet": statement(&[
                        ("assets", 300.0), ("liabilities", 200.0), ("equity", 100.0)
                    ]),
                    "cash_flow_statement": statement(&[
                        ("net_cash_flow_from_operating_activities", 40.0),
                        ("net_cash_flow_from_investing_activities", -10.0)
                    ])
                }},
                { "financials": {
                    "income_statement": statement(&[("revenues", 100.0)]),
                    "balance_sheet": {},
                    "cash_flow_statement": {}
                }}
            ]},
            "snapshot": snapshot
        })
    }

    #[test]
    fn test_normalize_full_payload() {
        let data = normalize_payload("aapl", fixture(true, true)).unwrap();
        assert_eq!(data.ticker, "AAPL");
        assert_eq!(data.exchange.as_deref(), Some("XNAS"));
        assert_eq!(data.current_price, Some(187.5));
        assert_eq!(data.shares_outstanding, Some(15_000_000_000.0));
        assert_eq!(data.free_cash_flow, Some(30.0));
        assert!((data.revenue_growth.unwrap() - 0.10).abs() < 1e-9);
        assert_eq!(data.source, PROVIDER_NAME);
    }

    #[test]
    fn test_normalize_estimates_missing_shares() {
        let data = normalize_payload("AAPL", fixture(false, false)).unwrap();
        assert_eq!(data.shares_outstanding, Some(5.0));
        assert_eq!(data.current_price, None);
        assert!(data
            .input_notes
            .iter()
            .any(|n| n.field == "shares_outstanding" && n.category == WarningCategory::Estimated));
    }

    #[test]
    fn test_normalize_without_financials_is_not_found() {
        let body = json!({ "details": null, "financials": { "results": [] }, "snapshot": null });
        assert_eq!(normalize_payload("XYZ", body).unwrap_err(), ProviderError::NotFound);
    }
}
