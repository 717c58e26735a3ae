use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Canonical form of a ticker symbol used for storage and lookup.
pub fn normalize_ticker(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Normalize a ticker list: trim, upper-case, drop empties and duplicates
/// while keeping the first occurrence.
pub fn normalize_ticker_list<S: AsRef<str>>(tickers: &[S]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tickers
        .iter()
        .map(|t| normalize_ticker(t.as_ref()))
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// The three valuation methods combined into a fair value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuationModelKind {
    Dcf,
    EarningsPower,
    AssetBased,
}

impl ValuationModelKind {
    pub const ALL: [ValuationModelKind; 3] = [
        ValuationModelKind::Dcf,
        ValuationModelKind::EarningsPower,
        ValuationModelKind::AssetBased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValuationModelKind::Dcf => "dcf",
            ValuationModelKind::EarningsPower => "earnings_power",
            ValuationModelKind::AssetBased => "asset_based",
        }
    }

    pub fn to_label(&self) -> &'static str {
        match self {
            ValuationModelKind::Dcf => "Discounted cash flow",
            ValuationModelKind::EarningsPower => "Earnings power value",
            ValuationModelKind::AssetBased => "Asset-based value",
        }
    }
}

/// Per-model values; `None` means the model could not produce a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentValues {
    pub dcf: Option<f64>,
    pub earnings_power: Option<f64>,
    pub asset_based: Option<f64>,
}

impl ComponentValues {
    pub fn get(&self, kind: ValuationModelKind) -> Option<f64> {
        match kind {
            ValuationModelKind::Dcf => self.dcf,
            ValuationModelKind::EarningsPower => self.earnings_power,
            ValuationModelKind::AssetBased => self.asset_based,
        }
    }

    pub fn set(&mut self, kind: ValuationModelKind, value: Option<f64>) {
        match kind {
            ValuationModelKind::Dcf => self.dcf = value,
            ValuationModelKind::EarningsPower => self.earnings_power = value,
            ValuationModelKind::AssetBased => self.asset_based = value,
        }
    }

    /// Models that produced a finite value, in canonical order.
    pub fn available(&self) -> Vec<ValuationModelKind> {
        ValuationModelKind::ALL
            .iter()
            .copied()
            .filter(|k| self.get(*k).map_or(false, f64::is_finite))
            .collect()
    }
}

/// Business classification used to pick a weight preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessType {
    Growth,
    Mature,
    AssetHeavy,
    Distressed,
}

impl BusinessType {
    pub const ALL: [BusinessType; 4] = [
        BusinessType::Growth,
        BusinessType::Mature,
        BusinessType::AssetHeavy,
        BusinessType::Distressed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessType::Growth => "growth",
            BusinessType::Mature => "mature",
            BusinessType::AssetHeavy => "asset_heavy",
            BusinessType::Distressed => "distressed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "growth" => Some(BusinessType::Growth),
            "mature" => Some(BusinessType::Mature),
            "asset_heavy" => Some(BusinessType::AssetHeavy),
            "distressed" => Some(BusinessType::Distressed),
            _ => None,
        }
    }
}

/// Recommendation derived from margin of safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    StrongBuy,
    Buy,
    Hold,
    Avoid,
    Unknown,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::StrongBuy => "StrongBuy",
            Recommendation::Buy => "Buy",
            Recommendation::Hold => "Hold",
            Recommendation::Avoid => "Avoid",
            Recommendation::Unknown => "Unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "StrongBuy" => Some(Recommendation::StrongBuy),
            "Buy" => Some(Recommendation::Buy),
            "Hold" => Some(Recommendation::Hold),
            "Avoid" => Some(Recommendation::Avoid),
            "Unknown" => Some(Recommendation::Unknown),
            _ => None,
        }
    }

    /// Human-readable label for the recommendation
    pub fn to_label(&self) -> &'static str {
        match self {
            Recommendation::StrongBuy => "Strong Buy",
            Recommendation::Buy => "Buy",
            Recommendation::Hold => "Hold",
            Recommendation::Avoid => "Avoid",
            Recommendation::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Success => "Success",
            AnalysisStatus::PartialSuccess => "PartialSuccess",
            AnalysisStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Success" => Some(AnalysisStatus::Success),
            "PartialSuccess" => Some(AnalysisStatus::PartialSuccess),
            "Failed" => Some(AnalysisStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WarningSeverity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningCategory {
    Assumption,
    MissingData,
    Estimated,
}

/// A data-quality note attached to a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityWarning {
    pub field: String,
    pub severity: WarningSeverity,
    pub category: WarningCategory,
    pub message: String,
}

impl QualityWarning {
    pub fn missing(
        field: impl Into<String>,
        severity: WarningSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            severity,
            category: WarningCategory::MissingData,
            message: message.into(),
        }
    }

    pub fn assumed(
        field: impl Into<String>,
        severity: WarningSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            severity,
            category: WarningCategory::Assumption,
            message: message.into(),
        }
    }

    pub fn estimated(
        field: impl Into<String>,
        severity: WarningSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            severity,
            category: WarningCategory::Estimated,
            message: message.into(),
        }
    }
}

/// Financial inputs normalized to one schema regardless of which provider served them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedFinancialData {
    pub ticker: String,
    pub exchange: Option<String>,
    pub company_name: Option<String>,
    pub currency: Option<String>,
    pub current_price: Option<f64>,
    pub shares_outstanding: Option<f64>,
    pub revenue: Option<f64>,
    /// Year-over-year revenue growth as a fraction (0.12 = 12%)
    pub revenue_growth: Option<f64>,
    pub operating_income: Option<f64>,
    pub net_income: Option<f64>,
    pub eps: Option<f64>,
    pub operating_cash_flow: Option<f64>,
    pub capital_expenditure: Option<f64>,
    pub free_cash_flow: Option<f64>,
    pub total_assets: Option<f64>,
    pub total_liabilities: Option<f64>,
    pub shareholders_equity: Option<f64>,
    pub cash_and_equivalents: Option<f64>,
    pub total_debt: Option<f64>,
    /// Provider that served the data. Diagnostics only.
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    /// Inputs the adapter had to estimate or assume while normalizing
    #[serde(default)]
    pub input_notes: Vec<QualityWarning>,
}

/// Provider response before normalization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawProviderPayload {
    pub provider: String,
    pub body: serde_json::Value,
}

/// One synthesized valuation, identified by (ticker, analysis_date)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub ticker: String,
    pub exchange: Option<String>,
    pub analysis_date: NaiveDate,
    pub computed_at: DateTime<Utc>,
    pub fair_value: Option<f64>,
    pub current_price: Option<f64>,
    pub margin_of_safety: Option<f64>,
    pub upside: Option<f64>,
    pub component_values: ComponentValues,
    pub weights_used: BTreeMap<ValuationModelKind, f64>,
    pub recommendation: Recommendation,
    pub status: AnalysisStatus,
    pub quality_warnings: Vec<QualityWarning>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub business_type: Option<BusinessType>,
    #[serde(default)]
    pub data_source: Option<String>,
}

impl AnalysisResult {
    /// A terminal failure row for a ticker that could not be valued.
    pub fn failed(
        ticker: &str,
        exchange: Option<&str>,
        analysis_date: NaiveDate,
        message: impl Into<String>,
    ) -> Self {
        Self {
            ticker: normalize_ticker(ticker),
            exchange: exchange.map(str::to_string),
            analysis_date,
            computed_at: Utc::now(),
            fair_value: None,
            current_price: None,
            margin_of_safety: None,
            upside: None,
            component_values: ComponentValues::default(),
            weights_used: BTreeMap::new(),
            recommendation: Recommendation::Unknown,
            status: AnalysisStatus::Failed,
            quality_warnings: Vec::new(),
            error_message: Some(message.into()),
            business_type: None,
            data_source: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == AnalysisStatus::Failed
    }
}

/// Outcome of a single provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderOutcome {
    Success,
    RateLimited,
    NotFound,
    TransientError,
    /// Not called because its health tracker tripped
    Skipped,
}

impl ProviderOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderOutcome::Success => "Success",
            ProviderOutcome::RateLimited => "RateLimited",
            ProviderOutcome::NotFound => "NotFound",
            ProviderOutcome::TransientError => "TransientError",
            ProviderOutcome::Skipped => "Skipped",
        }
    }
}

/// Transient record of one provider attempt inside a chain fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub outcome: ProviderOutcome,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
}

/// Result of a successful chain fetch
#[derive(Debug, Clone)]
pub struct ChainFetch {
    pub data: NormalizedFinancialData,
    pub provider: String,
    pub attempts: Vec<ProviderAttempt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchJobStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchJobStatus::Created => "Created",
            BatchJobStatus::Running => "Running",
            BatchJobStatus::Completed => "Completed",
            BatchJobStatus::Failed => "Failed",
            BatchJobStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Created" => Some(BatchJobStatus::Created),
            "Running" => Some(BatchJobStatus::Running),
            "Completed" => Some(BatchJobStatus::Completed),
            "Failed" => Some(BatchJobStatus::Failed),
            "Cancelled" => Some(BatchJobStatus::Cancelled),
            _ => None,
        }
    }

    /// Completed, Failed and Cancelled jobs are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchJobStatus::Completed | BatchJobStatus::Failed | BatchJobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Per-run knobs that are persisted with the job so a resume behaves the same way
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Ignore same-day cached results and refetch every ticker
    pub force_refresh: bool,
    /// Treat cached `Failed` results as misses
    pub retry_failed: bool,
    /// Worker pool size override
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub exchange: String,
    pub analysis_date: NaiveDate,
    pub ticker_list: Vec<String>,
    pub status: BatchJobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counts: BatchCounts,
    pub options: BatchOptions,
    pub error_message: Option<String>,
}

impl BatchJob {
    pub fn new(
        id: String,
        exchange: &str,
        analysis_date: NaiveDate,
        ticker_list: Vec<String>,
        options: BatchOptions,
    ) -> Self {
        let total = ticker_list.len() as u64;
        Self {
            id,
            exchange: exchange.trim().to_uppercase(),
            analysis_date,
            ticker_list,
            status: BatchJobStatus::Created,
            started_at: Utc::now(),
            completed_at: None,
            counts: BatchCounts {
                total,
                ..BatchCounts::default()
            },
            options,
            error_message: None,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
