use analysis_core::{
    normalize_ticker, AnalysisResult, AnalysisStatus, BusinessType, CacheError, ComponentValues,
    QualityWarning, Recommendation, ValuationModelKind,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

const DATE_FORMAT: &str = "%Y-%m-%d";
/// Keeps `IN (...)` lists well under SQLite's bound-parameter limit
const LOOKUP_CHUNK: usize = 500;

const SELECT_COLUMNS: &str = "SELECT ticker, analysis_date, exchange, computed_at, fair_value,
        current_price, margin_of_safety, upside, dcf_value, epv_value, asset_value,
        weights_json, recommendation, status, warnings_json, error_message,
        business_type, data_source
    FROM analysis_results";

pub(crate) fn db_err(e: sqlx::Error) -> CacheError {
    CacheError::Database(e.to_string())
}

pub(crate) fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// Bounded exponential backoff for cache writes
#[derive(Debug, Clone, Copy)]
pub struct WriteRetry {
    pub attempts: u32,
    pub base_backoff: Duration,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

/// Durable store of one `AnalysisResult` per (ticker, analysis_date).
#[derive(Clone)]
pub struct ResultCache {
    pool: SqlitePool,
    retry: WriteRetry,
}

impl ResultCache {
    /// Open (or create) the database and apply the schema.
    pub async fn connect(database_url: &str) -> Result<Self, CacheError> {
        let memory = is_memory_url(database_url);
        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_err)?
            .create_if_missing(true);
        if !memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every in-memory connection is its own database, so keep exactly one alive
        let pool_options = if memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await.map_err(db_err)?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying the schema if needed.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, CacheError> {
        let cache = Self {
            pool,
            retry: WriteRetry::default(),
        };
        cache.init_schema().await?;
        Ok(cache)
    }

    pub fn with_retry(mut self, retry: WriteRetry) -> Self {
        self.retry = retry;
        self
    }

    async fn init_schema(&self) -> Result<(), CacheError> {
        let schema = include_str!("../schema.sql");

        // sqlx runs one statement per query
        for statement in schema.split(';') {
            let stmt = statement.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&self.pool).await.map_err(db_err)?;
            }
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get(
        &self,
        ticker: &str,
        date: NaiveDate,
    ) -> Result<Option<AnalysisResult>, CacheError> {
        let row = sqlx::query_as::<_, ResultRow>(&format!(
            "{} WHERE ticker = ? AND analysis_date = ?",
            SELECT_COLUMNS
        ))
        .bind(normalize_ticker(ticker))
        .bind(date.format(DATE_FORMAT).to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(ResultRow::into_result).transpose()
    }

    /// Bulk point lookup, keyed by normalized ticker
    pub async fn get_many(
        &self,
        tickers: &[String],
        date: NaiveDate,
    ) -> Result<HashMap<String, AnalysisResult>, CacheError> {
        let date = date.format(DATE_FORMAT).to_string();
        let tickers: Vec<String> = tickers.iter().map(|t| normalize_ticker(t)).collect();
        let mut out = HashMap::with_capacity(tickers.len());

        for chunk in tickers.chunks(LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "{} WHERE analysis_date = ? AND ticker IN ({})",
                SELECT_COLUMNS, placeholders
            );
            let mut query = sqlx::query_as::<_, ResultRow>(&sql).bind(&date);
            for ticker in chunk {
                query = query.bind(ticker);
            }
            for row in query.fetch_all(&self.pool).await.map_err(db_err)? {
                let result = row.into_result()?;
                out.insert(result.ticker.clone(), result);
            }
        }
        Ok(out)
    }

    /// Insert or overwrite the row for (ticker, analysis_date).
    pub async fn put(&self, result: &AnalysisResult) -> Result<(), CacheError> {
        let weights_json = serde_json::to_string(&result.weights_used)?;
        let warnings_json = serde_json::to_string(&result.quality_warnings)?;

        sqlx::query(
            "INSERT INTO analysis_results (
                ticker, analysis_date, exchange, computed_at, fair_value, current_price,
                margin_of_safety, upside, dcf_value, epv_value, asset_value, weights_json,
                recommendation, status, warnings_json, error_message, business_type, data_source
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ticker, analysis_date) DO UPDATE SET
                exchange = excluded.exchange,
                computed_at = excluded.computed_at,
                fair_value = excluded.fair_value,
                current_price = excluded.current_price,
                margin_of_safety = excluded.margin_of_safety,
                upside = excluded.upside,
                dcf_value = excluded.dcf_value,
                epv_value = excluded.epv_value,
                asset_value = excluded.asset_value,
                weights_json = excluded.weights_json,
                recommendation = excluded.recommendation,
                status = excluded.status,
                warnings_json = excluded.warnings_json,
                error_message = excluded.error_message,
                business_type = excluded.business_type,
                data_source = excluded.data_source",
        )
        .bind(normalize_ticker(&result.ticker))
        .bind(result.analysis_date.format(DATE_FORMAT).to_string())
        .bind(result.exchange.as_deref())
        .bind(result.computed_at.to_rfc3339())
        .bind(result.fair_value)
        .bind(result.current_price)
        .bind(result.margin_of_safety)
        .bind(result.upside)
        .bind(result.component_values.dcf)
        .bind(result.component_values.earnings_power)
        .bind(result.component_values.asset_based)
        .bind(&weights_json)
        .bind(result.recommendation.as_str())
        .bind(result.status.as_str())
        .bind(&warnings_json)
        .bind(result.error_message.as_deref())
        .bind(result.business_type.map(|b| b.as_str()))
        .bind(result.data_source.as_deref())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    /// `put` with bounded exponential backoff; gives up with `WriteFailed`.
    pub async fn put_with_retry(&self, result: &AnalysisResult) -> Result<(), CacheError> {
        let attempts = self.retry.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.put(result).await {
                Ok(()) => return Ok(()),
                // A row that cannot be serialized will not serialize on retry either
                Err(e @ CacheError::Serialization(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "Cache write for {} failed (attempt {}/{}): {}",
                        result.ticker,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        let backoff = self.retry.base_backoff * 2u32.pow(attempt - 1);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(CacheError::WriteFailed {
            ticker: result.ticker.clone(),
            attempts,
            message: last_error,
        })
    }

    /// Whether a result exists for today's UTC date
    pub async fn is_fresh(&self, ticker: &str) -> Result<bool, CacheError> {
        self.is_fresh_on(ticker, Utc::now().date_naive()).await
    }

    pub async fn is_fresh_on(&self, ticker: &str, date: NaiveDate) -> Result<bool, CacheError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM analysis_results WHERE ticker = ? AND analysis_date = ?",
        )
        .bind(normalize_ticker(ticker))
        .bind(date.format(DATE_FORMAT).to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }

    /// All results for an exchange on a date, ordered by ticker.
    pub async fn get_exchange(
        &self,
        exchange: &str,
        date: NaiveDate,
    ) -> Result<Vec<AnalysisResult>, CacheError> {
        let rows = sqlx::query_as::<_, ResultRow>(&format!(
            "{} WHERE UPPER(exchange) = ? AND analysis_date = ? ORDER BY ticker",
            SELECT_COLUMNS
        ))
        .bind(exchange.trim().to_uppercase())
        .bind(date.format(DATE_FORMAT).to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(ResultRow::into_result).collect()
    }

    pub async fn count_for_date(&self, date: NaiveDate) -> Result<u64, CacheError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM analysis_results WHERE analysis_date = ?")
                .bind(date.format(DATE_FORMAT).to_string())
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(count.max(0) as u64)
    }

    /// Delete every result older than `date`. Returns the number of rows removed.
    pub async fn purge_before(&self, date: NaiveDate) -> Result<u64, CacheError> {
        let done = sqlx::query("DELETE FROM analysis_results WHERE analysis_date < ?")
            .bind(date.format(DATE_FORMAT).to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if done.rows_affected() > 0 {
            tracing::info!("Purged {} cached results before {}", done.rows_affected(), date);
        }
        Ok(done.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    ticker: String,
    analysis_date: String,
    exchange: Option<String>,
    computed_at: String,
    fair_value: Option<f64>,
    current_price: Option<f64>,
    margin_of_safety: Option<f64>,
    upside: Option<f64>,
    dcf_value: Option<f64>,
    epv_value: Option<f64>,
    asset_value: Option<f64>,
    weights_json: String,
    recommendation: String,
    status: String,
    warnings_json: String,
    error_message: Option<String>,
    business_type: Option<String>,
    data_source: Option<String>,
}

impl ResultRow {
    fn into_result(self) -> Result<AnalysisResult, CacheError> {
        let invalid = |message: String| CacheError::InvalidRow {
            ticker: self.ticker.clone(),
            message,
        };

        let analysis_date = NaiveDate::parse_from_str(&self.analysis_date, DATE_FORMAT)
            .map_err(|e| invalid(format!("analysis_date {}: {}", self.analysis_date, e)))?;
        let computed_at = DateTime::parse_from_rfc3339(&self.computed_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| invalid(format!("computed_at {}: {}", self.computed_at, e)))?;
        let recommendation = Recommendation::parse(&self.recommendation)
            .ok_or_else(|| invalid(format!("recommendation {}", self.recommendation)))?;
        let status = AnalysisStatus::parse(&self.status)
            .ok_or_else(|| invalid(format!("status {}", self.status)))?;
        let weights_used: BTreeMap<ValuationModelKind, f64> =
            serde_json::from_str(&self.weights_json)?;
        let quality_warnings: Vec<QualityWarning> = serde_json::from_str(&self.warnings_json)?;

        Ok(AnalysisResult {
            ticker: self.ticker,
            exchange: self.exchange,
            analysis_date,
            computed_at,
            fair_value: self.fair_value,
            current_price: self.current_price,
            margin_of_safety: self.margin_of_safety,
            upside: self.upside,
            component_values: ComponentValues {
                dcf: self.dcf_value,
                earnings_power: self.epv_value,
                asset_based: self.asset_value,
            },
            weights_used,
            recommendation,
            status,
            quality_warnings,
            error_message: self.error_message,
            business_type: self.business_type.as_deref().and_then(BusinessType::parse),
            data_source: self.data_source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::WarningSeverity;
    use chrono::Duration as ChronoDuration;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn sample(ticker: &str, date: NaiveDate, fair_value: f64) -> AnalysisResult {
        let mut weights = BTreeMap::new();
        weights.insert(ValuationModelKind::Dcf, 0.5);
        weights.insert(ValuationModelKind::EarningsPower, 0.5);
        AnalysisResult {
            ticker: ticker.to_string(),
            exchange: Some("NYSE".to_string()),
            analysis_date: date,
            computed_at: Utc::now(),
            fair_value: Some(fair_value),
            current_price: Some(50.0),
            margin_of_safety: Some((fair_value - 50.0) / fair_value),
            upside: Some((fair_value - 50.0) / 50.0),
            component_values: ComponentValues {
                dcf: Some(fair_value),
                earnings_power: Some(fair_value),
                asset_based: None,
            },
            weights_used: weights,
            recommendation: Recommendation::Buy,
            status: AnalysisStatus::PartialSuccess,
            quality_warnings: vec![QualityWarning::missing(
                "asset_based",
                WarningSeverity::Medium,
                "Asset-based value unavailable",
            )],
            error_message: None,
            business_type: Some(BusinessType::Mature),
            data_source: Some("polygon".to_string()),
        }
    }

    async fn cache() -> ResultCache {
        ResultCache::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = cache().await;
        let result = sample("AAPL", day(2), 60.0);
        cache.put(&result).await.unwrap();

        let loaded = cache.get("aapl", day(2)).await.unwrap().unwrap();
        assert_eq!(loaded.ticker, "AAPL");
        assert_eq!(loaded.fair_value, Some(60.0));
        assert_eq!(loaded.weights_used, result.weights_used);
        assert_eq!(loaded.quality_warnings, result.quality_warnings);
        assert_eq!(loaded.business_type, Some(BusinessType::Mature));
        assert!(cache.get("AAPL", day(3)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let cache = cache().await;
        cache.put(&sample("MSFT", day(2), 60.0)).await.unwrap();
        cache.put(&sample("MSFT", day(2), 75.0)).await.unwrap();
        cache.put(&sample("MSFT", day(2), 75.0)).await.unwrap();

        assert_eq!(cache.count_for_date(day(2)).await.unwrap(), 1);
        let loaded = cache.get("MSFT", day(2)).await.unwrap().unwrap();
        assert_eq!(loaded.fair_value, Some(75.0));
    }

    #[tokio::test]
    async fn test_failed_result_round_trips() {
        let cache = cache().await;
        let failed = AnalysisResult::failed("XYZ", Some("NYSE"), day(2), "No data available");
        cache.put(&failed).await.unwrap();

        let loaded = cache.get("XYZ", day(2)).await.unwrap().unwrap();
        assert!(loaded.is_failed());
        assert_eq!(loaded.error_message.as_deref(), Some("No data available"));
        assert_eq!(loaded.recommendation, Recommendation::Unknown);
    }

    #[tokio::test]
    async fn test_freshness_is_per_calendar_day() {
        let cache = cache().await;
        let today = Utc::now().date_naive();
        let yesterday = today - ChronoDuration::days(1);
        cache.put(&sample("KO", yesterday, 60.0)).await.unwrap();

        assert!(!cache.is_fresh("KO").await.unwrap());
        assert!(cache.is_fresh_on("KO", yesterday).await.unwrap());

        cache.put(&sample("KO", today, 60.0)).await.unwrap();
        assert!(cache.is_fresh(" ko ").await.unwrap());
    }

    #[tokio::test]
    async fn test_exchange_listing_sorted_by_ticker() {
        let cache = cache().await;
        for t in ["MSFT", "AAPL", "KO"] {
            cache.put(&sample(t, day(2), 60.0)).await.unwrap();
        }
        let mut other = sample("SHOP", day(2), 60.0);
        other.exchange = Some("TSX".to_string());
        cache.put(&other).await.unwrap();

        let rows = cache.get_exchange("nyse", day(2)).await.unwrap();
        let tickers: Vec<&str> = rows.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["AAPL", "KO", "MSFT"]);
    }

    #[tokio::test]
    async fn test_get_many_and_purge() {
        let cache = cache().await;
        cache.put(&sample("AAPL", day(1), 60.0)).await.unwrap();
        cache.put(&sample("AAPL", day(2), 60.0)).await.unwrap();
        cache.put(&sample("KO", day(2), 60.0)).await.unwrap();

        let found = cache
            .get_many(&["aapl".to_string(), "KO".to_string(), "NOPE".to_string()], day(2))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains_key("AAPL"));

        assert_eq!(cache.purge_before(day(2)).await.unwrap(), 1);
        assert!(cache.get("AAPL", day(1)).await.unwrap().is_none());
        assert_eq!(cache.count_for_date(day(2)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_write_retry_gives_up_with_write_failed() {
        let cache = cache().await.with_retry(WriteRetry {
            attempts: 3,
            base_backoff: Duration::from_millis(1),
        });
        cache.pool().close().await;

        let err = cache.put_with_retry(&sample("AAPL", day(2), 60.0)).await.unwrap_err();
        assert!(matches!(err, CacheError::WriteFailed { attempts: 3, .. }));
    }
}
