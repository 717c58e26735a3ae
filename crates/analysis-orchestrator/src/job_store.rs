use analysis_core::{BatchCounts, BatchJob, BatchJobStatus, BatchOptions};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

type StoreResult<T> = Result<T, sqlx::Error>;

const SELECT_JOBS: &str = "SELECT id, exchange, analysis_date, ticker_list, status, started_at,
    completed_at, total, processed, succeeded, failed, options_json, error_message
    FROM batch_jobs";

/// One ticker's terminal outcome within a batch job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerProgress {
    pub ticker: String,
    pub succeeded: bool,
    pub from_cache: bool,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Durable BatchJob rows and their per-ticker progress.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS batch_jobs (
                id TEXT PRIMARY KEY,
                exchange TEXT NOT NULL,
                analysis_date TEXT NOT NULL,
                ticker_list TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                total INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                options_json TEXT NOT NULL DEFAULT '{}',
                error_message TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS batch_progress (
                job_id TEXT NOT NULL,
                ticker TEXT NOT NULL,
                succeeded INTEGER NOT NULL,
                from_cache INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (job_id, ticker)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_batch_jobs_status ON batch_jobs(status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn insert(&self, job: &BatchJob) -> StoreResult<()> {
        let tickers_json =
            serde_json::to_string(&job.ticker_list).unwrap_or_else(|_| "[]".into());
        let options_json = serde_json::to_string(&job.options).unwrap_or_else(|_| "{}".into());

        sqlx::query(
            "INSERT INTO batch_jobs (
                id, exchange, analysis_date, ticker_list, status, started_at, completed_at,
                total, processed, succeeded, failed, options_json, error_message, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.exchange)
        .bind(job.analysis_date.to_string())
        .bind(&tickers_json)
        .bind(job.status.as_str())
        .bind(job.started_at.to_rfc3339())
        .bind(job.completed_at.map(|d| d.to_rfc3339()))
        .bind(job.counts.total as i64)
        .bind(job.counts.processed as i64)
        .bind(job.counts.succeeded as i64)
        .bind(job.counts.failed as i64)
        .bind(&options_json)
        .bind(job.error_message.as_deref())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist status, counters, completion time and error message.
    pub async fn update(&self, job: &BatchJob) -> StoreResult<()> {
        sqlx::query(
            "UPDATE batch_jobs SET status = ?, completed_at = ?, processed = ?, succeeded = ?,
                failed = ?, error_message = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(job.status.as_str())
        .bind(job.completed_at.map(|d| d.to_rfc3339()))
        .bind(job.counts.processed as i64)
        .bind(job.counts.succeeded as i64)
        .bind(job.counts.failed as i64)
        .bind(job.error_message.as_deref())
        .bind(Utc::now().to_rfc3339())
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write one ticker outcome and the job's new counters in one transaction.
    pub async fn record_progress(
        &self,
        job: &BatchJob,
        progress: &TickerProgress,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO batch_progress
                (job_id, ticker, succeeded, from_cache, error_message, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(job_id, ticker) DO UPDATE SET
                succeeded = excluded.succeeded,
                from_cache = excluded.from_cache,
                error_message = excluded.error_message,
                recorded_at = excluded.recorded_at",
        )
        .bind(&job.id)
        .bind(&progress.ticker)
        .bind(progress.succeeded)
        .bind(progress.from_cache)
        .bind(progress.error_message.as_deref())
        .bind(progress.recorded_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE batch_jobs SET processed = ?, succeeded = ?, failed = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(job.counts.processed as i64)
        .bind(job.counts.succeeded as i64)
        .bind(job.counts.failed as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(&job.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }

    pub async fn progress_for(&self, job_id: &str) -> StoreResult<Vec<TickerProgress>> {
        let rows = sqlx::query_as::<_, ProgressRow>(
            "SELECT ticker, succeeded, from_cache, error_message, recorded_at
             FROM batch_progress WHERE job_id = ? ORDER BY recorded_at",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ProgressRow::into_progress).collect())
    }

    pub async fn get(&self, job_id: &str) -> StoreResult<Option<BatchJob>> {
        let sql = format!("{} WHERE id = ?", SELECT_JOBS);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(JobRow::into_job))
    }

    /// Most recent jobs first
    pub async fn list(&self, limit: u32) -> StoreResult<Vec<BatchJob>> {
        let sql = format!("{} ORDER BY started_at DESC LIMIT ?", SELECT_JOBS);
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().filter_map(JobRow::into_job).collect())
    }

    /// Jobs that never reached a terminal status
    pub async fn unfinished(&self) -> StoreResult<Vec<BatchJob>> {
        let sql = format!(
            "{} WHERE status IN ('Created', 'Running') ORDER BY started_at",
            SELECT_JOBS
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().filter_map(JobRow::into_job).collect())
    }
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    ticker: String,
    succeeded: bool,
    from_cache: bool,
    error_message: Option<String>,
    recorded_at: String,
}

impl ProgressRow {
    fn into_progress(self) -> TickerProgress {
        TickerProgress {
            ticker: self.ticker,
            succeeded: self.succeeded,
            from_cache: self.from_cache,
            error_message: self.error_message,
            recorded_at: parse_timestamp(&self.recorded_at).unwrap_or_else(Utc::now),
        }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    exchange: String,
    analysis_date: String,
    ticker_list: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    total: i64,
    processed: i64,
    succeeded: i64,
    failed: i64,
    options_json: String,
    error_message: Option<String>,
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

impl JobRow {
    /// Rows that do not parse are logged and skipped
    fn into_job(self) -> Option<BatchJob> {
        let status = BatchJobStatus::parse(&self.status);
        let date = NaiveDate::parse_from_str(&self.analysis_date, "%Y-%m-%d").ok();
        let started_at = parse_timestamp(&self.started_at);
        let ticker_list: Option<Vec<String>> = serde_json::from_str(&self.ticker_list).ok();

        let (Some(status), Some(analysis_date), Some(started_at), Some(ticker_list)) =
            (status, date, started_at, ticker_list)
        else {
            tracing::warn!("Skipping unreadable batch job row {}", self.id);
            return None;
        };

        Some(BatchJob {
            id: self.id,
            exchange: self.exchange,
            analysis_date,
            ticker_list,
            status,
            started_at,
            completed_at: self.completed_at.as_deref().and_then(parse_timestamp),
            counts: BatchCounts {
                total: self.total.max(0) as u64,
                processed: self.processed.max(0) as u64,
                succeeded: self.succeeded.max(0) as u64,
                failed: self.failed.max(0) as u64,
            },
            options: serde_json::from_str::<BatchOptions>(&self.options_json).unwrap_or_default(),
            error_message: self.error_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> JobStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = JobStore::new(pool);
        store.init_tables().await.unwrap();
        store
    }

    fn job(id: &str) -> BatchJob {
        BatchJob::new(
            id.to_string(),
            "nyse",
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            vec!["AAPL".into(), "MSFT".into()],
            BatchOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_insert_get_update() {
        let store = store().await;
        let mut j = job("job-1");
        store.insert(&j).await.unwrap();

        let loaded = store.get("job-1").await.unwrap().unwrap();
        assert_eq!(loaded, j);

        j.status = BatchJobStatus::Completed;
        j.completed_at = Some(Utc::now());
        j.counts.processed = 2;
        j.counts.succeeded = 2;
        store.update(&j).await.unwrap();

        let loaded = store.get("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, BatchJobStatus::Completed);
        assert_eq!(loaded.counts.succeeded, 2);
        assert!(loaded.completed_at.is_some());
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_progress_is_upserted_per_ticker() {
        let store = store().await;
        let mut j = job("job-2");
        store.insert(&j).await.unwrap();

        let entry = TickerProgress {
            ticker: "AAPL".into(),
            succeeded: false,
            from_cache: false,
            error_message: Some("No data".into()),
            recorded_at: Utc::now(),
        };
        j.counts.processed = 1;
        j.counts.failed = 1;
        store.record_progress(&j, &entry).await.unwrap();
        store.record_progress(&j, &entry).await.unwrap();

        let progress = store.progress_for("job-2").await.unwrap();
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].error_message.as_deref(), Some("No data"));
        assert_eq!(store.get("job-2").await.unwrap().unwrap().counts.failed, 1);
    }

    #[tokio::test]
    async fn test_init_tables_is_idempotent_and_indexed() {
        let store = store().await;
        store.init_tables().await.unwrap();

        let (indexes,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'index' AND name = 'idx_batch_jobs_status'",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(indexes, 1);
    }

    #[tokio::test]
    async fn test_init_tables_reports_index_failure() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        // Older layout without a status column: the tables exist, the index cannot
        sqlx::query("CREATE TABLE batch_jobs (id TEXT PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();

        assert!(JobStore::new(pool).init_tables().await.is_err());
    }

    #[tokio::test]
    async fn test_unfinished_and_list() {
        let store = store().await;
        let mut done = job("done");
        done.status = BatchJobStatus::Cancelled;
        store.insert(&done).await.unwrap();
        let mut running = job("running");
        running.status = BatchJobStatus::Running;
        store.insert(&running).await.unwrap();

        let unfinished = store.unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, "running");
        assert_eq!(store.list(10).await.unwrap().len(), 2);
    }
}
