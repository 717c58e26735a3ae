use crate::error::OrchestratorError;
use crate::job_store::{JobStore, TickerProgress};
use crate::pipeline::{AnalysisPipeline, Refresh};
use analysis_core::{normalize_ticker_list, BatchJob, BatchJobStatus, BatchOptions};
use chrono::{NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    /// Worker pool size when a job does not override it
    pub concurrency: usize,
    /// Default for `BatchOptions::retry_failed` on `start_batch`
    pub retry_failed: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry_failed: false,
        }
    }
}

struct ActiveJob {
    cancel: Arc<AtomicBool>,
    finished: watch::Receiver<Option<BatchJob>>,
}

/// A job's entry in the active map. Dropping it frees the entry, including
/// when the driver panics, so the job can be resumed or recovered.
pub(crate) struct ActiveSlot {
    active: Arc<DashMap<String, ActiveJob>>,
    job_id: String,
    cancel: Arc<AtomicBool>,
    finished: watch::Sender<Option<BatchJob>>,
}

impl ActiveSlot {
    /// Free the slot, then hand the final job state to waiters.
    fn complete(self, job: BatchJob) {
        self.active.remove(&self.job_id);
        let _ = self.finished.send(Some(job));
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.active.remove(&self.job_id);
    }
}

/// Drives batch jobs: a bounded worker pool per job, one progress recorder,
/// durable per-ticker progress so an interrupted job resumes where it stopped.
#[derive(Clone)]
pub struct BatchOrchestrator {
    pipeline: Arc<AnalysisPipeline>,
    jobs: JobStore,
    settings: BatchSettings,
    active: Arc<DashMap<String, ActiveJob>>,
}

impl BatchOrchestrator {
    pub fn new(pipeline: Arc<AnalysisPipeline>, jobs: JobStore, settings: BatchSettings) -> Self {
        Self {
            pipeline,
            jobs,
            settings,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn pipeline(&self) -> &Arc<AnalysisPipeline> {
        &self.pipeline
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Start a background batch for today's UTC date. Returns the job id.
    pub async fn start_batch<S: AsRef<str>>(
        &self,
        exchange: &str,
        tickers: &[S],
    ) -> Result<String, OrchestratorError> {
        let options = BatchOptions {
            retry_failed: self.settings.retry_failed,
            ..BatchOptions::default()
        };
        self.start_batch_on(exchange, tickers, Utc::now().date_naive(), options)
            .await
    }

    pub async fn start_batch_on<S: AsRef<str>>(
        &self,
        exchange: &str,
        tickers: &[S],
        date: NaiveDate,
        options: BatchOptions,
    ) -> Result<String, OrchestratorError> {
        let tickers = normalize_ticker_list(tickers);
        if tickers.is_empty() {
            return Err(OrchestratorError::EmptyTickerList);
        }

        let job = BatchJob::new(uuid::Uuid::new_v4().to_string(), exchange, date, tickers, options);
        self.jobs.insert(&job).await?;
        tracing::info!(
            "Batch {} created: {} tickers on {} for {}",
            job.id,
            job.counts.total,
            job.exchange,
            job.analysis_date
        );

        let id = job.id.clone();
        self.launch(job, Vec::new());
        Ok(id)
    }

    /// Start a batch and wait for it to finish.
    pub async fn run_batch<S: AsRef<str>>(
        &self,
        exchange: &str,
        tickers: &[S],
        date: NaiveDate,
        options: BatchOptions,
    ) -> Result<BatchJob, OrchestratorError> {
        let id = self.start_batch_on(exchange, tickers, date, options).await?;
        self.wait_for(&id).await
    }

    /// Wait until a job driven by this orchestrator finishes; other jobs
    /// return their stored state.
    pub async fn wait_for(&self, job_id: &str) -> Result<BatchJob, OrchestratorError> {
        let receiver = self.active.get(job_id).map(|a| a.finished.clone());
        let finished = match receiver {
            Some(mut rx) => rx
                .wait_for(|job| job.is_some())
                .await
                .ok()
                .and_then(|job| (*job).clone()),
            None => None,
        };
        match finished {
            Some(job) => Ok(job),
            None => self.get_batch_status(job_id).await,
        }
    }

    pub async fn get_batch_status(&self, job_id: &str) -> Result<BatchJob, OrchestratorError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
    }

    pub async fn list_jobs(&self, limit: u32) -> Result<Vec<BatchJob>, OrchestratorError> {
        Ok(self.jobs.list(limit).await?)
    }

    /// Stop dispatching new tickers; in-flight tickers finish and are recorded.
    pub async fn cancel_batch(&self, job_id: &str) -> Result<(), OrchestratorError> {
        let cancel = self.active.get(job_id).map(|a| a.cancel.clone());
        if let Some(cancel) = cancel {
            tracing::info!("Cancellation requested for batch {}", job_id);
            cancel.store(true, Ordering::SeqCst);
            return Ok(());
        }

        // Not running here: an interrupted job is closed out directly
        let mut job = self.get_batch_status(job_id).await?;
        if job.status.is_terminal() {
            return Ok(());
        }
        job.status = BatchJobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.jobs.update(&job).await?;
        tracing::info!("Batch {} cancelled while not running", job_id);
        Ok(())
    }

    /// Continue an unfinished job, skipping tickers that already have progress.
    pub async fn resume_batch(&self, job_id: &str) -> Result<(), OrchestratorError> {
        if self.active.contains_key(job_id) {
            return Ok(());
        }
        let job = self.get_batch_status(job_id).await?;
        if job.status.is_terminal() {
            return Err(OrchestratorError::NotResumable {
                id: job.id,
                status: job.status.as_str().to_string(),
            });
        }
        let done = self.jobs.progress_for(job_id).await?;
        self.launch(job, done);
        Ok(())
    }

    /// Resume every job left `Created` or `Running` by a previous process.
    pub async fn recover_interrupted(&self) -> Result<Vec<String>, OrchestratorError> {
        let mut resumed = Vec::new();
        for job in self.jobs.unfinished().await? {
            if self.active.contains_key(&job.id) {
                continue;
            }
            tracing::info!(
                "Recovering interrupted batch {} ({}/{} processed)",
                job.id,
                job.counts.processed,
                job.counts.total
            );
            let done = self.jobs.progress_for(&job.id).await?;
            let id = job.id.clone();
            if self.launch(job, done) {
                resumed.push(id);
            }
        }
        Ok(resumed)
    }

    /// Spawn the driver for a job unless one is already running. Returns whether it spawned.
    fn launch(&self, job: BatchJob, done: Vec<TickerProgress>) -> bool {
        let Some(slot) = self.claim(&job.id) else {
            return false;
        };
        let cancel = slot.cancel.clone();

        let this = self.clone();
        tokio::spawn(async move {
            let finished = this.drive(job, done, cancel).await;
            slot.complete(finished);
        });
        true
    }

    /// Mark a job as driven by this orchestrator. `None` if it already is.
    pub(crate) fn claim(&self, job_id: &str) -> Option<ActiveSlot> {
        let cancel = Arc::new(AtomicBool::new(false));
        let (finished_tx, finished_rx) = watch::channel(None);

        match self.active.entry(job_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                entry.insert(ActiveJob {
                    cancel: cancel.clone(),
                    finished: finished_rx,
                });
                Some(ActiveSlot {
                    active: Arc::clone(&self.active),
                    job_id: job_id.to_string(),
                    cancel,
                    finished: finished_tx,
                })
            }
        }
    }

    async fn drive(
        &self,
        mut job: BatchJob,
        done: Vec<TickerProgress>,
        cancel: Arc<AtomicBool>,
    ) -> BatchJob {
        // Counters are rebuilt from durable progress, never trusted from the job row
        let listed: HashSet<&String> = job.ticker_list.iter().collect();
        let done: Vec<TickerProgress> = done
            .into_iter()
            .filter(|p| listed.contains(&p.ticker))
            .collect();
        let finished: HashSet<String> = done.iter().map(|p| p.ticker.clone()).collect();
        job.counts.processed = done.len() as u64;
        job.counts.succeeded = done.iter().filter(|p| p.succeeded).count() as u64;
        job.counts.failed = job.counts.processed - job.counts.succeeded;

        job.status = BatchJobStatus::Running;
        job.completed_at = None;
        job.error_message = None;
        if let Err(e) = self.jobs.update(&job).await {
            let message = format!("Could not mark job running: {}", e);
            return self.finish(job, BatchJobStatus::Failed, Some(message)).await;
        }

        let refresh = if job.options.force_refresh {
            Refresh::Always
        } else if job.options.retry_failed {
            Refresh::FailedOnly
        } else {
            Refresh::Never
        };
        let date = job.analysis_date;
        let exchange = job.exchange.clone();
        let pending: Vec<String> = job
            .ticker_list
            .iter()
            .filter(|t| !finished.contains(*t))
            .cloned()
            .collect();

        let concurrency = job
            .options
            .concurrency
            .unwrap_or(self.settings.concurrency)
            .max(1);
        let halt = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<TickerProgress>(concurrency * 2);
        let snapshot = job.clone();
        let recorder = tokio::spawn(record_outcomes(self.jobs.clone(), job, rx, halt.clone()));

        // Same-day cache hits are recorded without dispatching to a worker
        let cached = if refresh == Refresh::Always || pending.is_empty() {
            HashMap::new()
        } else {
            self.pipeline
                .cache()
                .get_many(&pending, date)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(
                        "Bulk cache lookup failed, workers will check per ticker: {}",
                        e
                    );
                    HashMap::new()
                })
        };

        let mut queue = VecDeque::with_capacity(pending.len());
        for ticker in pending {
            if cancel.load(Ordering::SeqCst) || halt.load(Ordering::SeqCst) {
                break;
            }
            match cached.get(&ticker) {
                Some(result) if refresh.serves(result) => {
                    let progress = TickerProgress {
                        succeeded: !result.is_failed(),
                        from_cache: true,
                        error_message: result.error_message.clone(),
                        recorded_at: Utc::now(),
                        ticker,
                    };
                    if tx.send(progress).await.is_err() {
                        break;
                    }
                }
                _ => queue.push_back(ticker),
            }
        }

        let workers_needed = concurrency.min(queue.len());
        tracing::info!(
            "Batch {} running: {} to analyze, {} workers",
            snapshot.id,
            queue.len(),
            workers_needed
        );

        let queue = Arc::new(Mutex::new(queue));
        let mut workers = Vec::with_capacity(workers_needed);
        for _ in 0..workers_needed {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let pipeline = Arc::clone(&self.pipeline);
            let cancel = Arc::clone(&cancel);
            let halt = Arc::clone(&halt);
            let exchange = exchange.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    // Checked between tickers; an in-flight ticker always completes
                    if cancel.load(Ordering::SeqCst) || halt.load(Ordering::SeqCst) {
                        break;
                    }
                    let next = {
                        let mut q = match queue.lock() {
                            Ok(q) => q,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        q.pop_front()
                    };
                    let Some(ticker) = next else { break };

                    let outcome = pipeline
                        .analyze_with(&ticker, Some(&exchange), date, refresh)
                        .await;
                    let progress = TickerProgress {
                        ticker,
                        succeeded: !outcome.result.is_failed(),
                        from_cache: outcome.from_cache,
                        error_message: outcome.result.error_message,
                        recorded_at: Utc::now(),
                    };
                    if tx.send(progress).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        let mut panicked = 0usize;
        for worker in workers {
            if let Err(e) = worker.await {
                if e.is_panic() {
                    tracing::error!("Batch {} worker panicked: {}", snapshot.id, e);
                    panicked += 1;
                }
            }
        }

        let (job, store_error) = match recorder.await {
            Ok(recorded) => recorded,
            Err(e) => (snapshot, Some(format!("progress recorder stopped: {}", e))),
        };

        let (status, message) = if let Some(e) = store_error {
            (BatchJobStatus::Failed, Some(format!("Progress store failed: {}", e)))
        } else if panicked > 0 {
            (BatchJobStatus::Failed, Some(format!("{} worker(s) panicked", panicked)))
        } else if job.counts.processed >= job.counts.total {
            (BatchJobStatus::Completed, None)
        } else if cancel.load(Ordering::SeqCst) {
            (BatchJobStatus::Cancelled, None)
        } else {
            let message = format!(
                "Stopped with {} of {} tickers processed",
                job.counts.processed, job.counts.total
            );
            (BatchJobStatus::Failed, Some(message))
        };

        self.finish(job, status, message).await
    }

    async fn finish(
        &self,
        mut job: BatchJob,
        status: BatchJobStatus,
        error_message: Option<String>,
    ) -> BatchJob {
        job.status = status;
        job.error_message = error_message;
        job.completed_at = Some(Utc::now());

        if let Err(e) = self.jobs.update(&job).await {
            tracing::error!("Could not persist final state of batch {}: {}", job.id, e);
        }

        match &job.error_message {
            Some(e) => tracing::error!("Batch {} {}: {}", job.id, job.status.as_str(), e),
            None => tracing::info!(
                "Batch {} {}: {}/{} processed, {} succeeded, {} failed",
                job.id,
                job.status.as_str(),
                job.counts.processed,
                job.counts.total,
                job.counts.succeeded,
                job.counts.failed
            ),
        }
        job
    }
}

/// Single writer for a job's counters: applies and persists one outcome at a time.
///
/// On a store failure it raises `halt`, stops persisting and keeps draining so
/// workers never block on a full channel.
async fn record_outcomes(
    jobs: JobStore,
    mut job: BatchJob,
    mut rx: mpsc::Receiver<TickerProgress>,
    halt: Arc<AtomicBool>,
) -> (BatchJob, Option<String>) {
    let mut store_error = None;

    while let Some(progress) = rx.recv().await {
        if store_error.is_some() {
            continue;
        }

        let mut counts = job.counts;
        counts.processed += 1;
        if progress.succeeded {
            counts.succeeded += 1;
        } else {
            counts.failed += 1;
        }
        let previous = std::mem::replace(&mut job.counts, counts);

        if let Err(e) = jobs.record_progress(&job, &progress).await {
            tracing::error!("Batch {}: could not record {}: {}", job.id, progress.ticker, e);
            job.counts = previous;
            store_error = Some(e.to_string());
            halt.store(true, Ordering::SeqCst);
            continue;
        }

        let status = match (progress.succeeded, progress.from_cache) {
            (true, true) => "cached".to_string(),
            (true, false) => "ok".to_string(),
            (false, cached) => format!(
                "failed{}: {}",
                if cached { " (cached)" } else { "" },
                progress.error_message.as_deref().unwrap_or("unknown error")
            ),
        };
        tracing::info!(
            "[{}/{}] {} => {}",
            job.counts.processed,
            job.counts.total,
            progress.ticker,
            status
        );
    }

    (job, store_error)
}
