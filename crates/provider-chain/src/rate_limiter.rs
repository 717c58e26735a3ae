use analysis_core::{ProviderError, RequestGate};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window limiter: at most `max_requests` per `window` duration.
#[derive(Clone)]
struct SlidingWindow {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl SlidingWindow {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            max_requests: max_requests.max(1),
            window,
        }
    }

    async fn acquire(
        &self,
        provider: &str,
        started: Instant,
        deadline: Instant,
    ) -> Result<(), ProviderError> {
        loop {
            let mut ts = self.timestamps.lock().await;
            let now = Instant::now();

            // Remove timestamps outside the window
            while let Some(&front) = ts.front() {
                if now.duration_since(front) >= self.window {
                    ts.pop_front();
                } else {
                    break;
                }
            }

            if ts.len() < self.max_requests {
                ts.push_back(now);
                return Ok(());
            }

            // Wait for the oldest request to leave the window, unless that is past the deadline
            let wait_until = match ts.front() {
                Some(&oldest) => oldest + self.window,
                None => now,
            };
            drop(ts);

            if wait_until > deadline {
                return Err(ProviderError::RateLimitTimeout {
                    provider: provider.to_string(),
                    waited: now.duration_since(started),
                });
            }

            tracing::debug!(
                "Rate limiter: waiting {:.1}s for {} slot",
                wait_until.duration_since(now).as_secs_f64(),
                provider
            );
            tokio::time::sleep_until(wait_until).await;
        }
    }
}

/// Proof that a request slot was granted
#[derive(Debug, Clone)]
pub struct RatePermit {
    pub provider: String,
    pub waited: Duration,
}

/// Per-provider request gate shared by every worker.
///
/// Providers without a configured limit are not throttled.
pub struct RateLimiter {
    limits: DashMap<String, SlidingWindow>,
    wait_timeout: Duration,
}

impl RateLimiter {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            limits: DashMap::new(),
            wait_timeout,
        }
    }

    /// Register (or replace) a requests-per-minute budget for a provider
    pub fn with_limit(self, provider: &str, requests_per_minute: usize) -> Self {
        self.set_limit(provider, requests_per_minute, Duration::from_secs(60));
        self
    }

    pub fn set_limit(&self, provider: &str, max_requests: usize, window: Duration) {
        self.limits
            .insert(provider.to_string(), SlidingWindow::new(max_requests, window));
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Suspend until a slot for `provider` is free, or fail with `RateLimitTimeout`.
    pub async fn acquire(&self, provider: &str) -> Result<RatePermit, ProviderError> {
        let started = Instant::now();
        // Clone out of the map so no shard lock is held across the await
        let window = self.limits.get(provider).map(|w| w.clone());

        if let Some(window) = window {
            window
                .acquire(provider, started, started + self.wait_timeout)
                .await?;
        }

        Ok(RatePermit {
            provider: provider.to_string(),
            waited: started.elapsed(),
        })
    }
}

/// Adapters call this once per HTTP request, so multi-request fetches spend
/// one slot per request.
#[async_trait]
impl RequestGate for RateLimiter {
    async fn admit(&self, provider: &str) -> Result<(), ProviderError> {
        self.acquire(provider).await.map(|_| ())
    }
}
