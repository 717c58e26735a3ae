use analysis_core::ProviderOutcome;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct ProviderHealth {
    consecutive_failures: u32,
    tripped_at: Option<Instant>,
}

/// Point-in-time view of one provider's health
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthSnapshot {
    pub provider: String,
    pub consecutive_failures: u32,
    pub skipping: bool,
}

/// Rolling consecutive-failure counter per provider.
///
/// A provider that reaches `failure_threshold` consecutive failures is skipped
/// until `cooldown` has elapsed since its last failure, then re-probed.
pub struct HealthTracker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<HashMap<String, ProviderHealth>>,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn is_tripped(&self, health: &ProviderHealth, now: Instant) -> bool {
        match health.tripped_at {
            Some(at) => {
                health.consecutive_failures >= self.failure_threshold
                    && now.duration_since(at) < self.cooldown
            }
            None => false,
        }
    }

    pub fn should_skip(&self, provider: &str) -> bool {
        let state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state
            .get(provider)
            .map_or(false, |h| self.is_tripped(h, Instant::now()))
    }

    pub fn record(&self, provider: &str, outcome: ProviderOutcome) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let health = state.entry(provider.to_string()).or_default();

        match outcome {
            ProviderOutcome::Success => {
                if health.tripped_at.is_some() {
                    tracing::info!("Provider {} recovered", provider);
                }
                health.consecutive_failures = 0;
                health.tripped_at = None;
            }
            ProviderOutcome::RateLimited | ProviderOutcome::TransientError => {
                health.consecutive_failures += 1;
                if health.consecutive_failures >= self.failure_threshold {
                    if health.tripped_at.is_none() {
                        tracing::warn!(
                            "Provider {} failed {} times in a row, skipping for {}s",
                            provider,
                            health.consecutive_failures,
                            self.cooldown.as_secs()
                        );
                    }
                    health.tripped_at = Some(Instant::now());
                }
            }
            // A coverage gap says nothing about availability; leave the streak as is
            ProviderOutcome::NotFound | ProviderOutcome::Skipped => {}
        }
    }

    pub fn snapshot(&self) -> Vec<ProviderHealthSnapshot> {
        let state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let mut out: Vec<ProviderHealthSnapshot> = state
            .iter()
            .map(|(name, h)| ProviderHealthSnapshot {
                provider: name.clone(),
                consecutive_failures: h.consecutive_failures,
                skipping: self.is_tripped(h, now),
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }
}
