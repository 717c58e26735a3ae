use analysis_core::{BusinessType, ConfigError};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use valuation_synthesizer::{ModelAssumptions, PresetTable};

pub const POLYGON: &str = "polygon";
pub const YAHOO: &str = "yahoo";
pub const ALPHA_VANTAGE: &str = "alpha_vantage";
pub const KNOWN_PROVIDERS: [&str; 3] = [POLYGON, YAHOO, ALPHA_VANTAGE];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Storage
    pub database_url: String,

    // Providers, in fallback order
    pub provider_order: Vec<String>,
    pub polygon_api_key: Option<String>,
    pub alpha_vantage_api_key: Option<String>,

    // Requests per minute
    pub polygon_rate_limit: usize,
    pub yahoo_rate_limit: usize,
    pub alpha_vantage_rate_limit: usize,
    pub rate_limit_wait_timeout: Duration,

    pub provider_timeout: Duration,
    pub provider_failure_threshold: u32,
    pub provider_cooldown: Duration,

    // Batch
    pub batch_concurrency: usize,
    pub retry_failed: bool,

    // Cache writes
    pub cache_write_retries: u32,
    pub cache_write_backoff: Duration,

    // Valuation
    pub presets: PresetTable,
    pub assumptions: ModelAssumptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:valuations.db".to_string(),
            provider_order: KNOWN_PROVIDERS.iter().map(|p| p.to_string()).collect(),
            polygon_api_key: None,
            alpha_vantage_api_key: None,
            polygon_rate_limit: 5,
            yahoo_rate_limit: 60,
            alpha_vantage_rate_limit: 5,
            rate_limit_wait_timeout: Duration::from_secs(30),
            provider_timeout: Duration::from_secs(20),
            provider_failure_threshold: 3,
            provider_cooldown: Duration::from_secs(300),
            batch_concurrency: 4,
            retry_failed: false,
            cache_write_retries: 3,
            cache_write_backoff: Duration::from_millis(100),
            presets: PresetTable::default(),
            assumptions: ModelAssumptions::default(),
        }
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            })
        }
        _ => Ok(default),
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl EngineConfig {
    /// Read configuration from the process environment (after `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let provider_order = match non_empty(&lookup, "PROVIDER_ORDER") {
            Some(raw) => raw
                .split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            None => defaults.provider_order,
        };

        let mut presets = PresetTable::default();
        for (key, business_type) in [
            ("PRESET_GROWTH", BusinessType::Growth),
            ("PRESET_MATURE", BusinessType::Mature),
            ("PRESET_ASSET_HEAVY", BusinessType::AssetHeavy),
            ("PRESET_DISTRESSED", BusinessType::Distressed),
        ] {
            if let Some(raw) = non_empty(&lookup, key) {
                presets.set_from_str(business_type, &raw)?;
            }
        }

        let config = Self {
            database_url: non_empty(&lookup, "DATABASE_URL").unwrap_or(defaults.database_url),
            provider_order,
            polygon_api_key: non_empty(&lookup, "POLYGON_API_KEY"),
            alpha_vantage_api_key: non_empty(&lookup, "ALPHA_VANTAGE_API_KEY"),

            polygon_rate_limit: parse_or(
                &lookup,
                "POLYGON_RATE_LIMIT",
                defaults.polygon_rate_limit,
            )?,
            yahoo_rate_limit: parse_or(&lookup, "YAHOO_RATE_LIMIT", defaults.yahoo_rate_limit)?,
            alpha_vantage_rate_limit: parse_or(
                &lookup,
                "ALPHA_VANTAGE_RATE_LIMIT",
                defaults.alpha_vantage_rate_limit,
            )?,
            rate_limit_wait_timeout: Duration::from_secs(parse_or(
                &lookup,
                "RATE_LIMIT_WAIT_TIMEOUT_SECS",
                defaults.rate_limit_wait_timeout.as_secs(),
            )?),

            provider_timeout: Duration::from_secs(parse_or(
                &lookup,
                "PROVIDER_TIMEOUT_SECS",
                defaults.provider_timeout.as_secs(),
            )?),
            provider_failure_threshold: parse_or(
                &lookup,
                "PROVIDER_FAILURE_THRESHOLD",
                defaults.provider_failure_threshold,
            )?,
            provider_cooldown: Duration::from_secs(parse_or(
                &lookup,
                "PROVIDER_COOLDOWN_SECS",
                defaults.provider_cooldown.as_secs(),
            )?),

            batch_concurrency: parse_or(&lookup, "BATCH_CONCURRENCY", defaults.batch_concurrency)?,
            retry_failed: parse_or(&lookup, "RETRY_FAILED", defaults.retry_failed)?,

            cache_write_retries: parse_or(
                &lookup,
                "CACHE_WRITE_RETRIES",
                defaults.cache_write_retries,
            )?,
            cache_write_backoff: Duration::from_millis(parse_or(
                &lookup,
                "CACHE_WRITE_BACKOFF_MS",
                defaults.cache_write_backoff.as_millis() as u64,
            )?),

            presets,
            assumptions: ModelAssumptions {
                discount_rate: parse_or(
                    &lookup,
                    "DISCOUNT_RATE",
                    defaults.assumptions.discount_rate,
                )?,
                terminal_growth: parse_or(
                    &lookup,
                    "TERMINAL_GROWTH",
                    defaults.assumptions.terminal_growth,
                )?,
                tax_rate: parse_or(&lookup, "TAX_RATE", defaults.assumptions.tax_rate)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Providers from `provider_order` that have the credentials they need.
    pub fn active_providers(&self) -> Vec<String> {
        self.provider_order
            .iter()
            .filter(|name| match name.as_str() {
                POLYGON => self.polygon_api_key.is_some(),
                ALPHA_VANTAGE => self.alpha_vantage_api_key.is_some(),
                _ => true,
            })
            .cloned()
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(unknown) = self
            .provider_order
            .iter()
            .find(|p| !KNOWN_PROVIDERS.contains(&p.as_str()))
        {
            return Err(ConfigError::UnknownProvider(unknown.clone()));
        }
        if self.active_providers().is_empty() {
            return Err(ConfigError::NoProviders);
        }

        let invalid = |key: &str, value: String| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        };

        if self.batch_concurrency == 0 {
            return Err(invalid("BATCH_CONCURRENCY", "0".into()));
        }
        for (key, limit) in [
            ("POLYGON_RATE_LIMIT", self.polygon_rate_limit),
            ("YAHOO_RATE_LIMIT", self.yahoo_rate_limit),
            ("ALPHA_VANTAGE_RATE_LIMIT", self.alpha_vantage_rate_limit),
        ] {
            if limit == 0 {
                return Err(invalid(key, "0".into()));
            }
        }

        let a = &self.assumptions;
        if !(a.discount_rate > 0.0 && a.discount_rate < 1.0) {
            return Err(invalid("DISCOUNT_RATE", a.discount_rate.to_string()));
        }
        if !(a.terminal_growth < a.discount_rate) {
            return Err(invalid("TERMINAL_GROWTH", a.terminal_growth.to_string()));
        }
        if !(0.0..1.0).contains(&a.tax_rate) {
            return Err(invalid("TAX_RATE", a.tax_rate.to_string()));
        }

        Ok(())
    }

    pub fn rate_limit_for(&self, provider: &str) -> Option<usize> {
        match provider {
            POLYGON => Some(self.polygon_rate_limit),
            YAHOO => Some(self.yahoo_rate_limit),
            ALPHA_VANTAGE => Some(self.alpha_vantage_rate_limit),
            _ => None,
        }
    }
}
