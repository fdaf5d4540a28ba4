use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub const ENV_PREFIX: &str = "TANDEM_";

/// Bounded exponential backoff between phase retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// ±25% random variation
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// No waiting between attempts, handy for tests
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            jitter: false,
        }
    }
}

/// Values the coordination core consumes. Format and source are the host's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Admission ceiling for in-flight workflows
    pub max_concurrent_workflows: usize,

    /// Maximum record count of the short-term memory tier
    pub short_term_capacity: usize,

    /// Expiry applied to short-term puts that don't carry their own
    pub short_term_ttl_ms: Option<u64>,

    /// Phase deadline when the phase doesn't declare one
    pub default_phase_timeout_ms: u64,

    /// Total attempts per phase, the first one included
    pub max_retries: u32,

    /// Bounded queue length per bus subscriber
    pub bus_queue_size: usize,

    /// Handler invocations per event before the delivery counts as failed
    pub bus_max_delivery_attempts: u32,

    /// Finished workflows kept queryable by the engine and the metrics
    /// collector; the oldest are forgotten first
    pub max_finished_workflows: usize,

    pub backoff: BackoffConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            short_term_capacity: 1000,
            short_term_ttl_ms: None,
            default_phase_timeout_ms: 30_000, // 30 seconds
            max_retries: 3,
            bus_queue_size: 1024,
            bus_max_delivery_attempts: 3,
            max_finished_workflows: 1000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Defaults, then `.env`, then `TANDEM_*` variables
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let config = Self::default().apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        info!("Loaded coordinator configuration from: {}", path.display());
        Ok(config)
    }

    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_override("MAX_CONCURRENT_WORKFLOWS")? {
            self.max_concurrent_workflows = v;
        }
        if let Some(v) = env_override("SHORT_TERM_CAPACITY")? {
            self.short_term_capacity = v;
        }
        if let Some(v) = env_override("SHORT_TERM_TTL_MS")? {
            self.short_term_ttl_ms = Some(v);
        }
        if let Some(v) = env_override("PHASE_TIMEOUT_MS")? {
            self.default_phase_timeout_ms = v;
        }
        if let Some(v) = env_override("MAX_RETRIES")? {
            self.max_retries = v;
        }
        if let Some(v) = env_override("BUS_QUEUE_SIZE")? {
            self.bus_queue_size = v;
        }
        if let Some(v) = env_override("MAX_FINISHED_WORKFLOWS")? {
            self.max_finished_workflows = v;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_workflows == 0 {
            bail!("max_concurrent_workflows must be greater than 0");
        }
        if self.short_term_capacity == 0 {
            bail!("short_term_capacity must be greater than 0");
        }
        if self.default_phase_timeout_ms == 0 {
            bail!("default_phase_timeout_ms must be greater than 0");
        }
        if self.max_retries == 0 {
            bail!("max_retries must allow at least one attempt");
        }
        if self.bus_queue_size == 0 {
            bail!("bus_queue_size must be greater than 0");
        }
        if self.bus_max_delivery_attempts == 0 {
            bail!("bus_max_delivery_attempts must be greater than 0");
        }
        if self.max_finished_workflows == 0 {
            bail!("max_finished_workflows must be greater than 0");
        }
        if self.backoff.multiplier < 1.0 {
            bail!(
                "backoff multiplier must be at least 1.0, got {}",
                self.backoff.multiplier
            );
        }
        if self.backoff.initial_delay_ms > self.backoff.max_delay_ms {
            bail!("backoff initial_delay_ms exceeds max_delay_ms");
        }
        Ok(())
    }

    pub fn default_phase_timeout(&self) -> Duration {
        Duration::from_millis(self.default_phase_timeout_ms)
    }

    pub fn short_term_ttl(&self) -> Option<Duration> {
        self.short_term_ttl_ms.map(Duration::from_millis)
    }
}

fn env_override<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match env::var(&key) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", key, raw, e))?;
            debug!(variable = %key, "Applied environment override");
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}
