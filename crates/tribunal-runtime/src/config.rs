//! Runtime configuration.
//!
//! Durations are written in human-readable form (`"30s"`, `"1m 30s"`) or
//! as a plain number of seconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resilience::CircuitBreakerConfig;
use crate::RuntimeError;

/// What a run does when a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Abort on the first unrecoverable error, returning the partial state.
    FailFast,
    /// Substitute placeholders and degraded sentinels, then carry on.
    #[default]
    Resilient,
}

/// Configuration for a [`RunOrchestrator`](crate::RunOrchestrator).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub fail_mode: FailMode,

    /// Upper bound on concurrently running tasks within a stage
    pub max_concurrency: usize,

    /// Deadline for a single collector run
    #[serde(with = "duration_str")]
    pub collector_timeout: Duration,

    /// Deadline for a single reasoning call
    #[serde(with = "duration_str")]
    pub evaluator_timeout: Duration,

    /// Extra collector runs after a failure
    pub collector_retries: u32,

    /// Re-elicitations after malformed evaluator output
    pub coercion_retries: u32,

    pub retry: RetryConfig,

    pub circuit_breaker: CircuitBreakerConfig,

    pub budgets: BudgetConfig,

    pub cache: CacheConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::Resilient,
            max_concurrency: 4,
            collector_timeout: Duration::from_secs(60),
            evaluator_timeout: Duration::from_secs(30),
            collector_retries: 1,
            coercion_retries: 2,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            budgets: BudgetConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
        let config: RuntimeConfig = serde_json::from_str(json)
            .map_err(|e| RuntimeError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_mode = FailMode::FailFast;
        self
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_concurrency == 0 {
            return Err(RuntimeError::Configuration(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.collector_timeout.is_zero() || self.evaluator_timeout.is_zero() {
            return Err(RuntimeError::Configuration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_delay < self.retry.min_delay {
            return Err(RuntimeError::Configuration(
                "retry.max_delay must be >= retry.min_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Exponential backoff between retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "duration_str")]
    pub min_delay: Duration,

    #[serde(with = "duration_str")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryConfig {
    pub(crate) fn backoff(&self, max_times: u32) -> backon::ExponentialBuilder {
        backon::ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(max_times as usize)
    }
}

/// Token budgets for reasoning calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub global_max_tokens: u32,

    pub per_role_max_tokens: u32,

    /// Estimated cost of one call; splits the global budget and admits calls
    pub estimated_tokens_per_call: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            global_max_tokens: 200_000,
            per_role_max_tokens: 80_000,
            estimated_tokens_per_call: 1_500,
        }
    }
}

/// Opinion cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    pub max_entries: u64,

    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Serde helper: durations as humantime strings, or integer seconds.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Secs(secs) => Ok(Duration::from_secs(secs)),
            Repr::Text(text) => humantime::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}
