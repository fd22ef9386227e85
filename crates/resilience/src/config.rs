//! Resilience configuration
//!
//! Read once at process start and not reloadable. Values come from the
//! built-in defaults, then an optional TOML/JSON file, then environment
//! variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `SWAPDESK_RESILIENCE_CONFIG` | path of the config file |
//! | `SWAPDESK_QUEUE_INTERVAL_MS` | `queue.processing_interval_ms` |
//! | `SWAPDESK_QUEUE_INITIAL_DELAY_MS` | `queue.initial_delay_ms` |
//! | `SWAPDESK_QUEUE_MAX_RETRIES` | `queue.default_max_retries` |
//! | `SWAPDESK_BREAKER_FAILURE_THRESHOLD` | `circuit_breaker.failure_threshold` |
//! | `SWAPDESK_BREAKER_OPEN_TIMEOUT_MS` | `circuit_breaker.open_timeout_ms` |
//! | `SWAPDESK_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `SWAPDESK_RETRY_BASE_DELAY_MS` | `retry.base_delay_ms` |
//! | `SWAPDESK_RETRY_MAX_DELAY_MS` | `retry.max_delay_ms` |
//! | `SWAPDESK_RETRY_BACKOFF_MULTIPLIER` | `retry.backoff_multiplier` |
//! | `SWAPDESK_RETRY_JITTER` | `retry.jitter` |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::queue::QueueConfig;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Environment variable naming the config file read by [`ResilienceConfig::load`].
pub const CONFIG_PATH_ENV: &str = "SWAPDESK_RESILIENCE_CONFIG";

/// Top-level resilience configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Deferred-retry queue settings.
    pub queue: QueueSettings,
    /// Circuit breaker settings.
    pub circuit_breaker: BreakerSettings,
    /// Default retry policy.
    pub retry: RetrySettings,
}

/// `[queue]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Interval between background processing cycles, in milliseconds.
    pub processing_interval_ms: u64,
    /// Delay before the first attempt of a new entry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Backoff unit after a failed attempt, in milliseconds.
    pub base_backoff_ms: u64,
    /// Cap on the backoff, in milliseconds.
    pub max_backoff_ms: u64,
    /// Retry budget when none is given at insertion.
    pub default_max_retries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            processing_interval_ms: 10_000,
            initial_delay_ms: 5_000,
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            default_max_retries: 5,
        }
    }
}

/// `[circuit_breaker]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call, in milliseconds.
    pub open_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, open_timeout_ms: 60_000 }
    }
}

/// `[retry]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on the computed delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Whether random jitter is added to each delay.
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ResilienceConfig {
    /// Load configuration for this process.
    ///
    /// Reads the file named by `SWAPDESK_RESILIENCE_CONFIG` when set, then
    /// applies environment overrides, then validates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed, an
    /// override does not parse, or a value is out of range.
    pub fn load() -> ConfigResult<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_file(path)?,
            Err(_) => Self::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        tracing::info!(
            queue_interval_ms = config.queue.processing_interval_ms,
            breaker_threshold = config.circuit_breaker.failure_threshold,
            retry_max_attempts = config.retry.max_attempts,
            "Resilience configuration loaded"
        );
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file; missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, has another
    /// extension, or does not parse.
    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "Loading resilience configuration from file");

        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&contents),
            Some("json") => Ok(serde_json::from_str(&contents)?),
            _ => Err(ConfigError::UnsupportedFormat { path: path.to_path_buf() }),
        }
    }

    /// Parse TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] when the text does not parse.
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// See [`Self::apply_overrides`].
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] when a present value does not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "SWAPDESK_QUEUE_INTERVAL_MS", &mut self.queue.processing_interval_ms)?;
        override_parsed(&lookup, "SWAPDESK_QUEUE_INITIAL_DELAY_MS", &mut self.queue.initial_delay_ms)?;
        override_parsed(&lookup, "SWAPDESK_QUEUE_MAX_RETRIES", &mut self.queue.default_max_retries)?;
        override_parsed(
            &lookup,
            "SWAPDESK_BREAKER_FAILURE_THRESHOLD",
            &mut self.circuit_breaker.failure_threshold,
        )?;
        override_parsed(
            &lookup,
            "SWAPDESK_BREAKER_OPEN_TIMEOUT_MS",
            &mut self.circuit_breaker.open_timeout_ms,
        )?;
        override_parsed(&lookup, "SWAPDESK_RETRY_MAX_ATTEMPTS", &mut self.retry.max_attempts)?;
        override_parsed(&lookup, "SWAPDESK_RETRY_BASE_DELAY_MS", &mut self.retry.base_delay_ms)?;
        override_parsed(&lookup, "SWAPDESK_RETRY_MAX_DELAY_MS", &mut self.retry.max_delay_ms)?;
        override_parsed(
            &lookup,
            "SWAPDESK_RETRY_BACKOFF_MULTIPLIER",
            &mut self.retry.backoff_multiplier,
        )?;
        if let Some(value) = lookup("SWAPDESK_RETRY_JITTER") {
            self.retry.jitter = parse_bool("SWAPDESK_RETRY_JITTER", &value)?;
        }
        Ok(())
    }

    /// Check every section by building the component configs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for the first invalid section.
    pub fn validate(&self) -> ConfigResult<()> {
        self.queue_config().validate()?;
        self.breaker_config().validate()?;
        self.retry_policy().map(|_| ())
    }

    /// Queue configuration.
    #[must_use]
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            processing_interval: Duration::from_millis(self.queue.processing_interval_ms),
            initial_delay: Duration::from_millis(self.queue.initial_delay_ms),
            base_backoff: Duration::from_millis(self.queue.base_backoff_ms),
            max_backoff: Duration::from_millis(self.queue.max_backoff_ms),
            default_max_retries: self.queue.default_max_retries,
        }
    }

    /// Circuit breaker configuration.
    #[must_use]
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            open_timeout: Duration::from_millis(self.circuit_breaker.open_timeout_ms),
        }
    }

    /// Default retry policy with the transient-kind matchers.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the retry settings are invalid.
    pub fn retry_policy(&self) -> ConfigResult<RetryPolicy> {
        RetryPolicy::builder()
            .max_attempts(self.retry.max_attempts)
            .base_delay(Duration::from_millis(self.retry.base_delay_ms))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .backoff_multiplier(self.retry.backoff_multiplier)
            .jitter(self.retry.jitter)
            .build()
    }
}

fn override_parsed<T, F>(lookup: &F, var: &str, target: &mut T) -> ConfigResult<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(var) {
        *target = value.trim().parse().map_err(|err: T::Err| ConfigError::Env {
            var: var.to_string(),
            value: value.clone(),
            message: err.to_string(),
        })?;
    }
    Ok(())
}

fn parse_bool(var: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env {
            var: var.to_string(),
            value: value.to_string(),
            message: "expected a boolean".to_string(),
        }),
    }
}
